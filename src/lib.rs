//! chatrelay: a streaming gateway between chat platforms and LLM backends.
//!
//! An inbound platform message becomes a [`jobs::Job`]; the job's
//! generation runs once on the [`worker::WorkerPool`] no matter how
//! many SSE readers attach, with output fanned out through a shared
//! store buffer by the [`stream::Multiplexer`]. Conversation history
//! is budgeted into each model's context window by [`context`].

pub mod bootstrap;
pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod jobs;
pub mod llm;
pub mod notify;
pub mod store;
pub mod stream;
pub mod worker;

pub use config::Config;
pub use error::Error;
