//! Web gateway: the HTTP surface of the relay.

pub mod handlers;
pub mod server;

pub use server::{start_server, GatewayState};
