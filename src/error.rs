//! Error types for chatrelay.

use std::time::Duration;

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Persistent key-value store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Model backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Context window exhausted: nothing fits within {limit} units")]
    ContextOverflow { limit: usize },

    #[error("Generation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Generation task aborted: {0}")]
    TaskAborted(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Stream multiplexer errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("No such job: {0}")]
    NotFound(String),

    #[error("Invalid stream key for job {0}")]
    InvalidKey(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker pool is shut down")]
    Closed,

    #[error("Invalid pool sizing: floor {floor} exceeds ceiling {ceiling}")]
    InvalidBounds { floor: usize, ceiling: usize },
}
