//! Error types for the persona proxy pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failures talking to the generative backend. Always absorbed by the orchestrator.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend timed out after {0}s")]
    Timeout(u64),

    #[error("backend returned {0}: {1}")]
    Status(u16, String),

    #[error("backend response parse: {0}")]
    Decode(String),
}

/// Failures from a session or fact store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration could not be loaded or failed validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config load: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Unexpected internal fault at the orchestrator boundary.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("internal: {0}")]
    Internal(String),
}
