//! Error type shared across the workspace.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeadPulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence failure (connectivity, constraint, corrupt row).
    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The record exists but is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LeadPulseError>;
