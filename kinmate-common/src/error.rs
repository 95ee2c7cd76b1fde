//! Common error types for Kinmate

use thiserror::Error;

/// Common result type for Kinmate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Kinmate services
///
/// Outcomes that are part of normal coordination (duplicate request, audio unit
/// already owned, not enough rounds to summarize, lost checkpoint race) are not
/// errors and never appear here.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Shared store could not be reached; fatal for the in-flight operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Classifier, assistant or summarizer failed
    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure came from the shared store rather than the caller
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Database(_) | Error::StoreUnavailable(_))
    }
}
