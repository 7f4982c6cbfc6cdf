//! Error types for the userlimit service.

use thiserror::Error;

/// Main error type for userlimit operations.
#[derive(Error, Debug)]
pub enum UserLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Route rule file errors
    #[error("Rule error: {0}")]
    Rules(String),

    /// Bearer token signing errors
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// Window store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for UserLimitError {
    fn from(err: config::ConfigError) -> Self {
        UserLimitError::Config(err.to_string())
    }
}

/// Errors reported by a window backend.
///
/// The limiter never forwards these to the caller; its failure mode decides
/// whether the request is admitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A new bucket would exceed the configured key capacity
    #[error("window store is tracking {tracked} keys (capacity {capacity})")]
    CapacityExceeded { tracked: usize, capacity: usize },

    /// The backend is no longer accepting requests
    #[error("window store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for userlimit operations.
pub type Result<T> = std::result::Result<T, UserLimitError>;
