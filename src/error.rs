//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared state store failed or timed out
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored bucket state exists but cannot be parsed
    #[error("corrupt bucket state: {0}")]
    CorruptState(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
