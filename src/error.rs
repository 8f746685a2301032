//! Error types for the Turnstile service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Empty or otherwise unusable identity / operation key
    #[error("Invalid rate limit key: {0}")]
    InvalidKey(String),

    /// No limiter is registered for the requested operation
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Counter store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
