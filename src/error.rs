//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Admission checks never return this type: store trouble during a check is
/// absorbed by the engine's degraded mode. These errors only come out of
/// startup paths such as loading configuration or joining the mesh.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store setup errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Errors reported by a [`CounterStore`](crate::store::CounterStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend does not offer this operation.
    #[error("operation not supported by this store")]
    Unsupported,

    /// Increment was called on a key that does not exist.
    #[error("key does not exist")]
    KeyMissing,

    /// The backend could not be reached or refused the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the deadline.
    #[error("store call timed out")]
    Timeout,
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
