//! Error types for the relay protocol.

use thiserror::Error;

/// Errors raised while decoding or validating events.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result type for protocol operations.
pub type RelayResult<T> = Result<T, RelayError>;
