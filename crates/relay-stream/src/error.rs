use std::io;

use thiserror::Error;

/// Failures that end a connection before it reaches steady state.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{0}")]
    InvalidSessionId(String),
    #[error("invalid replay mode")]
    InvalidReplayMode(String),
    #[error("Streaming unsupported")]
    StreamingUnsupported,
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl StreamError {
    /// True for rejections caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidSessionId(_) | Self::InvalidReplayMode(_))
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
