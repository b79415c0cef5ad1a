use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("empty payload")]
    EmptyPayload,
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("attachment not found: {0}")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl std::fmt::Display, source: io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
