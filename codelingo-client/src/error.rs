//! Error types for the client binary and facade construction.

use codelingo_core::{CodelingoError, RequestError, StorageError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Codelingo(#[from] CodelingoError),
    #[error("Tracing setup failed: {0}")]
    Telemetry(String),
    #[error("Usage: {0}")]
    Usage(String),
}

impl From<RequestError> for ClientError {
    fn from(err: RequestError) -> Self {
        Self::Codelingo(err.into())
    }
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        Self::Codelingo(err.into())
    }
}
