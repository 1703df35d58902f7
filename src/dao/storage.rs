use std::{error::Error, io};
use thiserror::Error;

/// Result alias for session store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Backend-agnostic failure of a session store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl StorageError {
    /// Wrap any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Failure without an underlying backend error (e.g. a store switched off).
    pub fn offline(message: impl Into<String>) -> Self {
        let message = message.into();
        StorageError::Unavailable {
            source: Box::new(io::Error::new(io::ErrorKind::NotConnected, message.clone())),
            message,
        }
    }
}
