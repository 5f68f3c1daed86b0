//! Transfer error types.

use ferry_storage::StorageError;
use thiserror::Error;

/// Errors from cache resolution and transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("input reference not found: {0:?}")]
    MissingReference(String),

    #[error("reference is a directory, expected a file: {0}")]
    NotAFile(String),

    #[error("path escapes storage root: {0}")]
    PathEscape(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transfer failed for {reference}: {source}")]
    Transfer {
        reference: String,
        #[source]
        source: StorageError,
    },

    #[error("http fetch failed for {reference}: {source}")]
    Http {
        reference: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Wrap a storage error, keeping the reference it concerned and
    /// lifting the jail/cache taxonomy variants through unchanged.
    pub(crate) fn from_storage(reference: &str, source: StorageError) -> Self {
        match source {
            StorageError::PathEscape(path) => TransferError::PathEscape(path),
            StorageError::NotAFile(path) => TransferError::NotAFile(path),
            other => TransferError::Transfer {
                reference: reference.to_string(),
                source: other,
            },
        }
    }
}

/// Result type for transfer operations.
pub type TransferResult<T> = std::result::Result<T, TransferError>;
