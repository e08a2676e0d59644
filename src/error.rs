//! Error taxonomy for the storage layer.
//!
//! Every remote call is translated into [`StorageError`] at the adapter
//! boundary, so callers match on a tag instead of digging through SDK error
//! chains. Only `NotFound` is used for control flow; the other variants are
//! surfaced to the filesystem pipeline as-is.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Object or prefix does not exist in the bucket.
    #[error("object not found")]
    NotFound,

    /// Byte-range request outside the object's bounds.
    #[error("requested byte range is not satisfiable")]
    InvalidRange,

    /// Authentication or authorization failure.
    #[error("permission denied by object store")]
    PermissionDenied,

    /// The health monitor has declared the backend unreachable; the remote
    /// call was not attempted.
    #[error("cloud endpoint is unreachable")]
    Offline,

    /// Unclassified remote error, returned unmodified after logging.
    #[error("object store error during {operation}: {message}")]
    Remote { operation: String, message: String },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Caller misuse, e.g. committing a staged block id that was never staged.
    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn remote(operation: impl Into<String>, message: impl ToString) -> Self {
        StorageError::Remote {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}
