//! The categorized error type shared by every coordinator operation.

use thiserror::Error;

/// A storage coordination error.
///
/// Every fallible operation in this crate surfaces one of these categories.
/// Cache misses, absent probe files, and fragments newer than a snapshot
/// timestamp are *not* errors; they are ordinary outcomes of their
/// operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A location string failed validation.
    #[error("invalid URI: {0}")]
    InvalidUri(String),
    /// The URI scheme is not handled by any registered VFS backend.
    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),
    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The named object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// An open was attempted with a key that differs from the one the entry
    /// was established with.
    #[error("encryption key mismatch for {0}")]
    EncryptionMismatch(String),
    /// The underlying storage refused access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// An I/O error from the underlying storage.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A file lock could not be acquired or released.
    #[error("lock failure: {0}")]
    LockFailure(String),
    /// A stored document or name could not be parsed.
    #[error("parse error: {0}")]
    ParseError(String),
    /// The operation observed an in-progress cancellation and aborted.
    #[error("operation cancelled")]
    Cancelled,
    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl StorageError {
    /// Map an [`std::io::Error`] to the matching category, keeping the
    /// offending location in the message.
    pub(crate) fn from_io(err: std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(what.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(what.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(what.to_string()),
            _ => Self::IOError(err),
        }
    }
}
