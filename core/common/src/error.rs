//! Common error types for ShelfSync.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RecordId;

/// Top-level error type for ShelfSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No connectivity; reconciliation cannot reach the remote store.
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// Remote call failed in a way that may succeed later (timeout, 5xx).
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// Remote store rejected the request (validation, not found, 4xx).
    #[error("Remote rejected request: {0}")]
    Permanent(String),

    /// Local store transaction failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The record has a pending delete and accepts no further edits.
    #[error("Record {0} is already pending deletion")]
    RecordAlreadyDeleting(RecordId),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Coarse classification of an [`Error`], for callers that render failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NetworkUnavailable,
    Transient,
    Permanent,
    StorageIo,
    RecordAlreadyDeleting,
    NotFound,
    InvalidInput,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NetworkUnavailable => ErrorKind::NetworkUnavailable,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Permanent(_) => ErrorKind::Permanent,
            Error::Storage(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::StorageIo,
            Error::RecordAlreadyDeleting(_) => ErrorKind::RecordAlreadyDeleting,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Whether a later attempt of the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkUnavailable | Error::Transient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Classified failure of a remote call.
///
/// Remote collaborators never return an unclassified error: the coordinator
/// relies on the class alone to decide between retrying and dropping an
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    /// Network failure, timeout or server-side (5xx) error.
    #[error("transient: {0}")]
    Transient(String),
    /// The remote store refused the request (4xx, validation, not found).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        RemoteError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// The message without its class prefix.
    pub fn message(&self) -> &str {
        match self {
            RemoteError::Transient(msg) | RemoteError::Permanent(msg) => msg,
        }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(msg) => Error::Transient(msg),
            RemoteError::Permanent(msg) => Error::Permanent(msg),
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Storage("disk".into()).kind(), ErrorKind::StorageIo);
        assert_eq!(Error::Serialization("bad".into()).kind(), ErrorKind::StorageIo);
        assert_eq!(
            Error::RecordAlreadyDeleting(RecordId::permanent("7")).kind(),
            ErrorKind::RecordAlreadyDeleting
        );
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(!Error::Permanent("400".into()).is_transient());
    }

    #[test]
    fn test_remote_error_conversion() {
        let err: Error = RemoteError::transient("timed out").into();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err: Error = RemoteError::permanent("404").into();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.to_string(), "Remote rejected request: 404");
    }
}
