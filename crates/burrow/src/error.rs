//! Error and Result types for directory store operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for burrow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for directory store operations.
///
/// The enum is `Clone` because a failed background compaction is recorded
/// once and then handed back from every subsequent foreground call on the
/// poisoned writer. I/O errors are therefore carried as rendered strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The requested key or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// On-storage data failed validation (bad magic, checksum mismatch,
    /// truncated record, undecodable block).
    #[error("corruption: {0}")]
    Corruption(String),

    /// The target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission was denied by the underlying storage.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The requested operation or option combination is not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Invalid caller input, typically a bad option value or an
    /// out-of-order epoch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(String),

    /// The operation should be retried. Internal flow control only;
    /// never returned across the public API.
    #[error("try again")]
    TryAgain,

    /// An internal invariant was violated. Also serves as the sticky
    /// "already finished" sentinel returned by operations on a writer
    /// after `finish` has completed.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

impl Error {
    /// The sentinel stored into the background status once `finish` has
    /// returned, so every later operation observes a dedicated error
    /// rather than a repurposed corruption kind.
    pub(crate) fn already_finished() -> Self {
        Error::AssertionFailed("already finished".to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => Error::AccessDenied(err.to_string()),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(err.to_string()),
            _ => Error::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::NotFound(_)));

        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, Error::AccessDenied(_)));

        let err: Error = io::Error::other("disk fell off").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_sticky_error_clones_equal() {
        let original = Error::Corruption("bad block".to_string());
        let replayed = original.clone();
        assert_eq!(original, replayed);
    }

    #[test]
    fn test_already_finished_sentinel() {
        assert_eq!(
            Error::already_finished(),
            Error::AssertionFailed("already finished".to_string())
        );
    }
}
