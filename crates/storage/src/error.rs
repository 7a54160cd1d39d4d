//! Storage Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File does not exist
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Another process holds the file open (sharing violation).
    #[display("file in use: {}", _0.display())]
    InUse(#[error(not(source))] PathBuf),
    /// The source ended before the expected number of bytes were read.
    #[display("truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
    /// A segment didn't fit the mapped file it was meant for.
    #[display("segment {start}..{end} does not fit a {len} byte file")]
    SegmentOutOfBounds { start: u64, end: u64, len: u64 },
    /// The operation observed a cancellation request and stopped.
    #[display("cancelled")]
    Cancelled,
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}

impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Classify an I/O error against the path it happened on.
    pub fn from_io(err: IoError, path: &Path) -> Self {
        if is_transient(&err) {
            return Self::InUse(path.to_path_buf());
        }
        match err.kind() {
            IoErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            IoErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InUse(_) | Self::Io(_))
    }
}

/// Whether an I/O error is a share violation that usually clears up once a
/// reader (thumbnailer, antivirus, the reader window) lets go of the file.
pub(crate) fn is_transient(err: &IoError) -> bool {
    if matches!(err.kind(), IoErrorKind::ResourceBusy | IoErrorKind::ExecutableFileBusy) {
        return true;
    }
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32 | 33))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let path = Path::new("/library/abc.zip");
        let not_found = ErrorKind::from_io(IoError::from(IoErrorKind::NotFound), path);
        assert!(matches!(not_found, ErrorKind::NotFound(ref p) if p == path));
        let busy = ErrorKind::from_io(IoError::from(IoErrorKind::ResourceBusy), path);
        assert!(matches!(busy, ErrorKind::InUse(_)));
        assert!(busy.is_retryable());
        let denied = ErrorKind::from_io(IoError::from(IoErrorKind::PermissionDenied), path);
        assert!(!denied.is_retryable());
    }

    #[test]
    fn truncated_display() {
        let kind = ErrorKind::Truncated { expected: 10, actual: 4 };
        assert_eq!(kind.to_string(), "truncated: expected 10 bytes, got 4");
    }
}
