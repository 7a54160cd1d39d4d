//! Error types for the [`migrate`](super) module.
//!
//! Every variant tells the supervisor how to finalize a job:
//! - [`ErrorKind::Cancelled`]: the partial destination is already gone;
//!   leave the pending move for whoever asked for the cancellation.
//! - [`ErrorKind::NotFound`]: the source vanished; purge the pending move and
//!   the comic record.
//! - anything else is fatal: purge as for `NotFound`, no retry.

use derive_more::{Display, Error};
use shelf_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};
use std::path::PathBuf;

/// A migration error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The source archive doesn't exist.
    #[display("source not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Cancellation was requested and observed at a checkpoint.
    #[display("migration cancelled")]
    Cancelled,
    /// The source isn't a format any strategy handles.
    #[display("unsupported source format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// The source is corrupt or doesn't contain what its format promises.
    #[display("invalid archive")]
    InvalidArchive,
    /// Reading, writing or re-compressing failed part-way.
    #[display("transfer failed")]
    Transfer,
}

impl ErrorKind {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` if retrying might succeed.
    ///
    /// Jobs are never retried within a process; an interrupted job is picked
    /// up again by recovery on the next start.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Re-raise a storage failure, keeping cancellation distinguishable.
#[track_caller]
pub(crate) fn from_storage(err: StorageError) -> Error {
    let kind = match &*err {
        StorageErrorKind::Cancelled => ErrorKind::Cancelled,
        StorageErrorKind::Truncated { .. } => ErrorKind::InvalidArchive,
        _ => ErrorKind::Transfer,
    };
    err.raise(kind)
}
