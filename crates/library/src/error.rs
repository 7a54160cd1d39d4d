//! Library Error Types
//!
//! Failures of the facade and the supervisor. Relocation jobs have their own
//! taxonomy in [`migrate::error`](crate::migrate::error); those never surface
//! here because the supervisor handles them where the job ends.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Reading or writing comic records or pending moves failed.
    #[display("persistent store error")]
    Store,
    /// A file-system operation outside of a relocation job failed.
    #[display("storage error")]
    Storage,
    /// The path given to import doesn't exist.
    #[display("no such file or directory: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// The path given to import isn't an archive or directory we can read.
    #[display("unsupported archive: {}", _0.display())]
    Unsupported(#[error(not(source))] PathBuf),
    /// A bundle's `metadata.json` could not be read.
    #[display("invalid bundle metadata")]
    Metadata,
    /// A reader or another job still holds the destination of a move.
    #[display("destination is in use: {}", _0.display())]
    DestinationBusy(#[error(not(source))] PathBuf),
    /// A startup unit failed or never ran.
    #[display("startup unit `{_0}` did not complete")]
    Startup(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store | Self::Storage)
    }
}
