//! Compression errors.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A decoder or encoder could not be set up, usually because the stream
    /// header is not what the format expects.
    #[display("could not initialize codec")]
    Encoder,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        false
    }
}
