use crate::error::{Error, ErrorKind};
use crate::models::ContentKey;
use exn::OptionExt;
use std::path::{Path, PathBuf};

/// A relocation that has been requested but not finalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMove {
    pub key: ContentKey,
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl PendingMove {
    pub fn new(key: ContentKey, source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self { key, source: source.into(), destination: destination.into() }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PendingRow {
    pub(crate) key: String,
    pub(crate) source: String,
    pub(crate) destination: String,
}

fn sqlx_hates_paths(path: &Path, field: &'static str) -> Result<String, Error> {
    Ok(path.to_str().ok_or_raise(|| ErrorKind::InvalidData(field))?.to_string())
}

impl TryFrom<&PendingMove> for PendingRow {
    type Error = Error;
    fn try_from(pending: &PendingMove) -> Result<Self, Self::Error> {
        Ok(Self {
            key: pending.key.to_string(),
            source: sqlx_hates_paths(&pending.source, "source path")?,
            destination: sqlx_hates_paths(&pending.destination, "destination path")?,
        })
    }
}

impl TryFrom<PendingRow> for PendingMove {
    type Error = Error;
    fn try_from(row: PendingRow) -> Result<Self, Self::Error> {
        Ok(Self { key: row.key.parse()?, source: row.source.into(), destination: row.destination.into() })
    }
}
