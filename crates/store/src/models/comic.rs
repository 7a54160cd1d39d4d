use crate::error::{Error, ErrorKind};
use crate::models::ContentKey;
use exn::ResultExt;
use time::UtcDateTime;

/// A comic known to the library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComicRecord {
    pub key: ContentKey,
    pub title: String,
    /// Where the comic was originally found, if anywhere worth remembering.
    pub source: Option<String>,
    pub created_at: UtcDateTime,
}

impl ComicRecord {
    /// A new record keyed by its title.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self { key: ContentKey::from_title(&title), title, source: None, created_at: UtcDateTime::now() }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ComicRow {
    pub(crate) key: String,
    pub(crate) title: String,
    pub(crate) source: Option<String>,
    pub(crate) created_at: i64,
}

impl From<&ComicRecord> for ComicRow {
    fn from(comic: &ComicRecord) -> Self {
        Self {
            key: comic.key.to_string(),
            title: comic.title.clone(),
            source: comic.source.clone(),
            created_at: comic.created_at.unix_timestamp(),
        }
    }
}

impl TryFrom<ComicRow> for ComicRecord {
    type Error = Error;
    fn try_from(row: ComicRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key: row.key.parse()?,
            title: row.title,
            source: row.source,
            created_at: UtcDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("creation date"))?,
        })
    }
}
