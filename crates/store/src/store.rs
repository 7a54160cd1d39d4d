use crate::error::Result;
use crate::models::{ComicRecord, ContentKey, PendingMove};
use async_trait::async_trait;

/// Persistence used by the library.
///
/// Every pending move belongs to a comic record: writing a pending move for
/// an unknown key fails with [`ErrorKind::Constraint`](crate::error::ErrorKind::Constraint),
/// and removing a comic also removes its pending move.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// The pending move recorded for `key`, if any.
    async fn get_pending(&self, key: &ContentKey) -> Result<Option<PendingMove>>;

    /// Insert or replace the pending move for its key.
    async fn put_pending(&self, pending: &PendingMove) -> Result<()>;

    /// Forget the pending move for `key`. Returns whether one existed.
    async fn remove_pending(&self, key: &ContentKey) -> Result<bool>;

    /// Every pending move, ordered by key.
    async fn list_pending(&self) -> Result<Vec<PendingMove>>;

    /// Record a comic. Returns `false` when a comic with the same key already exists.
    async fn add_comic(&self, comic: &ComicRecord) -> Result<bool>;

    async fn get_comic(&self, key: &ContentKey) -> Result<Option<ComicRecord>>;

    /// Every comic, ordered by title.
    async fn list_comics(&self) -> Result<Vec<ComicRecord>>;

    /// Remove a comic (and its pending move). Returns whether it existed.
    async fn remove_comic(&self, key: &ContentKey) -> Result<bool>;
}
