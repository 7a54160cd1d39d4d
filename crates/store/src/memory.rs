//! In-memory [`Store`] for tests in dependent crates.

use crate::error::{ErrorKind, Result};
use crate::models::{ComicRecord, ContentKey, PendingMove};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    comics: BTreeMap<ContentKey, ComicRecord>,
    pending: BTreeMap<ContentKey, PendingMove>,
}

/// Map-backed store with the same constraints as the SQLite schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_pending(&self, key: &ContentKey) -> Result<Option<PendingMove>> {
        Ok(self.tables.read().await.pending.get(key).cloned())
    }

    async fn put_pending(&self, pending: &PendingMove) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.comics.contains_key(&pending.key) {
            exn::bail!(ErrorKind::Constraint(pending.key.to_string()));
        }
        tables.pending.insert(pending.key.clone(), pending.clone());
        Ok(())
    }

    async fn remove_pending(&self, key: &ContentKey) -> Result<bool> {
        Ok(self.tables.write().await.pending.remove(key).is_some())
    }

    async fn list_pending(&self) -> Result<Vec<PendingMove>> {
        Ok(self.tables.read().await.pending.values().cloned().collect())
    }

    async fn add_comic(&self, comic: &ComicRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.comics.contains_key(&comic.key) {
            return Ok(false);
        }
        tables.comics.insert(comic.key.clone(), comic.clone());
        Ok(true)
    }

    async fn get_comic(&self, key: &ContentKey) -> Result<Option<ComicRecord>> {
        Ok(self.tables.read().await.comics.get(key).cloned())
    }

    async fn list_comics(&self) -> Result<Vec<ComicRecord>> {
        let mut comics: Vec<_> = self.tables.read().await.comics.values().cloned().collect();
        comics.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.key.cmp(&b.key)));
        Ok(comics)
    }

    async fn remove_comic(&self, key: &ContentKey) -> Result<bool> {
        let mut tables = self.tables.write().await;
        tables.pending.remove(key);
        Ok(tables.comics.remove(key).is_some())
    }
}
