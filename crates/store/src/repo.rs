//! SQLite-backed [`Store`].

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{ComicRecord, ComicRow, ContentKey, PendingMove, PendingRow};
use crate::store::Store;
use async_trait::async_trait;
use exn::ResultExt;
use sqlx::SqlitePool;
use tracing::instrument;

/// Repository for comic records and the pending-move journal.
///
/// Pending moves reference comics with `ON DELETE CASCADE`, so removing a
/// comic drops its journal entry in the same statement.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(e) if e.is_foreign_key_violation())
}

#[async_trait]
impl Store for Repository {
    async fn get_pending(&self, key: &ContentKey) -> Result<Option<PendingMove>> {
        let row: Option<PendingRow> =
            sqlx::query_as("SELECT key, source, destination FROM pending_moves WHERE key = ?1")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        row.map(PendingMove::try_from).transpose()
    }

    #[instrument(skip(self), fields(key = %pending.key))]
    async fn put_pending(&self, pending: &PendingMove) -> Result<()> {
        let row = PendingRow::try_from(pending)?;
        let result = sqlx::query(include_str!("../queries/upsert_pending.sql"))
            .bind(row.key)
            .bind(row.source)
            .bind(row.destination)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => {
                exn::bail!(ErrorKind::Constraint(pending.key.to_string()))
            },
            Err(e) => Err(e).or_raise(|| ErrorKind::Database),
        }
    }

    async fn remove_pending(&self, key: &ContentKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_moves WHERE key = ?1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(&self) -> Result<Vec<PendingMove>> {
        let rows: Vec<PendingRow> =
            sqlx::query_as("SELECT key, source, destination FROM pending_moves ORDER BY key")
                .fetch_all(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(PendingMove::try_from).collect()
    }

    #[instrument(skip(self), fields(key = %comic.key))]
    async fn add_comic(&self, comic: &ComicRecord) -> Result<bool> {
        let row = ComicRow::from(comic);
        let result = sqlx::query(include_str!("../queries/insert_comic.sql"))
            .bind(row.key)
            .bind(row.title)
            .bind(row.source)
            .bind(row.created_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_comic(&self, key: &ContentKey) -> Result<Option<ComicRecord>> {
        let row: Option<ComicRow> =
            sqlx::query_as("SELECT key, title, source, created_at FROM comics WHERE key = ?1")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        row.map(ComicRecord::try_from).transpose()
    }

    async fn list_comics(&self) -> Result<Vec<ComicRecord>> {
        let rows: Vec<ComicRow> =
            sqlx::query_as("SELECT key, title, source, created_at FROM comics ORDER BY title, key")
                .fetch_all(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(ComicRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn remove_comic(&self, key: &ContentKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM comics WHERE key = ?1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
