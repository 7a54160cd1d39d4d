//! SQLite pool for the store.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Jobs for different comics finish independently and each one clears its
/// own journal row.
const MAX_CONNECTIONS: u32 = 4;
/// Relocating a library finalizes many jobs at once; give writers room to
/// queue behind each other instead of failing with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);
/// Per-connection settings `SqliteConnectOptions` has no setter for.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA wal_autocheckpoint = 800;
    PRAGMA cache_size = -2048;
    PRAGMA temp_store = MEMORY;
";

/// Connection pool with migrations applied.
///
/// Build a [`Repository`](crate::Repository) from it to get a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file at `path`, along with any
    /// missing parent directories.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Database)?;
        }
        let options = options().filename(path).create_if_missing(true);
        Self::open(options, MAX_CONNECTIONS).await
    }

    /// A private in-memory database, gone once closed.
    ///
    /// Not test-gated so dependent crates can use it in their own tests.
    pub async fn connect_in_memory() -> Result<Self> {
        // Every connection to `:memory:` would see its own empty database.
        Self::open(options().filename(":memory:"), 1).await
    }

    async fn open(options: SqliteConnectOptions, connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(connections)
            // Runs for every pooled connection, not just the first.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        MIGRATOR.run(&pool).await.or_raise(|| ErrorKind::Migration)?;
        debug!(connections, "store ready");
        Ok(Self { pool })
    }

    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(CONNECTION_PRAGMAS).execute(&mut *conn).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection once it is returned to the pool.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

fn options() -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        // The pending-move journal cascades on comic removal.
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
}
