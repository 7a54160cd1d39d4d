//! Relocation jobs.
//!
//! [`MigrationEngine`] turns a [`PendingMove`] into a complete file at the
//! move's destination, picking a strategy from the source format:
//!
//! - a zip is already canonical and is copied chunk by chunk,
//! - a bundle (`.cmc`) has its embedded `comic.zip` extracted into a
//!   preallocated destination, reading serially and writing segments
//!   concurrently (see [`bundle`]),
//! - tarballs, 7-Zip archives and plain directories are re-compressed into a
//!   zip through a bounded producer/consumer pipeline (see [`pipeline`]).
//!
//! Whatever happens, the destination is either complete or absent: any
//! failure, cancellation included, deletes what was written so far.

pub mod bundle;
pub mod error;
mod pipeline;

use crate::migrate::error::{ErrorKind, Result, from_storage};
use async_trait::async_trait;
use exn::ResultExt;
use shelf_compress::ArchiveFormat;
use shelf_config::MigrationConfig;
use shelf_storage::{RetryPolicy, copy_file, remove_path};
use shelf_store::PendingMove;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Anything that can carry out a relocation job.
///
/// Implementations must leave no file at the destination when they fail, and
/// must report [`ErrorKind::Cancelled`] once they notice `cancel`.
#[async_trait]
pub trait Migrate: Send + Sync {
    /// Produce `job.destination` from `job.source`, returning the number of
    /// bytes written.
    async fn migrate(&self, job: &PendingMove, cancel: &CancellationToken) -> Result<u64>;
}

pub type MigratorHandle = Arc<dyn Migrate>;

/// Chooses and runs a strategy per source format.
#[derive(Clone, Debug)]
pub struct MigrationEngine {
    config: MigrationConfig,
    cleanup: RetryPolicy,
}

impl MigrationEngine {
    pub fn new(config: MigrationConfig, cleanup: RetryPolicy) -> Self {
        Self { config, cleanup }
    }

    async fn detect(source: &Path) -> Result<ArchiveFormat> {
        let metadata = match tokio::fs::metadata(source).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::NotFound(source.to_path_buf()))
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Transfer),
        };
        if metadata.is_dir() {
            return Ok(ArchiveFormat::Directory);
        }
        match ArchiveFormat::from_path(source) {
            Some(format) => Ok(format),
            None => exn::bail!(ErrorKind::UnsupportedFormat(source.to_path_buf())),
        }
    }

    async fn run(&self, job: &PendingMove, format: ArchiveFormat, cancel: &CancellationToken) -> Result<u64> {
        match format {
            ArchiveFormat::Zip => {
                copy_file(&job.source, &job.destination, self.config.copy_chunk_size, cancel)
                    .await
                    .map_err(from_storage)
            },
            ArchiveFormat::Bundle => {
                bundle::extract(&job.source, &job.destination, self.config.segment_size, cancel).await
            },
            ArchiveFormat::Tar(compression) => {
                let source = pipeline::Source::Tar(job.source.clone(), compression);
                pipeline::recompress(source, &job.destination, self.config.pipeline_depth, cancel).await
            },
            ArchiveFormat::SevenZip => {
                let source = pipeline::Source::SevenZip(job.source.clone());
                pipeline::recompress(source, &job.destination, self.config.pipeline_depth, cancel).await
            },
            ArchiveFormat::Directory => {
                let source = pipeline::Source::Directory(job.source.clone());
                pipeline::recompress(source, &job.destination, self.config.pipeline_depth, cancel).await
            },
        }
    }
}

#[async_trait]
impl Migrate for MigrationEngine {
    #[instrument(skip_all, fields(key = %job.key, source = %job.source.display(), destination = %job.destination.display()))]
    async fn migrate(&self, job: &PendingMove, cancel: &CancellationToken) -> Result<u64> {
        // Nothing has been written yet; a missing or unknown source leaves
        // nothing to clean up.
        let format = Self::detect(&job.source).await?;
        debug!(?format, "starting migration");
        match self.run(job, format, cancel).await {
            Ok(bytes) => {
                info!(bytes, "migration complete");
                Ok(bytes)
            },
            Err(e) => {
                if let Err(cleanup) = remove_path(&job.destination, self.cleanup).await {
                    warn!(error = ?cleanup, "could not remove partial destination");
                }
                Err(e)
            },
        }
    }
}
