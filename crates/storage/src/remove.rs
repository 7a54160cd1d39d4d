use crate::error::{ErrorKind, Result, is_transient};
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, instrument};

/// How hard [`remove_path`] tries before giving up on a file that's in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Attempt `n` waits `n * backoff` before trying again (linear backoff).
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, backoff: Duration::from_millis(100) }
    }
}

/// What [`remove_path`] found at the path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removed {
    File,
    Directory,
    /// Nothing was there; not an error.
    Missing,
}

/// Delete a file, or a directory and everything beneath it.
///
/// Share violations ([`ErrorKind::InUse`]) are retried according to `policy`;
/// every other failure is returned immediately. A path that doesn't exist
/// (or disappears mid-way) is reported as [`Removed::Missing`].
#[instrument(level = "debug", skip(policy))]
pub async fn remove_path(path: &Path, policy: RetryPolicy) -> Result<Removed> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await.map(|()| Removed::Directory),
            Ok(_) => fs::remove_file(path).await.map(|()| Removed::File),
            Err(e) => Err(e),
        };
        match result {
            Ok(removed) => return Ok(removed),
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Removed::Missing),
            Err(e) if is_transient(&e) && attempt < attempts => {
                debug!(attempt, error = %e, "path in use; retrying delete");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            },
            Err(e) => exn::bail!(ErrorKind::from_io(e, path)),
        }
    }
}
