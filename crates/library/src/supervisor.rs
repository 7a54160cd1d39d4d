//! One relocation job per comic.
//!
//! The supervisor owns every running job and the pending-move journal. A new
//! request for a key that already has a job is composed with it rather than
//! queued:
//!
//! | request vs. current move | outcome |
//! |---|---|
//! | same destination | [`Request::Duplicate`], nothing changes |
//! | destination is the current move's source | [`Request::Reversed`]: the job is cancelled and nothing moves |
//! | anything else | [`Request::Chained`]: the job is cancelled and a new one runs from the *original* source |
//!
//! Requests are handled one at a time, so when several arrive while a job is
//! being cancelled the last one decides where the comic ends up.
//!
//! Every job holds a [`Reservation`] on its destination for as long as it
//! runs. A destination that a reader still has open is refused with
//! [`ErrorKind::DestinationBusy`] instead of being overwritten.

use crate::error::{ErrorKind, Result};
use crate::migrate::MigratorHandle;
use crate::registry::{PathRegistry, Reservation};
use exn::ResultExt;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use shelf_storage::{RetryPolicy, remove_path};
use shelf_store::{ContentKey, PendingMove, StoreHandle};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What [`Supervisor::request`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Source and destination are the same path.
    Unchanged,
    /// A job was started for a key that had no outstanding move.
    Started,
    /// The same move is already running.
    Duplicate,
    /// An outstanding move with no running job was picked up again.
    Resumed,
    /// The request undid the outstanding move; no job runs.
    Reversed,
    /// The outstanding move was redirected to the new destination.
    Chained,
}

/// What recovery did with one persisted pending move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// A job was started for it.
    Resumed,
    /// Its source is gone; the move and the comic record were purged.
    Purged,
    /// A job for the key was already running.
    AlreadyRunning,
    /// A reader still holds the destination; the move stays journaled.
    Blocked,
}

#[derive(Clone)]
struct Job {
    id: u64,
    source: PathBuf,
    destination: PathBuf,
    cancel: CancellationToken,
    done: Shared<BoxFuture<'static, ()>>,
}

impl Job {
    async fn cancel_and_wait(self) {
        self.cancel.cancel();
        self.done.await;
    }
}

struct Inner {
    migrator: MigratorHandle,
    registry: PathRegistry,
    store: StoreHandle,
    cleanup: RetryPolicy,
    running: Mutex<HashMap<ContentKey, Job>>,
    requests: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

/// Starts, composes, stops and recovers relocation jobs.
///
/// Cheap to clone; clones share the same jobs.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Debug for Supervisor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Supervisor").field("running", &self.running()).finish()
    }
}

/// Removes a finished job from the running map, even if the job panicked.
struct Deregister {
    inner: Arc<Inner>,
    key: ContentKey,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock();
        if running.get(&self.key).is_some_and(|job| job.id == self.id) {
            running.remove(&self.key);
        }
    }
}

impl Supervisor {
    pub fn new(migrator: MigratorHandle, registry: PathRegistry, store: StoreHandle, cleanup: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                migrator,
                registry,
                store,
                cleanup,
                running: Mutex::new(HashMap::new()),
                requests: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Keys with a running job.
    pub fn running(&self) -> Vec<ContentKey> {
        let mut keys: Vec<_> = self.inner.running.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_running(&self, key: &ContentKey) -> bool {
        self.inner.running.lock().contains_key(key)
    }

    fn job(&self, key: &ContentKey) -> Option<Job> {
        self.inner.running.lock().get(key).cloned()
    }

    /// Move the comic `key` from `source` to `destination`.
    ///
    /// The comic must already have a record in the store. Composition with an
    /// outstanding move is described in the [module docs](self).
    #[instrument(skip(self, source, destination), fields(source = %source.as_ref().display(), destination = %destination.as_ref().display()))]
    pub async fn request(
        &self,
        key: &ContentKey,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<Request> {
        let (source, destination) = (source.as_ref(), destination.as_ref());
        let _serial = self.inner.requests.lock().await;
        if source == destination {
            return Ok(Request::Unchanged);
        }

        if let Some(job) = self.job(key) {
            if job.destination == destination {
                debug!("duplicate request");
                return Ok(Request::Duplicate);
            }
            debug!(from = %job.source.display(), to = %job.destination.display(), "cancelling running job");
            job.cancel_and_wait().await;
        }

        // The running job may have finished on its own before it saw the
        // cancellation; the journal says what is still outstanding.
        let outcome = match self.inner.store.get_pending(key).await.or_raise(|| ErrorKind::Store)? {
            Some(pending) if pending.destination == destination => {
                let reservation = self.reserve(destination)?;
                self.start(pending, reservation);
                Request::Resumed
            },
            Some(pending) if pending.source == destination => {
                self.inner.store.remove_pending(key).await.or_raise(|| ErrorKind::Store)?;
                self.discard(&pending.destination).await;
                Request::Reversed
            },
            Some(pending) => {
                let reservation = self.reserve(destination)?;
                let chained = PendingMove::new(key.clone(), pending.source, destination);
                self.inner.store.put_pending(&chained).await.or_raise(|| ErrorKind::Store)?;
                self.start(chained, reservation);
                Request::Chained
            },
            None => {
                let reservation = self.reserve(destination)?;
                let pending = PendingMove::new(key.clone(), source, destination);
                self.inner.store.put_pending(&pending).await.or_raise(|| ErrorKind::Store)?;
                self.start(pending, reservation);
                Request::Started
            },
        };
        info!(%key, ?outcome, "move requested");
        Ok(outcome)
    }

    /// Cancel the job for `key` and forget its pending move.
    ///
    /// Returns whether a job was running; when it wasn't, the caller may still
    /// have a file to delete itself.
    #[instrument(skip(self))]
    pub async fn stop(&self, key: &ContentKey) -> Result<bool> {
        let _serial = self.inner.requests.lock().await;
        let job = self.job(key);
        let stopped = job.is_some();
        if let Some(job) = job {
            job.cancel_and_wait().await;
        }
        self.inner.store.remove_pending(key).await.or_raise(|| ErrorKind::Store)?;
        Ok(stopped)
    }

    /// Restart every move left over from a previous run.
    ///
    /// Rows are replayed as they are, without being written again. A key that
    /// already has a running job is left alone, so replaying twice never runs
    /// two jobs for the same comic. Whatever an interrupted job left at the
    /// destination is deleted before the job starts over.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<(ContentKey, Recovery)>> {
        let pending = self.inner.store.list_pending().await.or_raise(|| ErrorKind::Store)?;
        let mut report = Vec::with_capacity(pending.len());
        for pending in pending {
            let _serial = self.inner.requests.lock().await;
            let key = pending.key.clone();
            let outcome = if self.is_running(&key) {
                Recovery::AlreadyRunning
            } else if !tokio::fs::try_exists(&pending.source).await.unwrap_or(false) {
                warn!(%key, source = %pending.source.display(), "source of interrupted move is gone; purging");
                self.purge(&key).await;
                Recovery::Purged
            } else if let Some(reservation) = self.inner.registry.reserve(&pending.destination) {
                self.inner.registry.bind(&key, &pending.source);
                if let Err(e) = remove_path(&pending.destination, self.inner.cleanup).await {
                    warn!(%key, error = ?e, "could not clear partial destination; the job will overwrite it");
                }
                self.start(pending, reservation);
                Recovery::Resumed
            } else {
                warn!(%key, destination = %pending.destination.display(), "destination of interrupted move is in use");
                Recovery::Blocked
            };
            report.push((key, outcome));
        }
        info!(moves = report.len(), "recovery finished");
        Ok(report)
    }

    /// Wait for the job for `key`, if there is one.
    pub async fn wait(&self, key: &ContentKey) {
        if let Some(job) = self.job(key) {
            job.done.await;
        }
    }

    /// Wait until no job is running.
    pub async fn wait_idle(&self) {
        loop {
            let jobs: Vec<_> = self.inner.running.lock().values().map(|job| job.done.clone()).collect();
            if jobs.is_empty() {
                return;
            }
            join_all(jobs).await;
        }
    }

    fn reserve(&self, destination: &Path) -> Result<Reservation> {
        match self.inner.registry.reserve(destination) {
            Some(reservation) => Ok(reservation),
            None => exn::bail!(ErrorKind::DestinationBusy(destination.to_path_buf())),
        }
    }

    fn start(&self, pending: PendingMove, reservation: Reservation) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (key, source, destination) = (pending.key.clone(), pending.source.clone(), pending.destination.clone());
        // Holding the lock across the spawn means the job can't deregister
        // before it has been registered.
        let mut running = self.inner.running.lock();
        let guard = Deregister { inner: Arc::clone(&self.inner), key: key.clone(), id };
        let this = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _reservation = reservation;
            this.execute(pending, token).await;
        });
        let done = async move {
            _ = handle.await;
        }
        .boxed()
        .shared();
        running.insert(key, Job { id, source, destination, cancel, done });
    }

    async fn execute(&self, pending: PendingMove, cancel: CancellationToken) {
        let key = &pending.key;
        match self.inner.migrator.migrate(&pending, &cancel).await {
            Ok(_) => {
                self.inner.registry.bind(key, &pending.destination);
                if let Err(e) = self.inner.store.remove_pending(key).await {
                    warn!(%key, error = ?e, "could not clear finished move; it will be replayed");
                }
                info!(%key, destination = %pending.destination.display(), "move finished");
            },
            Err(e) if e.is_cancelled() => {
                debug!(%key, "move cancelled");
            },
            Err(e) => {
                warn!(%key, error = ?e, "move failed; purging comic");
                self.purge(key).await;
            },
        }
    }

    /// Drop a comic whose move can't complete.
    async fn purge(&self, key: &ContentKey) {
        self.inner.registry.forget(key);
        if let Err(e) = self.inner.store.remove_pending(key).await {
            warn!(%key, error = ?e, "could not remove pending move");
        }
        if let Err(e) = self.inner.store.remove_comic(key).await {
            warn!(%key, error = ?e, "could not remove comic record");
        }
    }

    /// Delete a destination that will never be published.
    async fn discard(&self, path: &Path) {
        if let Err(e) = remove_path(path, self.inner.cleanup).await {
            warn!(path = %path.display(), error = ?e, "could not remove abandoned destination");
        }
    }
}
