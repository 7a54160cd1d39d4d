use crate::error::{Error, ErrorKind, Result};
use crate::migrate::bundle::read_metadata;
use crate::migrate::{MigrationEngine, MigratorHandle};
use crate::registry::{PathHandle, PathRegistry};
use crate::supervisor::{Request, Supervisor};
use crate::title::{canonical_path, title_from_path};
use exn::{OptionExt, ResultExt};
use shelf_asyncutils::{Failure, TaskGraph};
use shelf_compress::ArchiveFormat;
use shelf_config::{Config, DeleteConfig};
use shelf_storage::{RetryPolicy, remove_path};
use shelf_store::{ComicRecord, ContentKey, StoreHandle};
use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Startup unit names, in the order they depend on each other.
pub const UNIT_STORE: &str = "store";
pub const UNIT_REGISTRY: &str = "registry";
pub const UNIT_RECOVERY: &str = "recovery";

/// What [`Library::import`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Import {
    /// A comic with the same title is already in the library.
    AlreadyExists(ContentKey),
    /// The archive was already canonical and was renamed into place.
    Moved(ContentKey),
    /// A job is converting the archive into place.
    Queued(ContentKey),
}

impl Import {
    pub fn key(&self) -> &ContentKey {
        match self {
            Self::AlreadyExists(key) | Self::Moved(key) | Self::Queued(key) => key,
        }
    }
}

fn retry_policy(config: &DeleteConfig) -> RetryPolicy {
    RetryPolicy { attempts: config.attempts, backoff: config.backoff() }
}

fn startup_error(failure: Failure<Error>) -> Error {
    let unit = failure.unit().to_string();
    match failure {
        Failure::Failed { error, .. } => error.raise(ErrorKind::Startup(unit)),
        other => exn::Exn::from(other).raise(ErrorKind::Startup(unit)),
    }
}

/// A comic library: the registry, the supervisor and the store, wired
/// together.
#[derive(Clone, Debug)]
pub struct Library {
    store: StoreHandle,
    registry: PathRegistry,
    supervisor: Supervisor,
    cleanup: RetryPolicy,
}

impl Library {
    /// Build a library that migrates with a [`MigrationEngine`].
    ///
    /// Nothing is read or started until [`start`](Self::start).
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn open(config: &Config, store: StoreHandle) -> Self {
        let engine = MigrationEngine::new(config.migration.clone(), retry_policy(&config.delete));
        Self::with_migrator(config, store, Arc::new(engine))
    }

    /// Build a library around any [`Migrate`](crate::migrate::Migrate) implementation.
    pub fn with_migrator(config: &Config, store: StoreHandle, migrator: MigratorHandle) -> Self {
        let cleanup = retry_policy(&config.delete);
        let registry = PathRegistry::new(&config.library, cleanup);
        let supervisor = Supervisor::new(migrator, registry.clone(), Arc::clone(&store), cleanup);
        Self { store, registry, supervisor, cleanup }
    }

    pub fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// The startup graph: make sure the library root and store are usable,
    /// seed the registry with every canonical file on disk, then replay
    /// interrupted moves.
    ///
    /// Callers may add their own units (a thumbnail cache, a search index)
    /// that declare any of these as prerequisites before running it.
    pub fn startup(&self) -> TaskGraph<Error> {
        let mut graph = TaskGraph::new();

        let (store, root) = (Arc::clone(&self.store), self.registry.root());
        graph.add(UNIT_STORE, std::iter::empty::<&str>(), async move {
            tokio::fs::create_dir_all(&root).await.or_raise(|| ErrorKind::Storage)?;
            let pending = store.list_pending().await.or_raise(|| ErrorKind::Store)?;
            debug!(root = %root.display(), pending = pending.len(), "store ready");
            Ok(())
        });

        let (store, registry) = (Arc::clone(&self.store), self.registry.clone());
        graph.add(UNIT_REGISTRY, [UNIT_STORE], async move {
            let comics = store.list_comics().await.or_raise(|| ErrorKind::Store)?;
            // A canonical file with an interrupted move may be half written;
            // recovery binds those comics at their source instead.
            let moving: HashSet<ContentKey> =
                store.list_pending().await.or_raise(|| ErrorKind::Store)?.into_iter().map(|p| p.key).collect();
            let mut seeded = 0usize;
            for comic in comics.iter().filter(|c| !moving.contains(&c.key)) {
                let path = registry.canonical_path(&comic.key);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    registry.bind(&comic.key, path);
                    seeded += 1;
                }
            }
            debug!(comics = comics.len(), seeded, "registry seeded");
            Ok(())
        });

        let supervisor = self.supervisor.clone();
        graph.add(UNIT_RECOVERY, [UNIT_REGISTRY], async move { supervisor.recover().await.map(drop) });

        graph
    }

    /// Run the [startup graph](Self::startup) to completion.
    pub async fn start(&self) -> Result<()> {
        self.startup().run().map_err(startup_error)?.wait_all().await.map_err(startup_error)
    }

    /// Bring a file or directory into the library.
    ///
    /// The title comes from a bundle's `metadata.json`, otherwise from the
    /// file name. A zip is renamed straight into place when it lives on the
    /// same file system as the library; anything else becomes a move request
    /// and is bound at its current location until the job finishes. Either
    /// way the library takes ownership of the original.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn import(&self, path: impl AsRef<Path>) -> Result<Import> {
        let path = match tokio::fs::canonicalize(path.as_ref()).await {
            Ok(path) => path,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                exn::bail!(ErrorKind::NotFound(path.as_ref().to_path_buf()))
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        };
        let format = if path.is_dir() {
            ArchiveFormat::Directory
        } else {
            ArchiveFormat::from_path(&path).ok_or_raise(|| ErrorKind::Unsupported(path.clone()))?
        };
        let title = match format {
            ArchiveFormat::Bundle => {
                let metadata = read_metadata(&path).await.or_raise(|| ErrorKind::Metadata)?;
                Some(metadata.title.trim().to_string()).filter(|t| !t.is_empty())
            },
            _ => None,
        }
        .unwrap_or_else(|| title_from_path(&path));

        let comic = ComicRecord::new(title).with_source(path.to_string_lossy());
        let key = comic.key.clone();
        if !self.store.add_comic(&comic).await.or_raise(|| ErrorKind::Store)? {
            debug!(%key, title = %comic.title, "already in library");
            return Ok(Import::AlreadyExists(key));
        }

        let canonical = self.registry.canonical_path(&key);
        if format.is_canonical() && tokio::fs::rename(&path, &canonical).await.is_ok() {
            self.registry.bind(&key, &canonical);
            info!(%key, title = %comic.title, "imported");
            return Ok(Import::Moved(key));
        }
        self.registry.bind(&key, &path);
        if let Err(e) = self.supervisor.request(&key, &path, &canonical).await {
            self.registry.forget(&key);
            if let Err(undo) = self.store.remove_comic(&key).await {
                warn!(%key, error = ?undo, "could not roll back failed import");
            }
            return Err(e);
        }
        Ok(Import::Queued(key))
    }

    /// Take a comic out of the library and delete its file once no reader
    /// holds it. Returns whether the comic existed.
    #[instrument(skip(self))]
    pub async fn remove(&self, key: &ContentKey) -> Result<bool> {
        let stopped = self.supervisor.stop(key).await?;
        let bound = self.registry.deprecate(key);
        let existed = self.store.remove_comic(key).await.or_raise(|| ErrorKind::Store)?;
        if !bound && !stopped {
            remove_path(&self.registry.canonical_path(key), self.cleanup).await.or_raise(|| ErrorKind::Storage)?;
        }
        info!(%key, existed, "removed");
        Ok(existed)
    }

    /// Move every comic into a new library root.
    ///
    /// New imports land in `root` straight away; existing comics follow as
    /// their jobs finish. Returns how many moves were requested.
    #[instrument(skip(self, root), fields(root = %root.as_ref().display()))]
    pub async fn relocate(&self, root: impl AsRef<Path>) -> Result<usize> {
        let root = root.as_ref().to_path_buf();
        let old = self.registry.root();
        if root == old {
            return Ok(0);
        }
        tokio::fs::create_dir_all(&root).await.or_raise(|| ErrorKind::Storage)?;
        self.registry.set_root(&root);

        let mut requested = 0;
        for comic in self.store.list_comics().await.or_raise(|| ErrorKind::Store)? {
            let key = &comic.key;
            let source: PathBuf = self.registry.active_path(key).unwrap_or_else(|| canonical_path(&old, key));
            if !self.supervisor.is_running(key) && !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                warn!(%key, source = %source.display(), "comic file missing; not relocating");
                continue;
            }
            self.registry.bind(key, &source);
            match self.supervisor.request(key, &source, canonical_path(&root, key)).await {
                Ok(Request::Unchanged | Request::Duplicate) => {},
                Ok(_) => requested += 1,
                Err(e) if matches!(&*e, ErrorKind::DestinationBusy(_)) => {
                    warn!(%key, error = ?e, "destination still open; not relocating");
                },
                Err(e) => return Err(e),
            }
        }
        info!(requested, "relocation requested");
        Ok(requested)
    }

    /// Every comic in the library, ordered by title.
    pub async fn list(&self) -> Result<Vec<ComicRecord>> {
        self.store.list_comics().await.or_raise(|| ErrorKind::Store)
    }

    /// Take a reference to the file currently backing `key`.
    pub fn acquire(&self, key: &ContentKey) -> PathHandle {
        self.registry.acquire(key)
    }

    /// Wait for every running job and every scheduled deletion.
    pub async fn wait_idle(&self) {
        self.supervisor.wait_idle().await;
        self.registry.drain().await;
    }
}
