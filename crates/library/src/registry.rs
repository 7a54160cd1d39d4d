//! Reference-counted mapping from content keys to the files backing them.
//!
//! Each key has at most one *active* binding. Replacing or deprecating a
//! binding never deletes its file straight away: the file goes once the last
//! reader holding a [`PathHandle`] to it lets go. Deletion runs in the
//! background so registry calls never wait on the disk.
//!
//! A path a job is writing to is [reserved](PathRegistry::reserve) until the
//! job ends. Reserved paths are never deleted, whatever happens to the
//! bindings that used to point at them.

use crate::title::canonical_path;
use parking_lot::Mutex;
use shelf_storage::{Removed, RetryPolicy, remove_path};
use shelf_store::ContentKey;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// What [`PathRegistry::bind`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Bind {
    /// The key had no active binding.
    Installed,
    /// The path was already the active binding.
    Unchanged,
    /// The previous binding was deprecated and will be deleted once idle.
    Replaced(PathBuf),
}

#[derive(Debug)]
struct Binding {
    key: ContentKey,
    use_count: usize,
    deprecated: bool,
}

#[derive(Debug)]
struct State {
    root: PathBuf,
    active: HashMap<ContentKey, PathBuf>,
    bindings: HashMap<PathBuf, Binding>,
    reserved: HashSet<PathBuf>,
}

impl State {
    /// Drop the binding at `path` if nothing holds it any more. Returns the
    /// path when its file should be deleted.
    fn settle(&mut self, path: &Path) -> Option<PathBuf> {
        let binding = self.bindings.get(path)?;
        if binding.use_count > 0 {
            return None;
        }
        if binding.deprecated {
            self.bindings.remove(path);
            return (!self.reserved.contains(path)).then(|| path.to_path_buf());
        }
        // Forgotten bindings disappear quietly once idle.
        if self.active.get(&binding.key).is_none_or(|active| active != path) {
            self.bindings.remove(path);
        }
        None
    }
}

struct Inner {
    state: Mutex<State>,
    deletions: TaskTracker,
    runtime: Handle,
    policy: RetryPolicy,
}

/// Registry of active and deprecated path bindings.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct PathRegistry {
    inner: Arc<Inner>,
}

impl Debug for PathRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let state = self.inner.state.lock();
        f.debug_struct("PathRegistry")
            .field("root", &state.root)
            .field("active", &state.active.len())
            .field("bindings", &state.bindings.len())
            .finish()
    }
}

impl PathRegistry {
    /// Create an empty registry for the library at `root`.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime; deletions are spawned onto
    /// it even when the last handle is released from another thread.
    pub fn new(root: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    root: root.into(),
                    active: HashMap::new(),
                    bindings: HashMap::new(),
                    reserved: HashSet::new(),
                }),
                deletions: TaskTracker::new(),
                runtime: Handle::current(),
                policy,
            }),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.inner.state.lock().root.clone()
    }

    /// Point the canonical fallback at a new library root. Existing bindings
    /// are left alone.
    pub fn set_root(&self, root: impl Into<PathBuf>) {
        self.inner.state.lock().root = root.into();
    }

    pub fn canonical_path(&self, key: &ContentKey) -> PathBuf {
        canonical_path(&self.inner.state.lock().root, key)
    }

    /// Make `path` the active binding for `key`.
    pub fn bind(&self, key: &ContentKey, path: impl Into<PathBuf>) -> Bind {
        let path = path.into();
        let doomed;
        let outcome = {
            let mut state = self.inner.state.lock();
            let previous = state.active.insert(key.clone(), path.clone());
            let binding = state.bindings.entry(path.clone()).or_insert_with(|| Binding {
                key: key.clone(),
                use_count: 0,
                deprecated: false,
            });
            binding.key = key.clone();
            binding.deprecated = false;
            match previous {
                Some(previous) if previous == path => {
                    doomed = None;
                    Bind::Unchanged
                },
                Some(previous) => {
                    if let Some(old) = state.bindings.get_mut(&previous) {
                        old.deprecated = true;
                    }
                    doomed = state.settle(&previous);
                    Bind::Replaced(previous)
                },
                None => {
                    doomed = None;
                    Bind::Installed
                },
            }
        };
        debug!(%key, path = %path.display(), ?outcome, "bound");
        if let Some(doomed) = doomed {
            self.schedule_delete(doomed);
        }
        outcome
    }

    /// Take a reference to the file currently backing `key`.
    ///
    /// Keys without a binding resolve to their canonical path inside the
    /// library root, which becomes the active binding.
    pub fn acquire(&self, key: &ContentKey) -> PathHandle {
        let mut state = self.inner.state.lock();
        let path = match state.active.get(key) {
            Some(path) => path.clone(),
            None => {
                let path = canonical_path(&state.root, key);
                state.active.insert(key.clone(), path.clone());
                path
            },
        };
        state
            .bindings
            .entry(path.clone())
            .or_insert_with(|| Binding { key: key.clone(), use_count: 0, deprecated: false })
            .use_count += 1;
        PathHandle { registry: self.clone(), key: key.clone(), path }
    }

    /// Give back a handle. Equivalent to dropping it.
    pub fn release(&self, handle: PathHandle) {
        drop(handle);
    }

    fn release_path(&self, path: &Path) {
        let doomed = {
            let mut state = self.inner.state.lock();
            match state.bindings.get_mut(path) {
                Some(binding) => binding.use_count = binding.use_count.saturating_sub(1),
                None => return,
            }
            state.settle(path)
        };
        if let Some(doomed) = doomed {
            self.schedule_delete(doomed);
        }
    }

    /// Retire the active binding for `key`; its file is deleted once idle.
    ///
    /// Returns `false` when the key had no active binding.
    pub fn deprecate(&self, key: &ContentKey) -> bool {
        let doomed = {
            let mut state = self.inner.state.lock();
            let Some(path) = state.active.remove(key) else {
                return false;
            };
            if let Some(binding) = state.bindings.get_mut(&path) {
                binding.deprecated = true;
            }
            state.settle(&path)
        };
        debug!(%key, "deprecated");
        if let Some(doomed) = doomed {
            self.schedule_delete(doomed);
        }
        true
    }

    /// Drop the active binding for `key` without deleting anything.
    pub fn forget(&self, key: &ContentKey) -> bool {
        let mut state = self.inner.state.lock();
        let Some(path) = state.active.remove(key) else {
            return false;
        };
        state.settle(&path);
        true
    }

    /// The path `key` currently resolves to, without taking a reference.
    pub fn active_path(&self, key: &ContentKey) -> Option<PathBuf> {
        self.inner.state.lock().active.get(key).cloned()
    }

    /// Number of live handles to `path`, if it is bound at all.
    pub fn use_count(&self, path: &Path) -> Option<usize> {
        self.inner.state.lock().bindings.get(path).map(|b| b.use_count)
    }

    /// Claim `path` as the destination of a job.
    ///
    /// Returns `None` when a reader still holds the path or another job has
    /// already claimed it. The claim ends when the [`Reservation`] is dropped.
    pub fn reserve(&self, path: impl Into<PathBuf>) -> Option<Reservation> {
        let path = path.into();
        let mut state = self.inner.state.lock();
        if state.reserved.contains(&path) || state.bindings.get(&path).is_some_and(|b| b.use_count > 0) {
            return None;
        }
        state.reserved.insert(path.clone());
        Some(Reservation { registry: self.clone(), path })
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.inner.state.lock().reserved.contains(path)
    }

    /// Wait for every scheduled deletion to finish.
    pub async fn drain(&self) {
        self.inner.deletions.close();
        self.inner.deletions.wait().await;
        self.inner.deletions.reopen();
    }

    fn schedule_delete(&self, path: PathBuf) {
        let registry = self.clone();
        let policy = self.inner.policy;
        self.inner.deletions.spawn_on(
            async move {
                // Someone may have bound or claimed the path in the meantime.
                {
                    let state = registry.inner.state.lock();
                    if state.bindings.contains_key(&path) || state.reserved.contains(&path) {
                        debug!(path = %path.display(), "path in use again; keeping it");
                        return;
                    }
                }
                match remove_path(&path, policy).await {
                    Ok(Removed::Missing) => debug!(path = %path.display(), "already gone"),
                    Ok(_) => debug!(path = %path.display(), "deleted retired file"),
                    Err(e) => warn!(path = %path.display(), error = ?e, "giving up on deleting retired file"),
                }
            },
            &self.inner.runtime,
        );
    }
}

/// A counted reference to the file backing a key.
///
/// The file stays on disk for as long as the handle lives, even if the
/// binding is replaced in the meantime. Dropping the handle releases it.
#[must_use = "dropping a handle releases it immediately"]
pub struct PathHandle {
    registry: PathRegistry,
    key: ContentKey,
    path: PathBuf,
}

impl PathHandle {
    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for PathHandle {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Debug for PathHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("PathHandle").field("key", &self.key).field("path", &self.path).finish()
    }
}

impl Drop for PathHandle {
    fn drop(&mut self) {
        self.registry.release_path(&self.path);
    }
}

/// A job's claim on its destination. Dropping it ends the claim.
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    registry: PathRegistry,
    path: PathBuf,
}

impl Reservation {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Debug for Reservation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_tuple("Reservation").field(&self.path).finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry.inner.state.lock().reserved.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(root: &Path) -> PathRegistry {
        PathRegistry::new(root, RetryPolicy { attempts: 3, backoff: Duration::from_millis(1) })
    }

    fn key(title: &str) -> ContentKey {
        ContentKey::from_title(title)
    }

    #[tokio::test]
    async fn unknown_keys_fall_back_to_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let k = key("Teatime Cookbook");
        let handle = registry.acquire(&k);
        assert_eq!(handle.path(), dir.path().join(k.canonical_file_name()));
        assert_eq!(registry.use_count(handle.path()), Some(1));
        assert_eq!(registry.active_path(&k).as_deref(), Some(handle.path()));
        let path = handle.path().to_path_buf();
        registry.release(handle);
        assert_eq!(registry.use_count(&path), Some(0));
    }

    #[tokio::test]
    async fn rebinding_keeps_one_active_binding() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let k = key("Teatime Cookbook");
        let (a, b) = (dir.path().join("a.zip"), dir.path().join("b.zip"));
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        assert_eq!(registry.bind(&k, &a), Bind::Installed);
        assert_eq!(registry.bind(&k, &a), Bind::Unchanged);
        let reader = registry.acquire(&k);
        assert_eq!(registry.bind(&k, &b), Bind::Replaced(a.clone()));
        assert_eq!(registry.active_path(&k), Some(b.clone()));

        // The reader keeps the superseded file alive.
        registry.drain().await;
        assert!(a.exists());
        assert_eq!(std::fs::read(reader.path()).unwrap(), b"a");
        drop(reader);
        registry.drain().await;
        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(registry.use_count(&a), None);
    }

    #[tokio::test]
    async fn idle_deprecated_binding_is_deleted_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let k = key("Teatime Cookbook");
        let pages = dir.path().join("pages");
        std::fs::create_dir(&pages).unwrap();
        std::fs::write(pages.join("001.png"), b"png").unwrap();
        registry.bind(&k, &pages);
        assert!(registry.deprecate(&k));
        assert!(!registry.deprecate(&k));
        registry.drain().await;
        assert!(!pages.exists());
    }

    #[tokio::test]
    async fn last_release_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let k = key("Teatime Cookbook");
        let handle = registry.acquire(&k);
        std::fs::write(handle.path(), b"PK").unwrap();
        let second = registry.acquire(&k);
        assert_eq!(registry.use_count(handle.path()), Some(2));

        registry.deprecate(&k);
        let path = handle.path().to_path_buf();
        registry.release(handle);
        registry.drain().await;
        assert!(path.exists(), "one reader still holds it");
        registry.release(second);
        registry.drain().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn forget_never_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let k = key("Teatime Cookbook");
        let source = dir.path().join("download.cmc");
        std::fs::write(&source, b"tar").unwrap();
        registry.bind(&k, &source);
        let reader = registry.acquire(&k);
        assert!(registry.forget(&k));
        assert_eq!(registry.active_path(&k), None);
        drop(reader);
        registry.drain().await;
        assert!(source.exists());
        assert_eq!(registry.use_count(&source), None);
    }

    #[tokio::test]
    async fn reserved_path_survives_its_last_reader() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let k = key("Teatime Cookbook");
        let (old, new) = (dir.path().join("old.zip"), dir.path().join("new.zip"));
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();
        registry.bind(&k, &old);
        let reader = registry.acquire(&k);
        registry.bind(&k, &new);

        // A reader still has the retired file open, so nobody may write it.
        assert!(registry.reserve(&old).is_none());
        drop(reader);
        registry.drain().await;
        assert!(!old.exists());

        std::fs::write(&old, b"rewritten").unwrap();
        let reservation = registry.reserve(&old).unwrap();
        assert!(registry.is_reserved(reservation.path()));
        assert!(registry.reserve(&old).is_none(), "one writer per path");
        registry.bind(&k, &old);
        let reader = registry.acquire(&k);
        registry.bind(&k, &new);
        drop(reader);
        registry.drain().await;
        assert_eq!(std::fs::read(&old).unwrap(), b"rewritten");

        drop(reservation);
        assert!(!registry.is_reserved(&old));
        assert!(registry.reserve(&old).is_some());
    }

    #[tokio::test]
    async fn pending_deletion_skips_a_path_reserved_meanwhile() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let k = key("Teatime Cookbook");
        let path = dir.path().join("k.zip");
        std::fs::write(&path, b"PK").unwrap();
        registry.bind(&k, &path);
        // The delete is scheduled but can't run before this task yields.
        registry.deprecate(&k);
        let reservation = registry.reserve(&path).unwrap();
        registry.drain().await;
        assert!(path.exists());
        drop(reservation);
    }

    #[tokio::test]
    async fn root_change_only_affects_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir.path().join("old"));
        let (bound, unbound) = (key("Bound"), key("Unbound"));
        let old = registry.canonical_path(&bound);
        registry.bind(&bound, &old);
        registry.set_root(dir.path().join("new"));
        assert_eq!(registry.root(), dir.path().join("new"));
        assert_eq!(registry.acquire(&bound).path(), old);
        assert!(registry.acquire(&unbound).path().starts_with(dir.path().join("new")));
    }
}
