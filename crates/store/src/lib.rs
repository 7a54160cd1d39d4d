//! Persistent state for the comic library.
//!
//! The store holds two things:
//! - **Comic records**: one row per comic, keyed by its [`ContentKey`].
//! - **Pending moves**: a journal of relocations that have been requested
//!   but not yet finalized. A row is written before a transfer starts and
//!   removed once it completes, is stopped, or fails; rows found at startup
//!   belong to transfers interrupted by a crash and are replayed.
//!
//! The library only talks to the [`Store`] trait. [`Repository`] implements
//! it on top of SQLite; [`MemoryStore`] (behind the `mock` feature) keeps
//! everything in a map for tests.

mod db;
pub mod error;
#[cfg(feature = "mock")]
mod memory;
mod models;
mod repo;
mod store;

pub use crate::db::Database;
#[cfg(feature = "mock")]
pub use crate::memory::MemoryStore;
pub use crate::models::{ComicRecord, ContentKey, PendingMove};
pub use crate::repo::Repository;
pub use crate::store::Store;
use std::sync::Arc;

pub type StoreHandle = Arc<dyn Store>;
