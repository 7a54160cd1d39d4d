//! File-system primitives used while relocating comic archives.
//!
//! - [`remove_path`]: delete a file or directory, retrying transient
//!   "in use" failures with linear backoff.
//! - [`copy_file`]: chunked copy that checks for cancellation between chunks.
//! - [`MappedFile`]: a preallocated destination written through disjoint
//!   memory-mapped [`Segment`]s, one independent unit of work per segment.

pub mod error;
mod copy;
mod mapped;
mod remove;

pub use crate::copy::copy_file;
pub use crate::mapped::{MappedFile, Segment, split};
pub use crate::remove::{Removed, RetryPolicy, remove_path};

use crate::error::{ErrorKind, Result};
use std::path::Path;

/// Create the parent directory of `path`, if it has one.
pub async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, parent))?;
    }
    Ok(())
}
