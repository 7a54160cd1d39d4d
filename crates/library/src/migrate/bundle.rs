//! Composite bundles (`.cmc`).
//!
//! A bundle is an uncompressed tar holding the canonical archive as
//! `comic.zip` plus a `metadata.json` document. Because the tar isn't
//! compressed, the embedded archive sits in the bundle as one contiguous run
//! of bytes: extraction seeks to it and copies exactly that many bytes.

use crate::migrate::error::{ErrorKind, Result, from_storage};
use exn::{OptionExt, ResultExt};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shelf_storage::{MappedFile, split};
use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub const COMIC_ENTRY: &str = "comic.zip";
pub const METADATA_ENTRY: &str = "metadata.json";

/// Contents of a bundle's `metadata.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleMetadata {
    pub version: String,
    pub title: String,
    pub source: Option<String>,
    pub tags: Vec<String>,
    /// Reader state (progress, rating, timestamps); carried but not interpreted.
    pub system: serde_json::Value,
}

fn is_entry(path: &Path, name: &str) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.eq_ignore_ascii_case(name))
}

/// Byte offset and length of the embedded archive.
fn locate(bundle: &Path) -> Result<(u64, u64)> {
    let file = File::open(bundle).or_raise(|| ErrorKind::Transfer)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries_with_seek().or_raise(|| ErrorKind::InvalidArchive)? {
        let entry = entry.or_raise(|| ErrorKind::InvalidArchive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if is_entry(&entry.path().or_raise(|| ErrorKind::InvalidArchive)?, COMIC_ENTRY) {
            return Ok((entry.raw_file_position(), entry.size()));
        }
    }
    exn::bail!(ErrorKind::InvalidArchive)
}

fn parse_metadata(bundle: &Path) -> Result<BundleMetadata> {
    let file = File::open(bundle).or_raise(|| ErrorKind::Transfer)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries_with_seek().or_raise(|| ErrorKind::InvalidArchive)? {
        let entry = entry.or_raise(|| ErrorKind::InvalidArchive)?;
        if entry.header().entry_type().is_file()
            && is_entry(&entry.path().or_raise(|| ErrorKind::InvalidArchive)?, METADATA_ENTRY)
        {
            return serde_json::from_reader(entry).or_raise(|| ErrorKind::InvalidArchive);
        }
    }
    exn::bail!(ErrorKind::InvalidArchive)
}

/// Read `metadata.json` from a bundle.
pub async fn read_metadata(bundle: impl Into<PathBuf>) -> Result<BundleMetadata> {
    let bundle = bundle.into();
    tokio::task::spawn_blocking(move || parse_metadata(&bundle)).await.or_raise(|| ErrorKind::Transfer)?
}

/// Read `len` bytes serially, handing each segment to its own write as soon
/// as it is filled. Cancellation is checked between segments.
async fn pump(
    reader: &mut tokio::fs::File,
    mapped: &MappedFile,
    segment_size: u64,
    cancel: &CancellationToken,
    writes: &mut Vec<JoinHandle<shelf_storage::error::Result<()>>>,
) -> Result<()> {
    for segment in split(mapped.len(), segment_size) {
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let size = usize::try_from(segment.len()).ok().ok_or_raise(|| ErrorKind::Transfer)?;
        let mut buffer = vec![0; size];
        if let Err(e) = reader.read_exact(&mut buffer).await {
            let kind = if e.kind() == IoErrorKind::UnexpectedEof { ErrorKind::InvalidArchive } else { ErrorKind::Transfer };
            return Err(e).or_raise(|| kind);
        }
        writes.push(mapped.write_segment(segment, buffer));
    }
    Ok(())
}

/// Extract the embedded archive of `bundle` to `destination`.
///
/// The destination is preallocated to the archive's exact length and every
/// segment write is joined before returning, including when reading fails or
/// is cancelled. Cleanup of a partial destination is the caller's job.
#[instrument(level = "debug", skip(cancel))]
pub(crate) async fn extract(
    bundle: &Path,
    destination: &Path,
    segment_size: u64,
    cancel: &CancellationToken,
) -> Result<u64> {
    let owned = bundle.to_path_buf();
    let (offset, len) = tokio::task::spawn_blocking(move || locate(&owned)).await.or_raise(|| ErrorKind::Transfer)??;
    debug!(offset, len, "found embedded archive");
    if cancel.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }

    let mapped = MappedFile::create(destination, len).await.map_err(from_storage)?;
    let mut reader = tokio::fs::File::open(bundle).await.or_raise(|| ErrorKind::Transfer)?;
    reader.seek(SeekFrom::Start(offset)).await.or_raise(|| ErrorKind::Transfer)?;

    let mut writes = Vec::new();
    let pumped = pump(&mut reader, &mapped, segment_size, cancel, &mut writes).await;
    let written = join_all(writes).await;
    pumped?;
    for result in written {
        result.or_raise(|| ErrorKind::Transfer)?.map_err(from_storage)?;
    }
    mapped.finish().await.map_err(from_storage)?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("bundle.cmc");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
        path
    }

    fn metadata_json(title: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "version": "1.0",
            "title": title,
            "tags": ["english"],
            "system": { "ReadProgress": 3 }
        }))
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn extracts_embedded_archive() {
        let dir = tempfile::tempdir().unwrap();
        let comic: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let meta = metadata_json("Teatime Cookbook");
        let bundle = bundle(dir.path(), &[("metadata.json", meta.as_slice()), ("Comic.ZIP", comic.as_slice())]);
        let destination = dir.path().join("out/comic.zip");

        let len = extract(&bundle, &destination, 1024, &CancellationToken::new()).await.unwrap();
        assert_eq!(len, comic.len() as u64);
        assert_eq!(std::fs::read(&destination).unwrap(), comic);
    }

    #[tokio::test]
    async fn empty_embedded_archive() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(dir.path(), &[("comic.zip", b"".as_slice())]);
        let destination = dir.path().join("comic.zip");
        assert_eq!(extract(&bundle, &destination, 1024, &CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(std::fs::metadata(&destination).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn bundle_without_archive_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata_json("Teatime Cookbook");
        let bundle = bundle(dir.path(), &[("metadata.json", meta.as_slice())]);
        let err = extract(&bundle, &dir.path().join("out.zip"), 1024, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArchive));
    }

    #[tokio::test]
    async fn cancelled_before_first_segment() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(dir.path(), &[("comic.zip", [1u8; 4096].as_slice())]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extract(&bundle, &dir.path().join("out.zip"), 1024, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata_json("Teatime Cookbook");
        let bundle = bundle(dir.path(), &[("comic.zip", b"PK".as_slice()), ("metadata.json", meta.as_slice())]);
        let metadata = read_metadata(&bundle).await.unwrap();
        assert_eq!(metadata.title, "Teatime Cookbook");
        assert_eq!(metadata.tags, ["english"]);
        assert_eq!(metadata.source, None);
    }
}
