//! Re-compression into the canonical zip.
//!
//! A producer decompresses source entries one at a time and hands them over
//! a bounded channel to a consumer that deflates them into the destination
//! zip. Both sides run as blocking tasks so decompression of the next entry
//! overlaps compression of the previous one; the channel depth caps how many
//! decoded entries are held in memory at once.

use crate::migrate::error::{ErrorKind, Result, from_storage};
use exn::ResultExt;
use sevenz_rust::{Password, SevenZReader};
use shelf_compress::Compression;
use shelf_storage::ensure_parent;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug)]
pub(crate) enum Source {
    /// A tarball, possibly wrapped in a stream compression format.
    Tar(PathBuf, Compression),
    /// A 7-Zip archive.
    SevenZip(PathBuf),
    /// A directory of pages.
    Directory(PathBuf),
}

/// One decoded entry on its way into the zip.
struct Page {
    name: String,
    data: Vec<u8>,
}

/// Entry name inside the zip: normal components only, joined with `/`.
fn zip_name(path: &Path) -> Option<String> {
    let parts: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Hand a page to the consumer. Returns `false` once the consumer has gone,
/// in which case its own error explains why.
fn send(tx: &Sender<Page>, page: Page) -> bool {
    trace!(name = %page.name, bytes = page.data.len(), "queueing page");
    tx.blocking_send(page).is_ok()
}

fn produce_tar(path: &Path, compression: Compression, tx: &Sender<Page>, cancel: &CancellationToken) -> Result<usize> {
    let file = File::open(path).or_raise(|| ErrorKind::Transfer)?;
    let reader = compression.wrap_reader(BufReader::new(file)).or_raise(|| ErrorKind::InvalidArchive)?;
    let mut archive = tar::Archive::new(reader);
    let mut sent = 0;
    for entry in archive.entries().or_raise(|| ErrorKind::InvalidArchive)? {
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let mut entry = entry.or_raise(|| ErrorKind::InvalidArchive)?;
        if !entry.header().entry_type().is_file() || entry.size() == 0 {
            continue;
        }
        let Some(name) = zip_name(&entry.path().or_raise(|| ErrorKind::InvalidArchive)?) else {
            continue;
        };
        let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut data).or_raise(|| ErrorKind::InvalidArchive)?;
        if !send(tx, Page { name, data }) {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn produce_seven_zip(path: &Path, tx: &Sender<Page>, cancel: &CancellationToken) -> Result<usize> {
    let mut archive = SevenZReader::open(path, Password::empty()).or_raise(|| ErrorKind::InvalidArchive)?;
    let mut sent = 0;
    let mut cancelled = false;
    let mut failed: Option<std::io::Error> = None;
    archive
        .for_each_entries(|entry, reader| {
            if cancel.is_cancelled() {
                cancelled = true;
                return Ok(false);
            }
            let name = (!entry.is_directory() && entry.has_stream() && entry.size() > 0)
                .then(|| zip_name(Path::new(entry.name())))
                .flatten();
            let Some(name) = name else {
                // Solid blocks decode sequentially, so skipped entries are
                // still read through.
                if let Err(e) = std::io::copy(reader, &mut std::io::sink()) {
                    failed = Some(e);
                    return Ok(false);
                }
                return Ok(true);
            };
            let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
            if let Err(e) = reader.read_to_end(&mut data) {
                failed = Some(e);
                return Ok(false);
            }
            if !send(tx, Page { name, data }) {
                return Ok(false);
            }
            sent += 1;
            Ok(true)
        })
        .or_raise(|| ErrorKind::InvalidArchive)?;
    if let Some(e) = failed {
        return Err(e).or_raise(|| ErrorKind::InvalidArchive);
    }
    if cancelled {
        exn::bail!(ErrorKind::Cancelled);
    }
    Ok(sent)
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        if kind.is_dir() {
            walk(&entry.path(), files)?;
        } else if kind.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}

fn produce_directory(root: &Path, tx: &Sender<Page>, cancel: &CancellationToken) -> Result<usize> {
    let mut files = Vec::new();
    walk(root, &mut files).or_raise(|| ErrorKind::Transfer)?;
    let mut pages: Vec<(String, PathBuf)> = files
        .into_iter()
        .filter_map(|path| Some((zip_name(path.strip_prefix(root).ok()?)?, path)))
        .collect();
    pages.sort();

    let mut sent = 0;
    for (name, path) in pages {
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let data = std::fs::read(&path).or_raise(|| ErrorKind::Transfer)?;
        if data.is_empty() {
            continue;
        }
        if !send(tx, Page { name, data }) {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn consume(destination: &Path, mut rx: Receiver<Page>) -> Result<u64> {
    let file = File::create(destination).or_raise(|| ErrorKind::Transfer)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    while let Some(page) = rx.blocking_recv() {
        let large = u32::try_from(page.data.len()).is_err();
        zip.start_file(page.name, options.large_file(large)).or_raise(|| ErrorKind::Transfer)?;
        zip.write_all(&page.data).or_raise(|| ErrorKind::Transfer)?;
    }
    let file = zip.finish().or_raise(|| ErrorKind::Transfer)?.into_inner().or_raise(|| ErrorKind::Transfer)?;
    file.sync_all().or_raise(|| ErrorKind::Transfer)?;
    Ok(file.metadata().or_raise(|| ErrorKind::Transfer)?.len())
}

/// Re-compress `source` into a Deflate zip at `destination`.
///
/// Empty files and non-file entries are skipped. Cancellation is checked
/// before each entry. Cleanup of a partial destination is the caller's job.
#[instrument(level = "debug", skip(cancel))]
pub(crate) async fn recompress(
    source: Source,
    destination: &Path,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<u64> {
    ensure_parent(destination).await.map_err(from_storage)?;
    let (tx, rx) = channel(depth.max(1));

    let cancel = cancel.clone();
    let producer = tokio::task::spawn_blocking(move || match source {
        Source::Tar(path, compression) => produce_tar(&path, compression, &tx, &cancel),
        Source::SevenZip(path) => produce_seven_zip(&path, &tx, &cancel),
        Source::Directory(path) => produce_directory(&path, &tx, &cancel),
    });
    let output = destination.to_path_buf();
    let consumer = tokio::task::spawn_blocking(move || consume(&output, rx));

    let (produced, consumed) = tokio::join!(producer, consumer);
    let pages = produced.or_raise(|| ErrorKind::Transfer)??;
    let bytes = consumed.or_raise(|| ErrorKind::Transfer)??;
    debug!(pages, bytes, "re-compressed");
    Ok(bytes)
}
