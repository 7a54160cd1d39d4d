#![allow(dead_code)]

use async_trait::async_trait;
use shelf_compress::Compression;
use shelf_config::{Config, DeleteConfig, MigrationConfig};
use shelf_library::migrate::error::{ErrorKind, Result};
use shelf_library::migrate::{Migrate, MigrationEngine};
use shelf_storage::RetryPolicy;
use shelf_store::PendingMove;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.library = dir.join("library");
    config.database = dir.join("shelf.db");
    config.migration = MigrationConfig { segment_size: 1024, pipeline_depth: 2, copy_chunk_size: 1024 };
    config.delete = DeleteConfig { attempts: 1, backoff_ms: 0 };
    config
}

pub fn engine(config: &Config) -> MigrationEngine {
    MigrationEngine::new(config.migration.clone(), RetryPolicy { attempts: 1, backoff: Default::default() })
}

/// Holds every job at its start until a permit is handed out, then runs it
/// with a real engine. A cancelled job that never got a permit writes nothing.
pub struct Gated {
    engine: MigrationEngine,
    permits: Semaphore,
    started: AtomicUsize,
}

impl Gated {
    pub fn new(engine: MigrationEngine) -> Self {
        Self { engine, permits: Semaphore::new(0), started: AtomicUsize::new(0) }
    }

    /// Let `n` more jobs through.
    pub fn open(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// How many jobs have been started so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Migrate for Gated {
    async fn migrate(&self, job: &PendingMove, cancel: &CancellationToken) -> Result<u64> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
            permit = self.permits.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
            },
        }
        self.engine.migrate(job, cancel).await
    }
}

/// Runs the engine and cancels the job as soon as the destination has bytes
/// on disk, then lets the source finish streaming.
pub struct CancelMidStream {
    engine: MigrationEngine,
    resume: Sender<()>,
}

impl CancelMidStream {
    pub fn new(engine: MigrationEngine, resume: Sender<()>) -> Self {
        Self { engine, resume }
    }
}

#[async_trait]
impl Migrate for CancelMidStream {
    async fn migrate(&self, job: &PendingMove, cancel: &CancellationToken) -> Result<u64> {
        let watch = async {
            while std::fs::metadata(&job.destination).map_or(0, |m| m.len()) == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            cancel.cancel();
            _ = self.resume.send(());
        };
        let run = self.engine.migrate(job, cancel);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => return result,
            () = watch => {},
        }
        run.await
    }
}

/// Serve `head` through a named pipe at `path`, holding `tail` back until
/// the returned sender fires. Reads past `head` block until then.
#[cfg(unix)]
pub fn pipe(path: &Path, head: Vec<u8>, tail: Vec<u8>) -> Sender<()> {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let status = std::process::Command::new("mkfifo").arg(path).status().unwrap();
    assert!(status.success());
    let (resume, resumed) = channel();
    let path = path.to_path_buf();
    std::thread::spawn(move || {
        let mut fifo = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        fifo.write_all(&head).unwrap();
        if resumed.recv().is_ok() {
            // The reader may hang up as soon as it sees the cancellation.
            _ = fifo.write_all(&tail);
        }
    });
    resume
}

/// Bytes that deflate can't shrink much.
pub fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn zip_bytes(pages: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in pages {
        writer.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn write_zip(path: &Path, pages: &[(&str, &[u8])]) -> Vec<u8> {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let data = zip_bytes(pages);
    std::fs::write(path, &data).unwrap();
    data
}

pub fn write_tar(path: &Path, compression: Compression, entries: &[(&str, &[u8])]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let writer = compression.wrap_writer(File::create(path).unwrap()).unwrap();
    let mut builder = tar::Builder::new(writer);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().flush().unwrap();
}

pub fn write_bundle(path: &Path, title: &str, comic: &[u8]) -> PathBuf {
    let metadata = serde_json::to_vec(&serde_json::json!({ "version": "1.0", "title": title })).unwrap();
    write_tar(path, Compression::None, &[("metadata.json", metadata.as_slice()), ("comic.zip", comic)]);
    path.to_path_buf()
}

pub fn zip_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(std::fs::read(path).unwrap())).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            file.read_to_end(&mut data).unwrap();
            (file.name().to_string(), data)
        })
        .collect()
}
