use crate::error::{ErrorKind, Result};
use crate::ensure_parent;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Copy `from` to `to` in chunks of `chunk_size` bytes.
///
/// Cancellation is checked before every chunk; a chunk that has started
/// always finishes. The caller owns cleanup of a partially written `to`.
/// Fails with [`ErrorKind::Truncated`] if fewer bytes were copied than the
/// source reported up-front.
#[instrument(level = "debug", skip(cancel))]
pub async fn copy_file(from: &Path, to: &Path, chunk_size: u64, cancel: &CancellationToken) -> Result<u64> {
    let mut source = File::open(from).await.map_err(|e| ErrorKind::from_io(e, from))?;
    let expected = source.metadata().await.map_err(|e| ErrorKind::from_io(e, from))?.len();
    ensure_parent(to).await?;
    let mut destination = File::create(to).await.map_err(|e| ErrorKind::from_io(e, to))?;

    let chunk_size = chunk_size.max(1);
    let mut buffer = Vec::with_capacity(usize::try_from(chunk_size.min(expected.max(1))).unwrap_or(usize::MAX));
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        buffer.clear();
        let read = (&mut source).take(chunk_size).read_to_end(&mut buffer).await.map_err(|e| ErrorKind::from_io(e, from))?;
        if read == 0 {
            break;
        }
        destination.write_all(&buffer).await.map_err(|e| ErrorKind::from_io(e, to))?;
        copied += read as u64;
    }
    destination.flush().await.map_err(|e| ErrorKind::from_io(e, to))?;
    destination.sync_all().await.map_err(|e| ErrorKind::from_io(e, to))?;
    if copied != expected {
        exn::bail!(ErrorKind::Truncated { expected, actual: copied });
    }
    Ok(copied)
}
