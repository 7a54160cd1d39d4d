use crate::ensure_parent;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use memmap2::MmapOptions;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::instrument;

/// A byte range of a [`MappedFile`].
///
/// Segments come from [`split`], which hands out non-overlapping ranges, and
/// are consumed by [`MappedFile::write_segment`]. They aren't `Clone`, so a
/// range can't be written twice.
#[derive(Debug, PartialEq, Eq)]
pub struct Segment {
    index: usize,
    range: Range<u64>,
}

impl Segment {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.range.start
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Split `len` bytes into consecutive segments of `segment_size` bytes; the
/// final segment holds the remainder.
///
/// ```
/// let sizes: Vec<u64> = shelf_storage::split(10, 4).iter().map(|s| s.len()).collect();
/// assert_eq!(sizes, [4, 4, 2]);
/// ```
pub fn split(len: u64, segment_size: u64) -> Vec<Segment> {
    let segment_size = segment_size.max(1);
    (0..len.div_ceil(segment_size))
        .map(|i| {
            let start = i * segment_size;
            let end = (start + segment_size).min(len);
            Segment { index: usize::try_from(i).unwrap_or(usize::MAX), range: start..end }
        })
        .collect()
}

/// A destination file preallocated to its final length and written through
/// independent memory-mapped views, one per [`Segment`].
pub struct MappedFile {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
}

impl MappedFile {
    /// Create (or truncate) `path` and preallocate it to exactly `len` bytes.
    #[instrument(level = "debug")]
    pub async fn create(path: &Path, len: u64) -> Result<Self> {
        ensure_parent(path).await?;
        let owned = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&owned)?;
            file.set_len(len)?;
            Ok(file)
        })
        .await
        .or_raise(|| ErrorKind::Io(std::io::Error::other("preallocation task failed")))?
        .map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(Self { file: Arc::new(file), path: path.to_path_buf(), len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `data` into `segment` as its own blocking unit of work.
    ///
    /// The returned handle must be awaited before the file is finished or
    /// deleted. Writes for different segments may complete in any order.
    pub fn write_segment(&self, segment: Segment, data: Vec<u8>) -> JoinHandle<Result<()>> {
        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        let len = self.len;
        tokio::task::spawn_blocking(move || {
            if segment.range.end > len || data.len() as u64 != segment.len() {
                exn::bail!(ErrorKind::SegmentOutOfBounds { start: segment.range.start, end: segment.range.end, len });
            }
            if segment.is_empty() {
                return Ok(());
            }
            let view_len = usize::try_from(segment.len()).or_raise(|| ErrorKind::SegmentOutOfBounds {
                start: segment.range.start,
                end: segment.range.end,
                len,
            })?;
            // SAFETY: the file was created by `MappedFile::create` and is only
            // written through segment views, which never overlap because
            // `split` hands out disjoint ranges and segments can't be cloned.
            let mut view = unsafe { MmapOptions::new().offset(segment.range.start).len(view_len).map_mut(&*file) }
                .map_err(|e| ErrorKind::from_io(e, &path))?;
            view.copy_from_slice(&data);
            view.flush().map_err(|e| ErrorKind::from_io(e, &path))?;
            Ok(())
        })
    }

    /// Flush file metadata to disk once every segment write has been joined.
    pub async fn finish(self) -> Result<()> {
        let path = self.path.clone();
        let file = self.file;
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .or_raise(|| ErrorKind::Io(std::io::Error::other("sync task failed")))?
            .map_err(|e| ErrorKind::from_io(e, &path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MIB: u64 = 1024 * 1024;

    #[rstest]
    #[case(10 * MIB, 4 * MIB, vec![4 * MIB, 4 * MIB, 2 * MIB])]
    #[case(8 * MIB, 4 * MIB, vec![4 * MIB, 4 * MIB])]
    #[case(1, 4 * MIB, vec![1])]
    #[case(0, 4 * MIB, vec![])]
    fn test_split(#[case] len: u64, #[case] size: u64, #[case] expected: Vec<u64>) {
        let segments = split(len, size);
        assert_eq!(segments.iter().map(Segment::len).collect::<Vec<_>>(), expected);
        // Contiguous and in order.
        let mut next = 0;
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index(), i);
            assert_eq!(segment.offset(), next);
            next += segment.len();
        }
        assert_eq!(next, len);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn segments_written_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/comic.zip");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        let mapped = MappedFile::create(&path, data.len() as u64).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), data.len() as u64);

        let mut handles = Vec::new();
        for segment in split(data.len() as u64, 4096).into_iter().rev() {
            let range = segment.offset() as usize..(segment.offset() + segment.len()) as usize;
            handles.push(mapped.write_segment(segment, data[range].to_vec()));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        mapped.finish().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn rejects_mismatched_segment_data() {
        let dir = tempfile::tempdir().unwrap();
        let mapped = MappedFile::create(&dir.path().join("comic.zip"), 8).await.unwrap();
        let segment = split(8, 8).pop().unwrap();
        let err = mapped.write_segment(segment, vec![0; 3]).await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::SegmentOutOfBounds { .. }));
    }
}
