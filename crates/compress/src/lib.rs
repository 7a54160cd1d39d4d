//! Stream compression and archive format detection.
//!
//! This crate wraps several compression libraries behind a unified
//! [`Compression`] enum and classifies comic archives by file name into an
//! [`ArchiveFormat`], which decides how the library migrates them:
//!
//! - **Format detection** from file names ([`ArchiveFormat::from_path`],
//!   [`Compression::from_extension`])
//! - **Streaming** via wrapped readers/writers ([`Compression::wrap_reader`],
//!   [`Compression::wrap_writer`])
//!
//! Bzip2 and Gzip are always available; XZ and Zstd sit behind feature flags
//! that are on by default.

mod construct;
pub mod error;
mod ops;

/// A supported stream compression format.
///
/// Variants gated behind feature flags (`xz`, `zstd`) are only
/// available when the corresponding feature is enabled. Defaults to
/// [`None`](Self::None) (uncompressed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    #[cfg(feature = "xz")]
    Xz,
    /// Zstd compression (.zst)
    #[cfg(feature = "zstd")]
    Zstd,
}

/// The container a comic arrives in.
///
/// Only [`Zip`](Self::Zip) is canonical; every other format is converted into
/// it when the comic is moved into the library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// Canonical zip archive (`.zip`).
    Zip,
    /// Sharing bundle (`.cmc`): an uncompressed tar holding the canonical
    /// `comic.zip` next to a `metadata.json` document.
    Bundle,
    /// Tar archive, optionally wrapped in a stream compression format.
    Tar(Compression),
    /// 7-Zip archive (`.7z`, `.cb7`).
    SevenZip,
    /// A plain directory of pages.
    Directory,
}

impl ArchiveFormat {
    /// Whether the format can be copied into the library byte-for-byte.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        matches!(self, Self::Zip)
    }
}
