use crate::{ArchiveFormat, Compression};
use std::path::Path;

impl Compression {
    /// Map a single file extension (without the dot) to a stream format.
    ///
    /// Returns `None` for extensions that aren't a stream compression format,
    /// including formats whose feature flag is disabled.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "bz2" => Some(Compression::Bzip2),
            "gz" => Some(Compression::Gzip),
            #[cfg(feature = "xz")]
            "xz" => Some(Compression::Xz),
            #[cfg(feature = "zstd")]
            "zst" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

impl ArchiveFormat {
    /// Classify an archive by its file name.
    ///
    /// Recognises `.zip`, `.cmc`, `.tar`, `.7z`, their comic-book spellings
    /// (`.cbz`, `.cbt`, `.cb7`) and the compressed tar spellings (`.tar.gz`,
    /// `.tgz`, `.tar.bz2`, `.tbz2`, ...). RAR is not supported. Directories can't be
    /// told apart from extension-less files by name alone, so
    /// [`Directory`](Self::Directory) is never returned here.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "zip" | "cbz" => return Some(Self::Zip),
            "cmc" => return Some(Self::Bundle),
            "tar" | "cbt" => return Some(Self::Tar(Compression::None)),
            "7z" | "cb7" => return Some(Self::SevenZip),
            "tgz" => return Some(Self::Tar(Compression::Gzip)),
            "tbz" | "tbz2" => return Some(Self::Tar(Compression::Bzip2)),
            #[cfg(feature = "xz")]
            "txz" => return Some(Self::Tar(Compression::Xz)),
            #[cfg(feature = "zstd")]
            "tzst" => return Some(Self::Tar(Compression::Zstd)),
            _ => {},
        }
        // Double extension: the stem itself has to end in `.tar`.
        let compression = Compression::from_extension(&ext)?;
        let stem = Path::new(path.file_stem()?);
        match stem.extension()?.to_str()?.eq_ignore_ascii_case("tar") {
            true => Some(Self::Tar(compression)),
            false => None,
        }
    }
}
