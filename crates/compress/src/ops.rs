//! Streaming compression wrappers.

use crate::Compression;
use crate::error::{ErrorKind, Result};
use bzip2::{Compression as BzCompression, read::BzDecoder, write::BzEncoder};
use exn::ResultExt;
use flate2::{Compression as GzCompression, read::MultiGzDecoder, write::GzEncoder};
use std::io::{Read, Write};
#[cfg(feature = "xz")]
use xz2::{read::XzDecoder, write::XzEncoder};
#[cfg(feature = "zstd")]
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

// Writers only ever produce test fixtures and re-wrapped tarballs; favour
// speed over size.
const BZIP2_LEVEL: u32 = 6;
#[cfg(feature = "xz")]
const XZ_LEVEL: u32 = 6;
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

pub type BoxRead<'a> = Box<dyn Read + Send + 'a>;
pub type BoxWrite<'a> = Box<dyn Write + Send + 'a>;

impl Compression {
    /// Wrap a reader with the matching decompression layer.
    ///
    /// The returned reader is `Send` so that it can be moved into
    /// [`spawn_blocking`](https://docs.rs/tokio/latest/tokio/task/fn.spawn_blocking.html)
    /// closures.
    pub fn wrap_reader<'a, R: Read + Send + 'a>(&self, reader: R) -> Result<BoxRead<'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Bzip2 => Box::new(BzDecoder::new(reader)),
            // Concatenated gzip members are common for tarballs produced by
            // parallel compressors (pigz), read them all.
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            #[cfg(feature = "xz")]
            Compression::Xz => Box::new(XzDecoder::new(reader)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Box::new(ZstdDecoder::new(reader).or_raise(|| ErrorKind::Encoder)?),
        })
    }

    /// Wrap a writer with the matching compression layer.
    ///
    /// Every encoder finalizes its stream when dropped; call
    /// [`flush`](Write::flush) first to surface I/O errors.
    pub fn wrap_writer<'a, W: Write + Send + 'a>(&self, writer: W) -> Result<BoxWrite<'a>> {
        Ok(match self {
            Compression::None => Box::new(writer),
            Compression::Bzip2 => Box::new(BzEncoder::new(writer, BzCompression::new(BZIP2_LEVEL))),
            Compression::Gzip => Box::new(GzEncoder::new(writer, GzCompression::default())),
            #[cfg(feature = "xz")]
            Compression::Xz => Box::new(XzEncoder::new(writer, XZ_LEVEL)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                Box::new(ZstdEncoder::new(writer, ZSTD_LEVEL).or_raise(|| ErrorKind::Encoder)?.auto_finish())
            },
        })
    }
}
