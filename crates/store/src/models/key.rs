use crate::error::{Error, ErrorKind};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Longest accepted key: a full BLAKE3 digest in hex.
const MAX_KEY_LEN: usize = 64;

/// Stable identifier of a comic, derived from its title.
///
/// Keys are lowercase hexadecimal. New keys are BLAKE3 digests of the title;
/// shorter hex keys (such as 32-character MD5 digests) are accepted when
/// parsed so that existing libraries keep their file names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    /// Derive the key for a title.
    #[must_use]
    pub fn from_title(title: &str) -> Self {
        Self(blake3::hash(title.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the comic inside the library root.
    #[must_use]
    pub fn canonical_file_name(&self) -> String {
        format!("{}.zip", self.0)
    }
}

impl FromStr for ContentKey {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty() && s.len() <= MAX_KEY_LEN && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            exn::bail!(ErrorKind::InvalidData("content key"));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl Display for ContentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
