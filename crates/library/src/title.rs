//! Titles and canonical paths.

use shelf_store::ContentKey;
use std::path::{Path, PathBuf};

const BRACKETS: [(char, char); 4] = [('[', ']'), ('【', '】'), ('〔', '〕'), ('［', '］')];

/// Where the comic with `key` lives inside the library `root`.
pub fn canonical_path(root: &Path, key: &ContentKey) -> PathBuf {
    root.join(key.canonical_file_name())
}

/// Derive a comic title from a file or directory name.
///
/// Archive extensions are dropped (both parts of `.tar.gz` and friends) and
/// bracketed tag blocks such as `[Scanlator]` or `【English】` are removed.
/// An opening bracket that never closes is kept, along with everything after
/// it.
///
/// ```
/// use shelf_library::title_from_path;
///
/// assert_eq!(title_from_path("/downloads/[Circle] Teatime Cookbook [en].zip"), "Teatime Cookbook");
/// assert_eq!(title_from_path("Moonlight.tar.gz"), "Moonlight");
/// ```
pub fn title_from_path(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let name = if path.is_dir() { path.file_name() } else { strip_extensions(path) };
    strip_tags(&name.map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
}

fn strip_extensions(path: &Path) -> Option<&std::ffi::OsStr> {
    let stem = path.file_stem()?;
    let inner = Path::new(stem);
    match inner.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("tar") => inner.file_stem(),
        _ => Some(stem),
    }
}

fn strip_tags(name: &str) -> String {
    let mut title = String::with_capacity(name.len());
    // Opening bracket, its closing partner, nesting depth, and the skipped text.
    let mut open: Option<(char, char, usize, String)> = None;
    for c in name.chars() {
        match open.as_mut() {
            None => match BRACKETS.iter().find(|(o, _)| *o == c) {
                Some(&(o, close)) => open = Some((o, close, 1, String::new())),
                None => title.push(c),
            },
            Some((_, close, depth, _)) if c == *close && *depth == 1 => open = None,
            Some((_, close, depth, skipped)) => {
                if c == *close {
                    *depth -= 1;
                } else if BRACKETS.iter().any(|(o, _)| *o == c) {
                    *depth += 1;
                }
                skipped.push(c);
            },
        }
    }
    if let Some((o, _, _, skipped)) = open {
        title.push(o);
        title.push_str(&skipped);
    }
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}
