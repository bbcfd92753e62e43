//! Ignore-marker handling.
//!
//! A directory containing a file named `.babelarr_ignore` is excluded from
//! scanning and cleanup, along with everything beneath it.

use std::path::Path;

/// Marker filename checked in each directory.
pub const MARKER_FILENAME: &str = ".babelarr_ignore";

/// Returns true if `path` or any ancestor up to `root` contains the marker.
///
/// When `root` is `None` the walk continues to the filesystem root.
pub fn is_path_ignored(path: &Path, root: Option<&Path>) -> bool {
    let mut current = if path.is_dir() {
        path
    } else {
        match path.parent() {
            Some(parent) => parent,
            None => return false,
        }
    };

    loop {
        if current.join(MARKER_FILENAME).exists() {
            return true;
        }
        if let Some(limit) = root {
            if current == limit {
                break;
            }
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    false
}
