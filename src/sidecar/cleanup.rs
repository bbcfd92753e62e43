//! Removal of subtitle sidecars whose parent video is gone.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::ignore::{is_path_ignored, MARKER_FILENAME};

/// Removes `.srt` sidecars under the MKV roots that no longer have a
/// matching `.mkv` next to them.
pub struct SidecarCleaner {
    directories: Vec<PathBuf>,
}

impl SidecarCleaner {
    pub fn new(directories: Vec<PathBuf>) -> Self {
        Self { directories }
    }

    /// Deletes orphaned sidecars, returning how many were removed.
    pub fn remove_orphans(&self) -> usize {
        let mut removed = 0;
        for root in &self.directories {
            if !root.is_dir() {
                warn!(path = %root.display(), "Skipping missing cleanup root");
                continue;
            }
            if is_path_ignored(root, Some(root)) {
                info!(path = %root.display(), "Skipping ignored cleanup root");
                continue;
            }
            let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
                !(entry.file_type().is_dir() && entry.path().join(MARKER_FILENAME).exists())
            });
            for entry in walker.filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let subtitle = entry.path();
                if subtitle.extension().map_or(true, |ext| ext != "srt") {
                    continue;
                }
                if has_parent_video(subtitle) {
                    continue;
                }
                match std::fs::remove_file(subtitle) {
                    Ok(()) => {
                        removed += 1;
                        info!(path = %subtitle.display(), "Removed orphaned sidecar");
                    }
                    Err(e) => {
                        warn!(path = %subtitle.display(), error = %e, "Failed to remove sidecar");
                    }
                }
            }
        }
        info!(removed, "Sidecar cleanup complete");
        removed
    }
}

/// `movie.nl.srt` has a parent when `movie.mkv` exists beside it.
fn has_parent_video(subtitle: &Path) -> bool {
    subtitle.with_extension("").with_extension("mkv").exists()
}
