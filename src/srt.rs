//! SRT payload helpers shared by both pipelines.

use std::path::{Path, PathBuf};

/// Sidecar path for `video` in `lang`: `movie.mkv` → `movie.es.srt`.
pub fn sidecar_path(video: &Path, lang: &str) -> PathBuf {
    video.with_extension(format!("{lang}.srt"))
}

/// Strips lines consisting only of `#` characters.
///
/// Some translator builds emit marker lines of hashes that break players;
/// blank lines and everything else pass through. Undecodable or fully
/// filtered payloads are returned unchanged.
pub fn sanitize(payload: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(payload);
    let mut filtered: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.chars().any(|c| c != '#') {
            filtered.push(line);
        }
    }
    if filtered.is_empty() {
        return payload.to_vec();
    }
    let mut result = filtered.join("\n");
    if text.ends_with('\n') {
        result.push('\n');
    }
    result.into_bytes()
}

/// Writes `data` to `dest` atomically: a sibling `.tmp` file is written and
/// renamed over the destination, so readers never observe a partial file.
pub async fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = dest.with_extension(match dest.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    tokio::fs::write(&tmp, data).await?;
    match tokio::fs::rename(&tmp, dest).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}
