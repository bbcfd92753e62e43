//! File-size stability detection.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// Hard ceiling on how long a single file may take to stabilize.
pub const MAX_WAIT: Duration = Duration::from_secs(30);

/// Polls `stat().size` every `interval` until two consecutive samples match.
///
/// Returns false when the file disappears while waiting or the ceiling is
/// exceeded.
pub async fn wait_for_stable(path: &Path, interval: Duration) -> bool {
    let start = Instant::now();
    loop {
        let Ok(size) = std::fs::metadata(path).map(|m| m.len()) else {
            return false;
        };
        tokio::time::sleep(interval).await;
        let Ok(new_size) = std::fs::metadata(path).map(|m| m.len()) else {
            return false;
        };
        if new_size == size {
            return true;
        }
        if start.elapsed() > MAX_WAIT {
            warn!(path = %path.display(), "Timed out waiting for file to stabilize");
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn stable_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.en.srt");
        fs::write(&path, "content").unwrap();
        assert!(wait_for_stable(&path, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.en.srt");
        assert!(!wait_for_stable(&path, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn file_deleted_mid_wait_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.en.srt");
        fs::write(&path, "content").unwrap();

        let waiter = {
            let path = path.clone();
            tokio::spawn(async move { wait_for_stable(&path, Duration::from_millis(50)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fs::remove_file(&path).unwrap();
        assert!(!waiter.await.unwrap());
    }
}
