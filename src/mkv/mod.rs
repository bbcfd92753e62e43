//! MKV subtitle reconciliation: probing, tagging, scanning, and the
//! priority-ordered workflow.

pub mod extract;
pub mod lang;
pub mod scanner;
pub mod tagger;
pub mod workflow;

pub use extract::{MkvExtractor, SubtitleMetrics, SubtitleStream};
pub use scanner::MkvScanner;
pub use tagger::MkvSubtitleTagger;
pub use workflow::MkvWorkflow;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Modification time of `path` in nanoseconds since the epoch.
pub fn mtime_ns(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(system_time_ns(modified))
}

/// `(mtime_ns, size_bytes)` of `path`.
pub fn file_signature(path: &Path) -> std::io::Result<(i64, i64)> {
    let metadata = std::fs::metadata(path)?;
    let mtime = system_time_ns(metadata.modified()?);
    Ok((mtime, metadata.len() as i64))
}

/// Current wall-clock time in nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    system_time_ns(SystemTime::now())
}

fn system_time_ns(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_nanos().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
