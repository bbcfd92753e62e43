//! Error types for the sidecar pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Translation error: {0}")]
    Translate(#[from] TranslateError),

    #[error("MKV tool error: {0}")]
    MkvTool(#[from] MkvToolError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Environment configuration errors. All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No readable watch directories among {configured:?}")]
    NoWatchDirs { configured: Vec<String> },

    #[error("No usable target languages remain after validation")]
    NoTargetLanguages,

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Persistent store operation errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to open queue database '{path}': {message}")]
    OpenFailed { path: PathBuf, message: String },

    #[error("Queue database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors from the translation service client.
///
/// The worker pools react differently to transient and permanent failures,
/// so the distinction is part of the type.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("HTTP {status} from translator: {message}")]
    Status { status: u16, message: String },

    #[error("Translator request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Translator request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Malformed translator response: {0}")]
    MalformedResponse(String),

    #[error("Translation {lang_source} -> {target} is not supported")]
    Unsupported { lang_source: String, target: String },

    #[error("Failed to read source file: {0}")]
    Io(#[from] std::io::Error),
}

impl TranslateError {
    /// Whether a retry against a healthy server could succeed.
    ///
    /// Auth and rate-limit statuses count as transient: they clear when the
    /// operator fixes credentials or the server sheds load. Other 4xx codes
    /// mean the request itself is bad and will never succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Network(_) | Self::RetriesExhausted { .. } => true,
            Self::MalformedResponse(_) | Self::Unsupported { .. } | Self::Io(_) => false,
        }
    }
}

/// Statuses worth retrying with backoff.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 408 | 429) || status >= 500
}

/// Failures from ffprobe, ffmpeg, or mkvpropedit invocations.
#[derive(Error, Debug)]
pub enum MkvToolError {
    #[error("ffprobe failed for '{path}': {stderr}")]
    ProbeFailed { path: PathBuf, stderr: String },

    #[error("ffmpeg failed for '{path}' track={track}: {stderr}")]
    ExtractFailed {
        path: PathBuf,
        track: String,
        stderr: String,
    },

    #[error("mkvpropedit failed for '{path}': {stderr}")]
    TagFailed { path: PathBuf, stderr: String },

    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Failed to parse probe output: {0}")]
    Parse(String),

    #[error("File vanished: '{0}'")]
    Missing(PathBuf),
}

/// File watcher errors.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to watch directory '{path}': {message}")]
    WatchFailed { path: PathBuf, message: String },

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// Media-server refresh and metrics export errors.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Media server refresh failed with HTTP {status}")]
    RefreshFailed { status: u16 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metrics export failed: {0}")]
    MetricsFailed(String),
}
