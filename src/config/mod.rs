//! Environment-driven configuration.

pub mod concurrency;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ConfigError;

const MAX_WORKERS: usize = 10;

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Roots watched for `*<src_ext>` sidecar sources.
    pub watch_dirs: Vec<PathBuf>,
    /// Roots scanned for `*.mkv` videos. Empty disables the MKV pipeline.
    pub mkv_dirs: Vec<PathBuf>,
    /// Desired output languages, ISO-639-1, deduplicated.
    pub target_langs: Vec<String>,
    /// Input suffix for the sidecar pipeline, e.g. `.en.srt`.
    pub src_ext: String,
    /// Translator base URL.
    pub api_url: String,
    /// Optional translator API key, forwarded as a form field.
    pub api_key: Option<String>,
    /// Worker pool cap for both pipelines.
    pub workers: usize,
    /// Sidecar queue database path.
    pub queue_db: PathBuf,
    /// MKV work index database path.
    pub mkv_work_db: PathBuf,
    /// Probe cache database path.
    pub probe_cache_db: PathBuf,
    /// In-memory probe cache bound.
    pub probe_cache_entries: usize,
    /// Translator retry attempts before giving up.
    pub retry_count: u32,
    /// Base delay of the exponential backoff schedule.
    pub backoff_delay: Duration,
    /// Short timeout for health probes and language discovery.
    pub http_timeout: Duration,
    /// Long timeout for translate requests.
    pub translation_timeout: Duration,
    /// Reuse pooled connections instead of one connection per request.
    pub persistent_session: bool,
    /// Health-probe cadence while the translator is down.
    pub availability_poll: Duration,
    /// Sidecar worker idle window before exiting.
    pub idle_timeout: Duration,
    /// Seconds between file-size stability samples.
    pub debounce: Duration,
    /// Periodic full-scan cadence.
    pub scan_interval: Duration,
    /// Preferred source language for MKV stream selection.
    pub preferred_source_lang: Option<String>,
    /// Confidence floor for language detection when tagging streams.
    pub min_detection_confidence: f64,
    /// Optional media-server refresh endpoint.
    pub jellyfin: Option<JellyfinConfig>,
    /// Optional webhook listener.
    pub webhook: Option<WebhookConfig>,
    /// Prometheus metrics port; 0 disables the endpoint.
    pub metrics_port: u16,
}

/// Jellyfin refresh endpoint settings.
#[derive(Debug, Clone)]
pub struct JellyfinConfig {
    pub base_url: String,
    pub token: String,
}

/// Webhook listener settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Config {
    /// Builds the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let watch_dirs = parse_paths(lookup("WATCH_DIRS").as_deref().unwrap_or("/data"));
        let mkv_dirs = parse_paths(lookup("MKV_DIRS").as_deref().unwrap_or(""));

        let target_langs =
            parse_target_langs(lookup("TARGET_LANGS").as_deref().unwrap_or("nl,bs"));
        if target_langs.is_empty() {
            return Err(ConfigError::NoTargetLanguages);
        }

        let src_ext = lookup("SRC_EXT").unwrap_or_else(|| ".en.srt".to_string());

        let mut api_url = lookup("LIBRETRANSLATE_URL")
            .unwrap_or_else(|| "http://libretranslate:5000".to_string());
        api_url = api_url.trim_end_matches('/').to_string();
        // Older deployments configured the full endpoint; accept either form.
        if let Some(base) = api_url.strip_suffix("/translate_file") {
            api_url = base.to_string();
        }

        let workers = match lookup("WORKERS") {
            Some(raw) => {
                let requested = parse_number(&raw, "WORKERS", 1usize)?;
                if requested > MAX_WORKERS {
                    warn!(
                        requested,
                        cap = MAX_WORKERS,
                        "Capping worker count to prevent instability"
                    );
                }
                requested.clamp(1, MAX_WORKERS)
            }
            None => concurrency::derive_workers(concurrency::parse_cpu_cores(
                lookup("CPU_CORES").as_deref(),
            )),
        };

        let queue_db = PathBuf::from(
            lookup("QUEUE_DB").unwrap_or_else(|| "/config/queue.db".to_string()),
        );
        let state_dir = queue_db
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mkv_work_db = lookup("MKV_WORK_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("mkv_work.db"));
        let probe_cache_db = lookup("PROBE_CACHE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("probe_cache.db"));

        let retry_count = parse_opt_number(&lookup, "RETRY_COUNT", 3u32)?;
        let backoff_delay = parse_secs(&lookup, "BACKOFF_DELAY", 1.0)?;
        let http_timeout = parse_secs(&lookup, "HTTP_TIMEOUT", 30.0)?;
        let translation_timeout = parse_secs(&lookup, "TRANSLATION_TIMEOUT", 900.0)?;
        let availability_poll = parse_secs(&lookup, "AVAILABILITY_POLL_SECONDS", 5.0)?;
        let idle_timeout = parse_secs(&lookup, "IDLE_TIMEOUT_SECONDS", 1800.0)?;
        let debounce = parse_secs(&lookup, "DEBOUNCE", 2.0)?;
        let scan_minutes = parse_opt_number(&lookup, "SCAN_INTERVAL_MINUTES", 360u64)?;
        let probe_cache_entries = parse_opt_number(&lookup, "PROBE_CACHE_ENTRIES", 2048usize)?;
        let metrics_port = parse_opt_number(&lookup, "METRICS_PORT", 0u16)?;
        let min_detection_confidence =
            parse_float(&lookup, "MIN_DETECTION_CONFIDENCE", 0.85)?;

        let persistent_session = lookup("PERSISTENT_SESSION")
            .map(|raw| matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let preferred_source_lang = lookup("PREFERRED_SOURCE_LANG")
            .map(|raw| raw.trim().to_lowercase())
            .filter(|lang| !lang.is_empty());

        let jellyfin = match (lookup("JELLYFIN_URL"), lookup("JELLYFIN_TOKEN")) {
            (Some(base_url), Some(token)) if !base_url.is_empty() && !token.is_empty() => {
                Some(JellyfinConfig {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    token,
                })
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("Jellyfin integration requires both JELLYFIN_URL and JELLYFIN_TOKEN; disabled");
                None
            }
            _ => None,
        };

        let webhook = match lookup("WEBHOOK_PORT") {
            Some(raw) => {
                let port = parse_number(&raw, "WEBHOOK_PORT", 0u16)?;
                Some(WebhookConfig {
                    host: lookup("WEBHOOK_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                    port,
                    token: lookup("WEBHOOK_TOKEN").filter(|t| !t.is_empty()),
                })
            }
            None => None,
        };

        let config = Self {
            watch_dirs,
            mkv_dirs,
            target_langs,
            src_ext,
            api_url,
            api_key: lookup("LIBRETRANSLATE_API_KEY").filter(|k| !k.is_empty()),
            workers,
            queue_db,
            mkv_work_db,
            probe_cache_db,
            probe_cache_entries,
            retry_count,
            backoff_delay,
            http_timeout,
            translation_timeout,
            persistent_session,
            availability_poll,
            idle_timeout,
            debounce,
            scan_interval: Duration::from_secs(scan_minutes.max(1) * 60),
            preferred_source_lang,
            min_detection_confidence,
            jellyfin,
            webhook,
            metrics_port,
        };

        debug!(?config, "Configuration resolved");
        Ok(config)
    }

    /// Drops unreadable roots, failing when no sidecar watch root survives.
    pub fn validate_roots(&mut self) -> Result<(), ConfigError> {
        let configured: Vec<String> = self
            .watch_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        self.watch_dirs.retain(|dir| readable_dir(dir, "watch"));
        if self.watch_dirs.is_empty() {
            return Err(ConfigError::NoWatchDirs { configured });
        }

        self.mkv_dirs.retain(|dir| readable_dir(dir, "mkv"));
        Ok(())
    }

    /// Source language of sidecar inputs, derived from the extension.
    ///
    /// `.en.srt` yields `en`; unrecognizable extensions fall back to `en`.
    pub fn source_lang(&self) -> String {
        let trimmed = self.src_ext.trim_start_matches('.');
        let mut parts = trimmed.split('.');
        if let Some(first) = parts.next() {
            if parts.next().is_some()
                && (2..=3).contains(&first.len())
                && first.chars().all(|c| c.is_ascii_alphabetic())
            {
                return first.to_lowercase();
            }
        }
        "en".to_string()
    }
}

fn readable_dir(dir: &Path, kind: &str) -> bool {
    if !dir.is_dir() {
        warn!(path = %dir.display(), kind, "Directory does not exist; ignoring");
        return false;
    }
    if std::fs::read_dir(dir).is_err() {
        warn!(path = %dir.display(), kind, "Directory is not readable; ignoring");
        return false;
    }
    true
}

fn parse_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(':')
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Normalizes the `TARGET_LANGS` list: lowercase, alphabetic, deduplicated.
pub fn parse_target_langs(raw: &str) -> Vec<String> {
    let mut langs = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for lang in raw.split(',') {
        let cleaned = lang.trim();
        if cleaned.is_empty() {
            warn!("Empty language code in TARGET_LANGS; ignoring");
            continue;
        }
        if !cleaned.chars().all(|c| c.is_ascii_alphabetic()) {
            warn!(code = cleaned, "Invalid language code in TARGET_LANGS; ignoring");
            continue;
        }
        let normalized = cleaned.to_lowercase();
        if !seen.insert(normalized.clone()) {
            debug!(code = cleaned, "Duplicate language code in TARGET_LANGS; ignoring");
            continue;
        }
        langs.push(normalized);
    }
    langs
}

fn parse_number<T>(raw: &str, var: &str, _default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        message: format!("'{raw}' is not a valid number"),
    })
}

fn parse_opt_number<T, F>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => parse_number(&raw, var, default),
        None => Ok(default),
    }
}

fn parse_float<F>(lookup: &F, var: &str, default: f64) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse::<f64>().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            message: format!("'{raw}' is not a valid number"),
        }),
        None => Ok(default),
    }
}

fn parse_secs<F>(lookup: &F, var: &str, default: f64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_float(lookup, var, default)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::InvalidValue {
            var: var.to_string(),
            message: "not a usable duration".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}
