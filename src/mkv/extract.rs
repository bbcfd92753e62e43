//! Subtitle stream enumeration and extraction via ffprobe / ffmpeg.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::error::MkvToolError;

/// Metadata about one subtitle stream within an MKV container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleStream {
    /// Absolute stream index as reported by ffprobe.
    pub ffprobe_index: i64,
    /// 1-based index among subtitle streams, used for track selectors.
    pub subtitle_index: usize,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub default: bool,
    /// Payload size from container statistics tags, when present.
    #[serde(default)]
    pub char_count: Option<f64>,
    /// Cue count from container statistics tags, when present.
    #[serde(default)]
    pub cue_count: Option<f64>,
    /// Stream duration in seconds, when known.
    #[serde(default)]
    pub duration: Option<f64>,
}

impl SubtitleStream {
    /// mkvpropedit-compatible track selector, e.g. `track:s2`.
    pub fn track_selector(&self) -> String {
        format!("track:s{}", self.subtitle_index)
    }
}

/// Quality score used to pick between streams sharing a language.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtitleMetrics {
    char_count: f64,
    cue_count: f64,
    duration: f64,
}

impl SubtitleMetrics {
    /// Builds metrics from a stream, treating unknown components as neutral.
    pub fn from_stream(stream: &SubtitleStream) -> Self {
        Self {
            char_count: stream.char_count.unwrap_or(1.0),
            cue_count: stream.cue_count.unwrap_or(1.0),
            duration: stream.duration.unwrap_or(1.0),
        }
    }

    pub fn score(&self) -> f64 {
        self.char_count * self.cue_count * self.duration
    }
}

/// Helper for enumerating and extracting subtitle streams from MKV files.
pub struct MkvExtractor {
    ffprobe_path: String,
    ffmpeg_path: String,
    sample_bytes: usize,
}

impl Default for MkvExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MkvExtractor {
    pub fn new() -> Self {
        Self {
            ffprobe_path: "ffprobe".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            sample_bytes: 8192,
        }
    }

    /// Returns subtitle streams discovered via ffprobe.
    pub async fn list_streams(&self, path: &Path) -> Result<Vec<SubtitleStream>, MkvToolError> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-select_streams", "s"])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MkvToolError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            if !path.exists() {
                return Err(MkvToolError::Missing(path.to_path_buf()));
            }
            return Err(MkvToolError::ProbeFailed {
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_streams(&String::from_utf8_lossy(&output.stdout))
    }

    /// Extracts one text subtitle stream into an SRT file at `dest`.
    pub async fn extract_stream(
        &self,
        path: &Path,
        stream: &SubtitleStream,
        dest: &Path,
    ) -> Result<(), MkvToolError> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-nostdin", "-y", "-v", "error", "-i"])
            .arg(path)
            .arg("-map")
            .arg(format!("0:s:{}", stream.subtitle_index - 1))
            .args(["-c:s", "srt", "-f", "srt"])
            .arg(dest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MkvToolError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            if !path.exists() {
                return Err(MkvToolError::Missing(path.to_path_buf()));
            }
            return Err(MkvToolError::ExtractFailed {
                path: path.to_path_buf(),
                track: stream.track_selector(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(path = %path.display(), track = %stream.track_selector(), "Extracted subtitle stream");
        Ok(())
    }

    /// Returns a bounded sample of the stream for language detection.
    pub async fn extract_sample(
        &self,
        path: &Path,
        stream: &SubtitleStream,
    ) -> Result<Vec<u8>, MkvToolError> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-nostdin", "-v", "error", "-i"])
            .arg(path)
            .arg("-map")
            .arg(format!("0:s:{}", stream.subtitle_index - 1))
            .args(["-c", "copy", "-f", "srt", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MkvToolError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            if !path.exists() {
                return Err(MkvToolError::Missing(path.to_path_buf()));
            }
            return Err(MkvToolError::ExtractFailed {
                path: path.to_path_buf(),
                track: stream.track_selector(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut sample = output.stdout;
        sample.truncate(self.sample_bytes);
        Ok(sample)
    }

    /// Returns a unique temp-file path with the given suffix.
    pub fn create_temp_path(&self, suffix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("babelarr-{}{}", Uuid::new_v4(), suffix))
    }
}

/// Parses ffprobe JSON into subtitle stream records.
pub(crate) fn parse_streams(payload: &str) -> Result<Vec<SubtitleStream>, MkvToolError> {
    let json: serde_json::Value = serde_json::from_str(if payload.trim().is_empty() {
        "{}"
    } else {
        payload
    })
    .map_err(|e| MkvToolError::Parse(e.to_string()))?;

    let mut streams = Vec::new();
    let raw_streams = json
        .get("streams")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();

    for (idx, raw) in raw_streams.iter().enumerate() {
        let tags = raw.get("tags");
        let disposition = raw.get("disposition");

        let language = tag_value(tags, "language")
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty());
        let title = tag_value(tags, "title")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        streams.push(SubtitleStream {
            ffprobe_index: raw
                .get("index")
                .and_then(|v| v.as_i64())
                .unwrap_or((idx + 1) as i64),
            subtitle_index: idx + 1,
            codec: raw
                .get("codec_name")
                .and_then(|v| v.as_str())
                .map(String::from),
            language,
            title,
            forced: disposition_flag(disposition, "forced"),
            default: disposition_flag(disposition, "default"),
            char_count: stat_tag(tags, "NUMBER_OF_BYTES"),
            cue_count: stat_tag(tags, "NUMBER_OF_FRAMES"),
            duration: stream_duration(raw, tags),
        });
    }
    Ok(streams)
}

fn disposition_flag(disposition: Option<&serde_json::Value>, name: &str) -> bool {
    disposition
        .and_then(|d| d.get(name))
        .and_then(|v| v.as_i64())
        == Some(1)
}

/// Looks up a tag case-insensitively, also accepting per-language variants
/// such as `NUMBER_OF_FRAMES-eng`.
fn tag_value(tags: Option<&serde_json::Value>, name: &str) -> Option<String> {
    let object = tags?.as_object()?;
    let upper = name.to_uppercase();
    let prefixed = format!("{upper}-");
    for (key, value) in object {
        let key_upper = key.to_uppercase();
        if key_upper == upper || key_upper.starts_with(&prefixed) {
            if let Some(s) = value.as_str() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn stat_tag(tags: Option<&serde_json::Value>, name: &str) -> Option<f64> {
    tag_value(tags, name)?.trim().parse::<f64>().ok()
}

fn stream_duration(raw: &serde_json::Value, tags: Option<&serde_json::Value>) -> Option<f64> {
    if let Some(secs) = raw
        .get("duration")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
    {
        return Some(secs);
    }
    tag_value(tags, "DURATION").and_then(|raw| parse_clock_duration(&raw))
}

/// Parses Matroska `HH:MM:SS.nnnnnnnnn` duration tags into seconds.
fn parse_clock_duration(raw: &str) -> Option<f64> {
    let mut parts = raw.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 2,
                "codec_name": "subrip",
                "disposition": {"default": 1, "forced": 0},
                "tags": {
                    "language": "eng",
                    "title": "English",
                    "NUMBER_OF_FRAMES-eng": "1500",
                    "NUMBER_OF_BYTES-eng": "52000",
                    "DURATION-eng": "01:30:00.000000000"
                }
            },
            {
                "index": 3,
                "codec_name": "hdmv_pgs_subtitle",
                "disposition": {"default": 0, "forced": 1},
                "tags": {"LANGUAGE": "SPA"}
            },
            {
                "index": 4,
                "codec_name": "ass"
            }
        ]
    }"#;

    #[test]
    fn parse_probe_output() {
        let streams = parse_streams(PROBE_JSON).unwrap();
        assert_eq!(streams.len(), 3);

        let first = &streams[0];
        assert_eq!(first.ffprobe_index, 2);
        assert_eq!(first.subtitle_index, 1);
        assert_eq!(first.language.as_deref(), Some("eng"));
        assert_eq!(first.title.as_deref(), Some("English"));
        assert!(first.default);
        assert!(!first.forced);
        assert_eq!(first.cue_count, Some(1500.0));
        assert_eq!(first.char_count, Some(52000.0));
        assert_eq!(first.duration, Some(5400.0));
        assert_eq!(first.track_selector(), "track:s1");

        let second = &streams[1];
        assert_eq!(second.subtitle_index, 2);
        assert_eq!(second.language.as_deref(), Some("spa"));
        assert!(second.forced);

        let third = &streams[2];
        assert_eq!(third.language, None);
        assert_eq!(third.title, None);
    }

    #[test]
    fn parse_empty_payload() {
        assert!(parse_streams("").unwrap().is_empty());
        assert!(parse_streams("{}").unwrap().is_empty());
    }

    #[test]
    fn clock_duration() {
        assert_eq!(parse_clock_duration("01:00:00.000000000"), Some(3600.0));
        assert_eq!(parse_clock_duration("00:00:12.5"), Some(12.5));
        assert_eq!(parse_clock_duration("garbage"), None);
    }

    #[test]
    fn metrics_use_neutral_defaults() {
        let streams = parse_streams(PROBE_JSON).unwrap();
        let rich = SubtitleMetrics::from_stream(&streams[0]);
        let bare = SubtitleMetrics::from_stream(&streams[2]);
        assert!(rich.score() > bare.score());
        assert_eq!(bare.score(), 1.0);
    }
}
