//! Language detection and tagging for untagged MKV subtitle streams.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info};

use super::extract::{MkvExtractor, SubtitleStream};
use super::lang::{is_text_subtitle_codec, normalize_language_code};
use crate::error::MkvToolError;
use crate::translate::{Detection, Translate};

/// Detects stream languages from a bounded sample and persists tags via
/// mkvpropedit. Tagging failures are reported but never fatal to callers.
pub struct MkvSubtitleTagger {
    extractor: Arc<MkvExtractor>,
    translator: Arc<dyn Translate>,
    mkvpropedit_path: String,
    min_confidence: f64,
}

impl MkvSubtitleTagger {
    pub fn new(
        extractor: Arc<MkvExtractor>,
        translator: Arc<dyn Translate>,
        min_confidence: f64,
    ) -> Self {
        Self {
            extractor,
            translator,
            mkvpropedit_path: "mkvpropedit".to_string(),
            min_confidence,
        }
    }

    pub fn extractor(&self) -> &Arc<MkvExtractor> {
        &self.extractor
    }

    fn is_supported_codec(stream: &SubtitleStream) -> bool {
        match stream.codec.as_deref() {
            // Unknown codecs get the benefit of the doubt; the sample
            // extraction fails cleanly when they turn out to be bitmaps.
            None | Some("") => true,
            Some(codec) => is_text_subtitle_codec(codec),
        }
    }

    /// Returns the detected language for `stream`, or `None` when the codec
    /// is not text or detection stays below the confidence floor.
    pub async fn detect_stream_language(
        &self,
        path: &Path,
        stream: &SubtitleStream,
    ) -> Result<Option<Detection>, MkvToolError> {
        if !Self::is_supported_codec(stream) {
            debug!(
                path = %path.display(),
                track = %stream.track_selector(),
                codec = stream.codec.as_deref().unwrap_or("unknown"),
                "Skipping detection for non-text codec"
            );
            return Ok(None);
        }
        let sample = self.extractor.extract_sample(path, stream).await?;
        match self
            .translator
            .detect_language(&sample, self.min_confidence)
            .await
        {
            Ok(detection) => Ok(detection),
            Err(e) => {
                debug!(path = %path.display(), track = %stream.track_selector(), error = %e, "Detection request failed");
                Ok(None)
            }
        }
    }

    /// Detects the language and applies a track tag when it differs from the
    /// current one. Returns the detection when a tag was applied.
    pub async fn detect_and_tag(
        &self,
        path: &Path,
        stream: &SubtitleStream,
    ) -> Result<Option<Detection>, MkvToolError> {
        let Some(detection) = self.detect_stream_language(path, stream).await? else {
            return Ok(None);
        };
        let Some(iso_code) = normalize_language_code(Some(&detection.language)) else {
            return Ok(None);
        };
        let current = normalize_language_code(stream.language.as_deref());
        if current.as_deref() == Some(iso_code.as_str()) {
            debug!(
                path = %path.display(),
                track = %stream.track_selector(),
                language = %iso_code,
                "Stream already tagged"
            );
            return Ok(None);
        }
        self.apply_language_tag(path, stream, &iso_code).await?;
        info!(
            path = %path.display(),
            track = %stream.track_selector(),
            language = %iso_code,
            confidence = detection.confidence,
            "Applied language tag"
        );
        Ok(Some(detection))
    }

    async fn apply_language_tag(
        &self,
        path: &Path,
        stream: &SubtitleStream,
        language: &str,
    ) -> Result<(), MkvToolError> {
        let output = Command::new(&self.mkvpropedit_path)
            .arg(path)
            .arg("--edit")
            .arg(stream.track_selector())
            .arg("--set")
            .arg(format!("language={language}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MkvToolError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(MkvToolError::TagFailed {
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
