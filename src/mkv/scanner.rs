//! Per-video subtitle reconciliation.
//!
//! The scanner walks the MKV roots, decides which target languages are
//! missing for each video, and drives extract → translate → write for the
//! pending ones.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::extract::{SubtitleMetrics, SubtitleStream};
use super::lang::{
    is_text_subtitle_codec, language_hint_from_title, normalize_language_code,
    normalize_language_code_iso1, title_indicates_hearing_impaired,
};
use super::tagger::MkvSubtitleTagger;
use super::{mtime_ns, now_ns};
use crate::db::ProbeCache;
use crate::error::MkvToolError;
use crate::ignore::{is_path_ignored, MARKER_FILENAME};
use crate::notify::JellyfinClient;
use crate::srt;
use crate::translate::Translate;

/// Videos modified within this window are queued at high priority.
pub const RECENT_PRIORITY_WINDOW_NS: i64 = 24 * 60 * 60 * 1_000_000_000;

/// Result of processing one video.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Sidecars written.
    pub translated: usize,
    /// A transient failure occurred; the work record should return to pending.
    pub requeue: bool,
    /// The video vanished while processing.
    pub missing: bool,
}

struct Candidate {
    stream: SubtitleStream,
    metrics: SubtitleMetrics,
    specialized: bool,
}

impl Candidate {
    fn score(&self) -> f64 {
        let multiplier = if self.specialized { 0.5 } else { 1.0 };
        self.metrics.score() * multiplier
    }
}

/// Walks configured directories and translates missing subtitle languages.
pub struct MkvScanner {
    directories: Vec<PathBuf>,
    tagger: Arc<MkvSubtitleTagger>,
    translator: Arc<dyn Translate>,
    ensure_langs: Vec<String>,
    preferred_source: Option<String>,
    probe_cache: Arc<ProbeCache>,
    jellyfin: Option<Arc<JellyfinClient>>,
}

impl MkvScanner {
    pub fn new(
        directories: Vec<PathBuf>,
        tagger: Arc<MkvSubtitleTagger>,
        translator: Arc<dyn Translate>,
        ensure_langs: &[String],
        preferred_source: Option<&str>,
        probe_cache: Arc<ProbeCache>,
        jellyfin: Option<Arc<JellyfinClient>>,
    ) -> Self {
        Self {
            directories,
            tagger,
            translator,
            ensure_langs: ensure_langs
                .iter()
                .filter_map(|lang| normalize_language_code_iso1(Some(lang)))
                .collect(),
            preferred_source: normalize_language_code_iso1(preferred_source),
            probe_cache,
            jellyfin,
        }
    }

    /// Full walk of every configured root. Returns the number of videos
    /// seen, the tasks that need work, and the set of paths on disk (for
    /// pruning persisted state).
    pub async fn scan(&self) -> (usize, Vec<(PathBuf, u8)>, HashSet<String>) {
        let mut file_paths = Vec::new();
        let mut seen = HashSet::new();

        for root in &self.directories {
            if !root.is_dir() {
                warn!(path = %root.display(), "Skipping missing MKV root");
                continue;
            }
            if is_path_ignored(root, Some(root)) {
                info!(path = %root.display(), "Skipping ignored MKV root");
                continue;
            }
            let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
                !(entry.file_type().is_dir() && entry.path().join(MARKER_FILENAME).exists())
            });
            for entry in walker.filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "mkv") {
                    continue;
                }
                seen.insert(path.to_string_lossy().to_string());
                file_paths.push(path.to_path_buf());
            }
        }

        let recent_threshold_ns = now_ns() - RECENT_PRIORITY_WINDOW_NS;
        let mut tasks = Vec::new();
        for path in &file_paths {
            let (needs_work, is_recent) = self.evaluate_file(path, recent_threshold_ns).await;
            if needs_work {
                tasks.push((path.clone(), if is_recent { 0 } else { 1 }));
            }
        }

        if !seen.is_empty() {
            self.probe_cache.prune_entries(&seen);
        }
        (file_paths.len(), tasks, seen)
    }

    /// Cheap decision whether `path` has any pending target language.
    async fn evaluate_file(&self, path: &Path, recent_threshold_ns: i64) -> (bool, bool) {
        let mtime = match mtime_ns(path) {
            Ok(mtime) => mtime,
            Err(_) => {
                self.probe_cache.invalidate_path(path);
                return (false, false);
            }
        };
        let is_recent = mtime >= recent_threshold_ns;

        if self.sidecars_up_to_date(path, mtime) {
            return (false, is_recent);
        }

        let (cached_mtime, cached_langs) = self.probe_cache.get_entry(path);
        if cached_mtime == Some(mtime)
            && !self.has_pending_targets(path, mtime, cached_langs.as_ref())
        {
            return (false, is_recent);
        }

        let mut streams = match self.probe_cache.list_streams(path).await {
            Ok(streams) => streams,
            Err(MkvToolError::Missing(_)) => {
                self.probe_cache.invalidate_path(path);
                return (false, is_recent);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Stream enumeration failed");
                return (false, is_recent);
            }
        };
        self.ensure_tagged_streams(path, &mut streams).await;
        let candidates = self.map_streams_to_languages(path, &streams).await;
        let existing: HashSet<String> = candidates.keys().cloned().collect();
        (
            self.has_pending_targets(path, mtime, Some(&existing)),
            is_recent,
        )
    }

    /// Reconciles one video: probes, tags, cleans stale outputs, translates
    /// every pending target language, and refreshes caches.
    pub async fn process_file(&self, path: &Path) -> ProcessOutcome {
        let mtime = match mtime_ns(path) {
            Ok(mtime) => mtime,
            Err(_) => {
                self.purge(path);
                return ProcessOutcome {
                    missing: true,
                    ..Default::default()
                };
            }
        };
        info!(path = %path.display(), "Processing video");

        let (cached_mtime, cached_langs) = self.probe_cache.get_entry(path);

        // Both no-op shortcuts come before any probing, tagging, or cleanup:
        // a satisfied video must not be touched at all.
        if self.sidecars_up_to_date(path, mtime) {
            self.probe_cache
                .update_entry(path, mtime, cached_langs.as_ref());
            info!(path = %path.display(), reason = "sidecars_up_to_date", "Video complete");
            return ProcessOutcome::default();
        }

        if cached_mtime == Some(mtime)
            && !self.has_pending_targets(path, mtime, cached_langs.as_ref())
        {
            debug!(path = %path.display(), "Cache hit; nothing pending");
            return ProcessOutcome::default();
        }

        let mut streams = match self.probe_cache.list_streams(path).await {
            Ok(streams) => streams,
            Err(MkvToolError::Missing(_)) => {
                self.purge(path);
                info!(path = %path.display(), reason = "missing", "Video skipped");
                return ProcessOutcome {
                    missing: true,
                    ..Default::default()
                };
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Stream enumeration failed");
                return ProcessOutcome::default();
            }
        };

        self.ensure_tagged_streams(path, &mut streams).await;
        let candidates = self.map_streams_to_languages(path, &streams).await;
        let existing: HashSet<String> = candidates.keys().cloned().collect();

        self.cleanup_embedded_sidecars(path, &existing).await;

        let translation = self
            .translate_missing(path, &candidates, mtime, &existing)
            .await;
        if translation.missing {
            self.purge(path);
            return ProcessOutcome {
                translated: translation.translated,
                requeue: false,
                missing: true,
            };
        }

        let updated_mtime = match mtime_ns(path) {
            Ok(mtime) => mtime,
            Err(_) => {
                self.purge(path);
                return ProcessOutcome {
                    translated: translation.translated,
                    requeue: false,
                    missing: true,
                };
            }
        };

        if !translation.any_errors {
            let cache_languages = if translation.no_source_targets {
                // No usable source exists; record targets as satisfied so the
                // scanner stops revisiting until the file changes.
                Some(self.ensure_langs.iter().cloned().collect::<HashSet<_>>())
            } else if existing.is_empty() {
                None
            } else {
                Some(existing.clone())
            };
            self.probe_cache
                .update_entry(path, updated_mtime, cache_languages.as_ref());
        }

        info!(
            path = %path.display(),
            streams = streams.len(),
            translated = translation.translated,
            errors = translation.any_errors,
            "Video processed"
        );

        if translation.translated > 0 {
            if let Some(jellyfin) = &self.jellyfin {
                jellyfin.refresh_best_effort(path).await;
            }
        }

        ProcessOutcome {
            translated: translation.translated,
            requeue: translation.transient_errors,
            missing: false,
        }
    }

    fn purge(&self, path: &Path) {
        self.probe_cache.invalidate_path(path);
    }

    async fn ensure_tagged_streams(&self, path: &Path, streams: &mut [SubtitleStream]) {
        for stream in streams.iter_mut() {
            if stream.language.is_some() {
                continue;
            }
            match self.tagger.detect_and_tag(path, stream).await {
                Ok(Some(detection)) => {
                    stream.language = Some(detection.language);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        path = %path.display(),
                        track = %stream.track_selector(),
                        error = %e,
                        "Tagging failed"
                    );
                }
            }
        }
    }

    /// Maps text streams to ISO-639-1 candidates, keeping the best-scoring
    /// stream per language.
    async fn map_streams_to_languages(
        &self,
        path: &Path,
        streams: &[SubtitleStream],
    ) -> HashMap<String, Candidate> {
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for stream in streams {
            let codec = stream.codec.as_deref().unwrap_or("");
            if !is_text_subtitle_codec(codec) {
                continue;
            }
            let Some(lang) = self.determine_language(path, stream).await else {
                continue;
            };
            let Some(lang) = normalize_language_code_iso1(Some(&lang)) else {
                continue;
            };
            let candidate = Candidate {
                stream: stream.clone(),
                metrics: SubtitleMetrics::from_stream(stream),
                specialized: is_specialized_stream(stream),
            };
            match candidates.get(&lang) {
                Some(previous) if previous.score() >= candidate.score() => {}
                _ => {
                    candidates.insert(lang, candidate);
                }
            }
        }
        candidates
    }

    /// Best-effort language for a stream: tag, then detection, then title.
    async fn determine_language(&self, path: &Path, stream: &SubtitleStream) -> Option<String> {
        if stream.language.is_none() {
            if let Ok(Some(detection)) = self.tagger.detect_stream_language(path, stream).await {
                if let Some(normalized) = normalize_language_code(Some(&detection.language)) {
                    return Some(normalized);
                }
            }
        }
        if let Some(tagged) = normalize_language_code(stream.language.as_deref()) {
            return Some(tagged);
        }
        normalize_language_code(language_hint_from_title(stream.title.as_deref()).as_deref())
    }

    /// Picks the source stream for `target`: preferred source first, then
    /// configured targets in order, then any candidate in sorted order.
    /// Candidates the translator cannot handle are skipped.
    fn pick_source_stream<'a>(
        &self,
        candidates: &'a HashMap<String, Candidate>,
        target: &str,
    ) -> Option<(String, &'a SubtitleStream)> {
        let mut order: Vec<&String> = Vec::new();
        let mut seen = HashSet::new();

        if let Some(preferred) = &self.preferred_source {
            if candidates.contains_key(preferred) {
                order.push(preferred);
                seen.insert(preferred.clone());
            }
        }
        for lang in &self.ensure_langs {
            if lang != target && candidates.contains_key(lang) && seen.insert(lang.clone()) {
                order.push(lang);
            }
        }
        let mut rest: Vec<&String> = candidates
            .keys()
            .filter(|lang| *lang != target && !seen.contains(*lang))
            .collect();
        rest.sort();
        order.extend(rest);

        for lang in order {
            if lang == target {
                continue;
            }
            if !self.translator.supports_translation(lang, target) {
                continue;
            }
            if !self.ensure_langs.contains(lang) && Some(lang) != self.preferred_source.as_ref() {
                info!(target, source = %lang, "Using fallback source language");
            }
            return Some((lang.clone(), &candidates[lang].stream));
        }
        None
    }

    async fn translate_missing(
        &self,
        path: &Path,
        candidates: &HashMap<String, Candidate>,
        mtime: i64,
        existing: &HashSet<String>,
    ) -> TranslationRound {
        let mut round = TranslationRound::default();
        let mut had_pending = false;
        let mut had_source = false;
        let extractor = self.tagger.extractor().clone();
        let mut extracted: HashMap<String, PathBuf> = HashMap::new();

        for target in &self.ensure_langs {
            if !self.needs_translation(path, target, mtime, Some(existing)) {
                continue;
            }
            had_pending = true;
            let Some((source_lang, stream)) = self.pick_source_stream(candidates, target) else {
                warn!(path = %path.display(), target = %target, "No source stream available");
                continue;
            };
            had_source = true;

            // Extract each source stream at most once per video.
            let selector = stream.track_selector();
            let source_path = match extracted.get(&selector) {
                Some(existing_path) => existing_path.clone(),
                None => {
                    let temp = extractor.create_temp_path(".srt");
                    match extractor.extract_stream(path, stream, &temp).await {
                        Ok(()) => {
                            extracted.insert(selector, temp.clone());
                            temp
                        }
                        Err(MkvToolError::Missing(_)) => {
                            round.missing = true;
                            break;
                        }
                        Err(e) => {
                            error!(
                                path = %path.display(),
                                source = %source_lang,
                                target = %target,
                                error = %e,
                                "Stream extraction failed"
                            );
                            round.any_errors = true;
                            continue;
                        }
                    }
                }
            };

            match self
                .translate_stream(path, &source_path, &source_lang, target)
                .await
            {
                Ok(true) => round.translated += 1,
                Ok(false) => {}
                Err(StreamError::Missing) => {
                    info!(path = %path.display(), target = %target, "Video vanished during translation");
                    round.missing = true;
                    break;
                }
                Err(StreamError::Translate(e)) => {
                    error!(
                        path = %path.display(),
                        source = %source_lang,
                        target = %target,
                        error = %e,
                        "Translation failed"
                    );
                    round.any_errors = true;
                    if e.is_transient() {
                        round.transient_errors = true;
                    }
                }
                Err(StreamError::Io(e)) => {
                    error!(path = %path.display(), target = %target, error = %e, "Sidecar write failed");
                    round.any_errors = true;
                }
            }
        }

        for temp in extracted.values() {
            let _ = tokio::fs::remove_file(temp).await;
        }

        round.no_source_targets = had_pending && !had_source;
        round
    }

    async fn translate_stream(
        &self,
        path: &Path,
        source_path: &Path,
        source_lang: &str,
        target: &str,
    ) -> Result<bool, StreamError> {
        if !path.exists() {
            return Err(StreamError::Missing);
        }
        let dest = srt::sidecar_path(path, target);
        let translated = self
            .translator
            .translate(source_path, source_lang, target)
            .await
            .map_err(StreamError::Translate)?;
        let sanitized = srt::sanitize(&translated);

        // A byte-identical output means a concurrent producer got here first.
        if let Ok(existing) = tokio::fs::read(&dest).await {
            if existing == sanitized {
                info!(
                    path = %path.display(),
                    target,
                    source = source_lang,
                    reason = "unchanged",
                    "Translation skipped"
                );
                return Ok(false);
            }
        }

        srt::write_atomic(&dest, &sanitized)
            .await
            .map_err(StreamError::Io)?;
        info!(
            path = %path.display(),
            target,
            source = source_lang,
            output = %dest.display(),
            "Translation saved"
        );
        Ok(true)
    }

    fn needs_translation(
        &self,
        path: &Path,
        lang: &str,
        mtime: i64,
        existing: Option<&HashSet<String>>,
    ) -> bool {
        if let Some(existing) = existing {
            if existing.contains(lang) {
                return false;
            }
        }
        let dest = srt::sidecar_path(path, lang);
        match mtime_ns(&dest) {
            Ok(dest_mtime) => dest_mtime < mtime,
            Err(_) => true,
        }
    }

    fn has_pending_targets(
        &self,
        path: &Path,
        mtime: i64,
        existing: Option<&HashSet<String>>,
    ) -> bool {
        self.ensure_langs
            .iter()
            .any(|lang| self.needs_translation(path, lang, mtime, existing))
    }

    fn sidecars_up_to_date(&self, path: &Path, mtime: i64) -> bool {
        if self.ensure_langs.is_empty() {
            return false;
        }
        self.ensure_langs.iter().all(|lang| {
            let sidecar = srt::sidecar_path(path, lang);
            matches!(mtime_ns(&sidecar), Ok(sidecar_mtime) if sidecar_mtime >= mtime)
        })
    }

    /// Removes sidecars whose language is present as an embedded stream;
    /// they are stale outputs from before the stream was tagged.
    async fn cleanup_embedded_sidecars(&self, path: &Path, languages: &HashSet<String>) {
        for lang in languages {
            let sidecar = srt::sidecar_path(path, lang);
            if !sidecar.exists() {
                continue;
            }
            match tokio::fs::remove_file(&sidecar).await {
                Ok(()) => {
                    info!(
                        path = %path.display(),
                        lang = %lang,
                        reason = "embedded_stream",
                        "Removed sidecar"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), lang = %lang, error = %e, "Failed to remove sidecar");
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct TranslationRound {
    translated: usize,
    transient_errors: bool,
    any_errors: bool,
    no_source_targets: bool,
    missing: bool,
}

enum StreamError {
    Missing,
    Translate(crate::error::TranslateError),
    Io(std::io::Error),
}

fn is_specialized_stream(stream: &SubtitleStream) -> bool {
    stream.forced || title_indicates_hearing_impaired(stream.title.as_deref())
}
