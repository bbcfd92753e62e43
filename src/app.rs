//! Application supervisor: owns the queues, worker pool, persistence
//! handles, and the collaborator clients.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db::QueueRepository;
use crate::error::AppError;
use crate::ignore::{is_path_ignored, MARKER_FILENAME};
use crate::mkv::MkvWorkflow;
use crate::notify::{JellyfinClient, Metrics};
use crate::queue::{PriorityQueue, TranslationTask};
use crate::shutdown::Shutdown;
use crate::sidecar;
use crate::translate::{AvailabilityGate, Translate};

struct WorkerState {
    active: usize,
    next_id: u64,
}

/// Central owner of the sidecar pipeline and dispatcher to the MKV
/// workflow. Workers borrow only the queue, the repository, the output-path
/// computation, and the availability latch.
pub struct Application {
    pub config: Config,
    pub translator: Arc<dyn Translate>,
    pub translator_available: AvailabilityGate,
    pub tasks: PriorityQueue<TranslationTask>,
    pub db: QueueRepository,
    pub metrics: Arc<Metrics>,
    pub jellyfin: Option<Arc<JellyfinClient>>,
    pub workflow: Option<Arc<MkvWorkflow>>,
    pub shutdown: Shutdown,
    worker_state: Mutex<WorkerState>,
    /// `(path, lang)` keys queued or in flight. The queue database is the
    /// primary dedup barrier; this set keeps the at-most-one-per-key
    /// guarantee intact while the database is erroring.
    pending_tasks: Mutex<HashSet<(PathBuf, String)>>,
}

impl Application {
    pub fn new(
        mut config: Config,
        translator: Arc<dyn Translate>,
        jellyfin: Option<Arc<JellyfinClient>>,
        workflow: Option<Arc<MkvWorkflow>>,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, AppError> {
        // MKV ingress exists exactly when a workflow does. Without this,
        // webhook paths could match a root that nothing will ever service.
        if workflow.is_none() && !config.mkv_dirs.is_empty() {
            warn!("MKV roots configured without a workflow; disabling MKV ingress");
            config.mkv_dirs.clear();
        }
        let db = QueueRepository::open(&config.queue_db)?;
        Ok(Arc::new(Self {
            config,
            translator,
            translator_available: AvailabilityGate::new(),
            tasks: PriorityQueue::new(),
            db,
            metrics,
            jellyfin,
            workflow,
            shutdown,
            worker_state: Mutex::new(WorkerState {
                active: 0,
                next_id: 0,
            }),
            pending_tasks: Mutex::new(HashSet::new()),
        }))
    }

    /// Claims the in-memory slot for `(path, lang)`. Returns false when the
    /// key is already queued or in flight.
    fn begin_task(&self, path: &Path, lang: &str) -> bool {
        self.pending_tasks
            .lock()
            .unwrap()
            .insert((path.to_path_buf(), lang.to_string()))
    }

    /// Releases the in-memory slot for `(path, lang)` once a worker is done
    /// with it (requeued tasks keep their slot).
    pub(crate) fn finish_task(&self, path: &Path, lang: &str) {
        self.pending_tasks
            .lock()
            .unwrap()
            .remove(&(path.to_path_buf(), lang.to_string()));
    }

    /// Output path for `src` in `lang`: the source suffix is replaced by
    /// `.<lang>.srt`. The suffix match is case-insensitive; the stem keeps
    /// its original case.
    pub fn output_path(&self, src: &Path, lang: &str) -> PathBuf {
        let name = src.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let ext = &self.config.src_ext;
        let stem = if name.len() >= ext.len()
            && name
                .to_ascii_lowercase()
                .ends_with(&ext.to_ascii_lowercase())
        {
            &name[..name.len() - ext.len()]
        } else {
            name.as_ref()
        };
        src.with_file_name(format!("{stem}.{lang}.srt"))
    }

    /// Whether any configured target language lacks a sidecar for `path`.
    pub fn needs_translation(&self, path: &Path) -> bool {
        self.config
            .target_langs
            .iter()
            .any(|lang| !self.output_path(path, lang).exists())
    }

    fn matches_source(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .map_or(false, |name| {
                name.ends_with(&self.config.src_ext.to_ascii_lowercase())
            })
    }

    /// Accepts a candidate source file into the sidecar queue.
    ///
    /// Each missing target language becomes one task. The persistent record
    /// is written first; only a fresh insert enqueues in memory, which keeps
    /// every `(path, lang)` key at most once in flight.
    pub fn enqueue(self: &Arc<Self>, path: &Path, priority: u8) {
        if !path.is_file() || !self.matches_source(path) {
            return;
        }
        if is_path_ignored(path, None) {
            debug!(path = %path.display(), marker = MARKER_FILENAME, "Ignoring marked path");
            return;
        }

        let mut queued_any = false;
        for lang in &self.config.target_langs {
            if self.output_path(path, lang).exists() {
                continue;
            }
            match self.db.add(path, lang, priority) {
                Ok(true) => {
                    if !self.begin_task(path, lang) {
                        debug!(path = %path.display(), lang = %lang, "Already in flight");
                        continue;
                    }
                    let task = TranslationTask::new(path.to_path_buf(), lang.clone(), priority);
                    info!(
                        path = %path.display(),
                        lang = %lang,
                        task_id = %task.task_id,
                        priority,
                        "Queued translation"
                    );
                    self.tasks.push(priority, task);
                    queued_any = true;
                }
                Ok(false) => {
                    debug!(path = %path.display(), lang = %lang, "Already queued");
                }
                Err(e) => {
                    // Degrade to memory-only queuing rather than dropping
                    // work; the in-flight set takes over key dedup here.
                    warn!(path = %path.display(), lang = %lang, error = %e, "Queue record failed");
                    if !self.begin_task(path, lang) {
                        debug!(path = %path.display(), lang = %lang, "Already in flight");
                        continue;
                    }
                    self.tasks
                        .push(priority, TranslationTask::new(path.to_path_buf(), lang.clone(), priority));
                    queued_any = true;
                }
            }
        }
        if queued_any {
            self.metrics.queue_depth.set(self.db.count() as f64);
            self.ensure_workers();
        }
    }

    /// Watcher delete event: the source is gone, forget its queue records.
    pub fn remove_source(&self, path: &Path) {
        if let Err(e) = self.db.remove_path(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove queue records");
        }
    }

    /// Watcher modify event: stale outputs must be regenerated.
    pub fn delete_outputs(&self, path: &Path) {
        for lang in &self.config.target_langs {
            let output = self.output_path(path, lang);
            if output.exists() {
                if let Err(e) = std::fs::remove_file(&output) {
                    warn!(path = %output.display(), error = %e, "Failed to delete stale output");
                } else {
                    debug!(path = %output.display(), "Deleted stale output");
                }
            }
        }
    }

    /// Replays persisted queue records into the in-memory queue at startup.
    pub fn load_pending(self: &Arc<Self>) {
        let records = match self.db.all() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted queue");
                return;
            }
        };
        let mut count = 0;
        for record in records {
            if !self.begin_task(&record.path, &record.lang) {
                continue;
            }
            let task = TranslationTask::new(record.path.clone(), record.lang.clone(), record.priority);
            info!(
                path = %record.path.display(),
                lang = %record.lang,
                task_id = %task.task_id,
                "Restored queued translation"
            );
            self.tasks.push(record.priority, task);
            count += 1;
        }
        if count > 0 {
            self.metrics.queue_depth.set(count as f64);
            self.ensure_workers();
        }
    }

    /// Full walk of the sidecar watch roots.
    pub fn full_scan(self: &Arc<Self>) {
        info!("Performing full sidecar scan");
        for root in &self.config.watch_dirs {
            debug!(path = %root.display(), "Scanning root");
            let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
                !(entry.file_type().is_dir() && entry.path().join(MARKER_FILENAME).exists())
            });
            for entry in walker.filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    self.enqueue(entry.path(), 1);
                }
            }
        }
    }

    /// Webhook ingress: dedupe, filter to known MKV roots, hand to the
    /// workflow. Returns accepted paths and per-path skip reasons.
    pub fn enqueue_webhook_paths(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
        priority: u8,
    ) -> (Vec<PathBuf>, Vec<(PathBuf, &'static str)>) {
        let mut accepted = Vec::new();
        let mut skipped = Vec::new();
        for path in paths {
            if !path.is_file() {
                skipped.push((path, "not_found"));
                continue;
            }
            if path.extension().map_or(true, |ext| ext != "mkv") {
                skipped.push((path, "not_mkv"));
                continue;
            }
            // A matched root implies a workflow: `new()` clears `mkv_dirs`
            // when no MKV workflow was constructed.
            let matched = self.workflow.as_ref().and_then(|workflow| {
                self.config
                    .mkv_dirs
                    .iter()
                    .find(|root| path.starts_with(root))
                    .map(|root| (workflow, root))
            });
            let Some((workflow, root)) = matched else {
                skipped.push((path, "outside_roots"));
                continue;
            };
            if is_path_ignored(&path, Some(root)) {
                skipped.push((path, "ignored"));
                continue;
            }
            workflow.enqueue_translation(&path, priority);
            accepted.push(path);
        }
        (accepted, skipped)
    }

    /// Spins up a sidecar worker when the pool has spare capacity.
    pub fn ensure_workers(self: &Arc<Self>) {
        if self.shutdown.triggered() {
            return;
        }
        let name = {
            let mut state = self.worker_state.lock().unwrap();
            if state.active >= self.config.workers || self.tasks.is_empty() {
                return;
            }
            state.active += 1;
            state.next_id += 1;
            format!("srt-worker-{}", state.next_id)
        };
        self.metrics.active_workers.set(self.active_workers() as f64);
        let app = self.clone();
        info!(worker = %name, "Starting sidecar worker");
        tokio::spawn(async move {
            sidecar::worker::run(app, name).await;
        });
    }

    pub(crate) fn worker_exited(&self, name: &str) {
        let active = {
            let mut state = self.worker_state.lock().unwrap();
            state.active = state.active.saturating_sub(1);
            state.active
        };
        self.metrics.active_workers.set(active as f64);
        info!(worker = %name, active, "Worker exited");
    }

    pub fn active_workers(&self) -> usize {
        self.worker_state.lock().unwrap().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TranslateError;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::fs;

    struct NullTranslator;

    #[async_trait]
    impl Translate for NullTranslator {
        async fn translate(
            &self,
            _path: &Path,
            _source: &str,
            _target: &str,
        ) -> Result<Vec<u8>, TranslateError> {
            Ok(Vec::new())
        }

        async fn detect_language(
            &self,
            _sample: &[u8],
            _min_confidence: f64,
        ) -> Result<Option<crate::translate::Detection>, TranslateError> {
            Ok(None)
        }

        async fn fetch_languages(
            &self,
        ) -> Result<HashMap<String, HashSet<String>>, TranslateError> {
            Ok(HashMap::new())
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn wait_until_available(&self, _shutdown: &Shutdown) -> bool {
            true
        }

        fn supports_translation(&self, _source: &str, _target: &str) -> bool {
            true
        }

        fn is_target_supported(&self, _target: &str) -> bool {
            true
        }
    }

    fn app(dir: &tempfile::TempDir, langs: &str) -> Arc<Application> {
        let queue_db = dir.path().join("queue.db");
        let watch = dir.path().to_string_lossy().to_string();
        let db_path = queue_db.to_string_lossy().to_string();
        let config = Config::from_lookup(|key| match key {
            "WATCH_DIRS" => Some(watch.clone()),
            "TARGET_LANGS" => Some(langs.to_string()),
            "QUEUE_DB" => Some(db_path.clone()),
            _ => None,
        })
        .unwrap();
        let (signal, shutdown) = crate::shutdown::channel();
        // Keep ensure_workers inert so tests can inspect the queue.
        signal.trigger();
        Application::new(
            config,
            Arc::new(NullTranslator),
            None,
            None,
            Arc::new(Metrics::new().unwrap()),
            shutdown,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn output_path_preserves_stem_case() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl");
        assert_eq!(
            app.output_path(Path::new("/r/Movie.EN.SRT"), "nl"),
            PathBuf::from("/r/Movie.nl.srt")
        );
        assert_eq!(
            app.output_path(Path::new("/r/a.en.srt"), "nl"),
            PathBuf::from("/r/a.nl.srt")
        );
    }

    #[tokio::test]
    async fn enqueue_requires_existing_matching_source() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl");

        app.enqueue(&dir.path().join("absent.en.srt"), 1);
        assert!(app.tasks.is_empty());

        let other = dir.path().join("notes.txt");
        fs::write(&other, "x").unwrap();
        app.enqueue(&other, 1);
        assert!(app.tasks.is_empty());
    }

    #[tokio::test]
    async fn enqueue_skips_fully_translated_sources() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl");
        let src = dir.path().join("b.en.srt");
        fs::write(&src, "x").unwrap();
        fs::write(dir.path().join("b.nl.srt"), "done").unwrap();

        app.enqueue(&src, 1);
        assert!(app.tasks.is_empty());
        assert_eq!(app.db.count(), 0);
    }

    #[tokio::test]
    async fn enqueue_creates_one_task_per_missing_language() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl,es");
        let src = dir.path().join("a.en.srt");
        fs::write(&src, "x").unwrap();
        fs::write(dir.path().join("a.es.srt"), "done").unwrap();

        app.enqueue(&src, 1);
        assert_eq!(app.tasks.len(), 1);
        assert_eq!(app.db.count(), 1);

        // Second enqueue is a no-op: the record already exists.
        app.enqueue(&src, 1);
        assert_eq!(app.tasks.len(), 1);
        assert_eq!(app.db.count(), 1);
    }

    #[tokio::test]
    async fn load_pending_restores_tasks_without_readding() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl");
        let src = dir.path().join("v.en.srt");
        fs::write(&src, "x").unwrap();
        app.db.add(&src, "nl", 0).unwrap();

        app.load_pending();
        assert_eq!(app.tasks.len(), 1);
        let task = app.tasks.try_pop().unwrap();
        assert_eq!(task.lang, "nl");
        assert_eq!(task.priority, 0);
    }

    #[tokio::test]
    async fn one_in_memory_task_per_key_even_when_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl");
        let src = dir.path().join("v.en.srt");
        fs::write(&src, "x").unwrap();
        app.db.add(&src, "nl", 1).unwrap();

        // A second replay or a watcher event for the same key must not
        // stack another task while one is queued or in flight.
        app.load_pending();
        app.load_pending();
        app.enqueue(&src, 1);
        assert_eq!(app.tasks.len(), 1);

        // Once the worker releases the key, the next event queues again.
        app.finish_task(&src, "nl");
        app.db.remove(&src, "nl").unwrap();
        app.enqueue(&src, 1);
        assert_eq!(app.tasks.len(), 2);
    }

    #[tokio::test]
    async fn ignored_sources_are_never_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl");
        fs::write(dir.path().join(MARKER_FILENAME), "").unwrap();
        let src = dir.path().join("a.en.srt");
        fs::write(&src, "x").unwrap();

        app.enqueue(&src, 1);
        assert!(app.tasks.is_empty());
    }

    #[tokio::test]
    async fn webhook_paths_are_filtered_with_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, "nl");
        let srt = dir.path().join("x.en.srt");
        fs::write(&srt, "x").unwrap();
        let mkv = dir.path().join("m.mkv");
        fs::write(&mkv, "v").unwrap();

        let (accepted, skipped) = app.enqueue_webhook_paths(
            vec![dir.path().join("missing.mkv"), srt.clone(), mkv.clone()],
            0,
        );
        assert!(accepted.is_empty());
        let reasons: Vec<&str> = skipped.iter().map(|(_, r)| *r).collect();
        // No MKV roots are configured in this fixture.
        assert_eq!(reasons, vec!["not_found", "not_mkv", "outside_roots"]);
    }
}
