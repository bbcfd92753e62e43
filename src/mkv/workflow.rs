//! Priority-ordered MKV work queue and its worker pool.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::file_signature;
use super::scanner::MkvScanner;
use crate::db::WorkIndex;
use crate::notify::Metrics;
use crate::queue::PriorityQueue;
use crate::shutdown::Shutdown;

struct PendingState {
    /// Paths queued or in flight; the dedup barrier for `enqueue_translation`.
    paths: HashSet<String>,
    /// Re-enqueue requests that arrived while a path was in flight.
    rescan_priorities: HashMap<String, u8>,
    /// Enqueue instants for priority-0 items, for latency accounting.
    priority_enqueued: HashMap<String, Instant>,
}

/// Owns the MKV queue, the scan trigger, and the worker pool.
pub struct MkvWorkflow {
    scanner: Arc<MkvScanner>,
    worker_count: usize,
    shutdown: Shutdown,
    queue: PriorityQueue<PathBuf>,
    pending: Mutex<PendingState>,
    scan_trigger: Notify,
    work_index: Arc<WorkIndex>,
    metrics: Arc<Metrics>,
}

impl MkvWorkflow {
    pub fn new(
        scanner: Arc<MkvScanner>,
        worker_count: usize,
        shutdown: Shutdown,
        work_index: Arc<WorkIndex>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scanner,
            worker_count: worker_count.max(1),
            shutdown,
            queue: PriorityQueue::new(),
            pending: Mutex::new(PendingState {
                paths: HashSet::new(),
                rescan_priorities: HashMap::new(),
                priority_enqueued: HashMap::new(),
            }),
            scan_trigger: Notify::new(),
            work_index,
            metrics,
        })
    }

    /// Spawns the scan loop and worker tasks, returning their handles.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.worker_count + 1);
        handles.push(tokio::spawn(self.clone().scan_loop()));
        for idx in 0..self.worker_count {
            handles.push(tokio::spawn(self.clone().worker_loop(idx + 1)));
        }
        handles
    }

    /// Requests a full scan on the next loop iteration.
    pub fn request_scan(&self) {
        self.scan_trigger.notify_one();
    }

    /// Replays persisted work records into the queue.
    pub fn recover(self: &Arc<Self>) {
        let recovered = self.work_index.recover_pending();
        let count = recovered.len();
        for (path, priority) in recovered {
            self.enqueue_translation(&path, priority);
        }
        if count > 0 {
            info!(count, "Restored persisted MKV work");
        }
    }

    /// Webhook convenience: new videos arrive at high priority.
    pub fn handle_new_mkv(self: &Arc<Self>, path: &Path) {
        self.enqueue_translation(path, 0);
    }

    /// Funnel for every ingress path. Deduplicates against in-flight work;
    /// a re-enqueue of an in-flight path is remembered and re-fired when the
    /// current pass completes.
    pub fn enqueue_translation(self: &Arc<Self>, path: &Path, priority: u8) {
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "mkv") {
            return;
        }
        let priority = priority.min(1);
        let key = path.to_string_lossy().to_string();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.paths.contains(&key) {
                let entry = pending.rescan_priorities.entry(key.clone()).or_insert(priority);
                *entry = (*entry).min(priority);
                debug!(path = %path.display(), priority, "Enqueue deferred; path in flight");
                return;
            }
            pending.paths.insert(key.clone());
            pending.rescan_priorities.remove(&key);
            if priority == 0 {
                pending.priority_enqueued.insert(key, Instant::now());
            }
        }

        if let Ok((mtime_ns, size_bytes)) = file_signature(path) {
            self.work_index.record_pending(path, mtime_ns, size_bytes, priority);
        }

        self.queue.push(priority, path.to_path_buf());
        self.metrics.mkv_queue_depth.set(self.queue.len() as f64);
        debug!(path = %path.display(), priority, "Queued video");
    }

    async fn scan_loop(self: Arc<Self>) {
        debug!("MKV scan loop started");
        loop {
            let triggered = tokio::select! {
                _ = self.scan_trigger.notified() => true,
                _ = tokio::time::sleep(Duration::from_secs(1)) => false,
            };
            if self.shutdown.triggered() {
                break;
            }
            if !triggered {
                continue;
            }

            let (files, tasks, seen) = self.scanner.scan().await;
            let queued = tasks.len();
            for (path, priority) in tasks {
                self.enqueue_translation(&path, priority);
            }
            self.work_index.prune_missing(&seen);
            info!(files, queued, "MKV scan complete");
        }
        debug!("MKV scan loop exited");
    }

    async fn worker_loop(self: Arc<Self>, index: usize) {
        debug!(worker = index, "MKV worker started");
        loop {
            if self.shutdown.triggered() && self.queue.is_empty() {
                break;
            }
            let Some(path) = self.queue.pop_timeout(Duration::from_millis(100)).await else {
                continue;
            };
            self.metrics.mkv_queue_depth.set(self.queue.len() as f64);

            if !path.is_file() {
                self.work_index
                    .mark_finished(&path, None, None, false, true);
                self.complete_pending(&path);
                continue;
            }

            self.record_priority_wait(&path);
            self.work_index.mark_in_progress(&path);

            let outcome = self.scanner.process_file(&path).await;

            let signature = file_signature(&path).ok();
            self.work_index.mark_finished(
                &path,
                signature.map(|(mtime, _)| mtime),
                signature.map(|(_, size)| size),
                outcome.requeue,
                outcome.missing,
            );
            if outcome.requeue {
                error!(path = %path.display(), "Transient failure; video stays pending");
            }
            self.complete_pending(&path);
        }
        debug!(worker = index, "MKV worker exited");
    }

    fn record_priority_wait(&self, path: &Path) {
        let key = path.to_string_lossy().to_string();
        let enqueued = {
            let mut pending = self.pending.lock().unwrap();
            pending.priority_enqueued.remove(&key)
        };
        if let Some(enqueued) = enqueued {
            self.metrics
                .priority_wait_seconds
                .observe(enqueued.elapsed().as_secs_f64());
        }
    }

    /// Clears the in-flight marker and re-fires a deferred rescan, if any.
    fn complete_pending(self: &Arc<Self>, path: &Path) {
        let key = path.to_string_lossy().to_string();
        let rescan = {
            let mut pending = self.pending.lock().unwrap();
            pending.paths.remove(&key);
            pending.priority_enqueued.remove(&key);
            pending.rescan_priorities.remove(&key)
        };
        if let Some(priority) = rescan {
            debug!(path = %path.display(), priority, "Re-running deferred enqueue");
            self.enqueue_translation(path, priority);
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_contains(&self, path: &Path) -> bool {
        self.pending
            .lock()
            .unwrap()
            .paths
            .contains(&path.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ProbeCache, WorkIndex};
    use crate::error::TranslateError;
    use crate::mkv::extract::MkvExtractor;
    use crate::mkv::tagger::MkvSubtitleTagger;
    use crate::translate::Translate;
    use async_trait::async_trait;
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

    fn workflow(dir: &tempfile::TempDir) -> (Arc<MkvWorkflow>, crate::shutdown::ShutdownSignal) {
        let translator: Arc<dyn Translate> = Arc::new(NullTranslator);
        let extractor = Arc::new(MkvExtractor::new());
        let tagger = Arc::new(MkvSubtitleTagger::new(
            extractor.clone(),
            translator.clone(),
            0.85,
        ));
        let probe_cache = Arc::new(ProbeCache::open(extractor, None, 16));
        let scanner = Arc::new(MkvScanner::new(
            vec![dir.path().to_path_buf()],
            tagger,
            translator,
            &["es".to_string()],
            None,
            probe_cache,
            None,
        ));
        let (signal, shutdown) = crate::shutdown::channel();
        let work_index = Arc::new(WorkIndex::open(&dir.path().join("work.db")));
        let metrics = Arc::new(Metrics::new().unwrap());
        (
            MkvWorkflow::new(scanner, 1, shutdown, work_index, metrics),
            signal,
        )
    }

    #[tokio::test]
    async fn enqueue_deduplicates_in_flight_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (workflow, _signal) = workflow(&dir);
        let video = dir.path().join("movie.mkv");
        fs::write(&video, "v").unwrap();

        workflow.enqueue_translation(&video, 1);
        workflow.enqueue_translation(&video, 1);
        assert_eq!(workflow.queue_len(), 1);
        assert!(workflow.pending_contains(&video));
    }

    #[tokio::test]
    async fn rescan_request_coalesces_and_refires() {
        let dir = tempfile::tempdir().unwrap();
        let (workflow, _signal) = workflow(&dir);
        let video = dir.path().join("movie.mkv");
        fs::write(&video, "v").unwrap();

        workflow.enqueue_translation(&video, 1);
        // Simulate a worker holding the item while a rescan arrives.
        let held = workflow.queue.try_pop().unwrap();
        workflow.enqueue_translation(&video, 0);
        assert_eq!(workflow.queue_len(), 0);

        workflow.complete_pending(&held);
        // Deferred request re-fires at the coalesced priority.
        assert_eq!(workflow.queue_len(), 1);
        assert!(workflow.pending_contains(&video));
    }

    #[tokio::test]
    async fn non_mkv_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (workflow, _signal) = workflow(&dir);
        let srt = dir.path().join("movie.en.srt");
        fs::write(&srt, "s").unwrap();

        workflow.enqueue_translation(&srt, 0);
        workflow.enqueue_translation(&dir.path().join("absent.mkv"), 0);
        assert_eq!(workflow.queue_len(), 0);
    }
}
