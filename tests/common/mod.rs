//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use babelarr::app::Application;
use babelarr::config::Config;
use babelarr::error::TranslateError;
use babelarr::notify::Metrics;
use babelarr::shutdown::{self, Shutdown, ShutdownSignal};
use babelarr::translate::{Detection, Translate};
use tempfile::TempDir;

/// Scripted translator double. Each `translate` call pops the next scripted
/// result; when the script is empty the default payload is returned.
pub struct FakeTranslator {
    script: Mutex<VecDeque<Result<Vec<u8>, TranslateError>>>,
    default_payload: Vec<u8>,
    calls: AtomicUsize,
}

impl FakeTranslator {
    pub fn returning(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default_payload: payload.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn with_script(
        script: Vec<Result<Vec<u8>, TranslateError>>,
        default_payload: &[u8],
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default_payload: default_payload.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translate for FakeTranslator {
    async fn translate(
        &self,
        _path: &Path,
        _source: &str,
        _target: &str,
    ) -> Result<Vec<u8>, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.default_payload.clone()),
        }
    }

    async fn detect_language(
        &self,
        _sample: &[u8],
        _min_confidence: f64,
    ) -> Result<Option<Detection>, TranslateError> {
        Ok(None)
    }

    async fn fetch_languages(&self) -> Result<HashMap<String, HashSet<String>>, TranslateError> {
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

pub struct TestApp {
    pub app: Arc<Application>,
    pub translator: Arc<FakeTranslator>,
    pub signal: ShutdownSignal,
    pub root: TempDir,
}

/// Builds an application over a fresh temp root with the fake translator.
pub fn build_app(target_langs: &str, translator: Arc<FakeTranslator>) -> TestApp {
    let root = TempDir::new().unwrap();
    let app = build_app_at(&root, target_langs, translator.clone());
    TestApp {
        app: app.0,
        translator,
        signal: app.1,
        root,
    }
}

/// Builds an application sharing an existing root (for restart scenarios).
pub fn build_app_at(
    root: &TempDir,
    target_langs: &str,
    translator: Arc<FakeTranslator>,
) -> (Arc<Application>, ShutdownSignal) {
    let watch = root.path().to_string_lossy().to_string();
    let queue_db = root.path().join("state/queue.db").to_string_lossy().to_string();
    let langs = target_langs.to_string();
    let config = Config::from_lookup(move |key| match key {
        "WATCH_DIRS" => Some(watch.clone()),
        "TARGET_LANGS" => Some(langs.clone()),
        "QUEUE_DB" => Some(queue_db.clone()),
        "IDLE_TIMEOUT_SECONDS" => Some("60".to_string()),
        _ => None,
    })
    .unwrap();

    let (signal, shutdown) = shutdown::channel();
    let app = Application::new(
        config,
        translator,
        None,
        None,
        Arc::new(Metrics::new().unwrap()),
        shutdown,
    )
    .unwrap();
    (app, signal)
}

/// Polls `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Signals shutdown and waits for the worker pool to drain.
pub async fn stop(app: &Arc<Application>, signal: &ShutdownSignal) {
    signal.trigger();
    assert!(
        wait_until(|| app.active_workers() == 0, Duration::from_secs(5)).await,
        "workers did not exit"
    );
}
