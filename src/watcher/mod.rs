//! Recursive filesystem watchers for the sidecar pipeline.

pub mod debounce;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::error::WatcherError;

/// Runs one recursive watcher per configured root until shutdown.
///
/// Events are bridged from notify's callback thread into the tokio loop;
/// debouncing happens in spawned tasks so slow files never stall the event
/// stream.
pub async fn run(app: Arc<Application>) -> Result<(), WatcherError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Event)>();
    let mut watchers = Vec::new();
    let mut handlers: HashMap<usize, Arc<RootHandler>> = HashMap::new();

    for (idx, root) in app.config.watch_dirs.iter().enumerate() {
        if !root.exists() {
            warn!(path = %root.display(), "Watch root does not exist; skipping");
            continue;
        }
        let tx = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send((idx, event));
                }
            },
            NotifyConfig::default(),
        )?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchFailed {
                path: root.clone(),
                message: e.to_string(),
            })?;
        watchers.push(watcher);
        handlers.insert(idx, Arc::new(RootHandler::new(app.clone())));
        info!(path = %root.display(), "Watching root");
    }
    drop(tx);

    loop {
        tokio::select! {
            _ = app.shutdown.wait() => break,
            event = rx.recv() => {
                let Some((idx, event)) = event else { break };
                if let Some(handler) = handlers.get(&idx) {
                    handler.clone().handle_event(event);
                }
            }
        }
    }

    drop(watchers);
    info!("Watcher stopped");
    Ok(())
}

/// Event handler with per-root debounce state.
struct RootHandler {
    app: Arc<Application>,
    pattern: glob::Pattern,
    debounce: Duration,
    recent: Mutex<RecentMap>,
}

struct RecentMap {
    entries: HashMap<PathBuf, Instant>,
    last_prune: Instant,
}

impl RootHandler {
    fn new(app: Arc<Application>) -> Self {
        let pattern = glob::Pattern::new(&format!("*{}", app.config.src_ext.to_lowercase()))
            .unwrap_or_else(|_| glob::Pattern::new("*").unwrap());
        let debounce = app.config.debounce;
        Self {
            app,
            pattern,
            debounce,
            recent: Mutex::new(RecentMap {
                entries: HashMap::new(),
                last_prune: Instant::now(),
            }),
        }
    }

    fn matches(&self, path: &PathBuf) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .map_or(false, |name| self.pattern.matches(&name))
    }

    fn handle_event(self: Arc<Self>, event: Event) {
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    self.clone().created(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in event.paths {
                    self.clone().created(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.into_iter();
                if let Some(from) = paths.next() {
                    self.deleted(&from);
                }
                if let Some(to) = paths.next() {
                    self.clone().created(to);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in event.paths {
                    self.deleted(&path);
                }
            }
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.clone().modified(path);
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.deleted(&path);
                }
            }
            _ => {}
        }
    }

    fn created(self: Arc<Self>, path: PathBuf) {
        if !self.matches(&path) {
            return;
        }
        debug!(path = %path.display(), "Detected new file");
        tokio::spawn(async move {
            self.debounce_and_enqueue(path).await;
        });
    }

    fn modified(self: Arc<Self>, path: PathBuf) {
        if !self.matches(&path) {
            return;
        }
        debug!(path = %path.display(), "Detected modified file");
        // The old outputs are stale now.
        self.app.delete_outputs(&path);
        tokio::spawn(async move {
            self.debounce_and_enqueue(path).await;
        });
    }

    fn deleted(&self, path: &PathBuf) {
        if !self.matches(path) {
            return;
        }
        debug!(path = %path.display(), "Detected deleted file");
        // Forget the queue records; produced outputs stay on disk.
        self.app.remove_source(path);
    }

    /// Suppresses duplicate events within one debounce interval, waits for
    /// the file to stabilize, then enqueues it at high priority.
    async fn debounce_and_enqueue(self: Arc<Self>, path: PathBuf) {
        {
            let now = Instant::now();
            let mut recent = self.recent.lock().unwrap();
            if now.duration_since(recent.last_prune) > self.debounce {
                let debounce = self.debounce;
                recent.entries.retain(|_, ts| now.duration_since(*ts) <= debounce);
                recent.last_prune = now;
            }
            if let Some(last) = recent.entries.get(&path) {
                if now.duration_since(*last) < self.debounce {
                    debug!(path = %path.display(), "Suppressing duplicate event");
                    return;
                }
            }
        }

        if debounce::wait_for_stable(&path, self.debounce).await {
            self.recent
                .lock()
                .unwrap()
                .entries
                .insert(path.clone(), Instant::now());
            self.app.enqueue(&path, 0);
        }
    }
}
