//! Sidecar translation worker.
//!
//! Each worker drains the shared priority queue one task at a time. A
//! transient translator failure parks every worker on the availability
//! latch and requeues the task at its original priority; other failures
//! drop the task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::app::Application;
use crate::error::TranslateError;
use crate::queue::TranslationTask;
use crate::srt;
use crate::translate::Translate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Succeeded,
    Skipped,
}

/// Runs one worker until shutdown (draining the queue) or idle timeout.
pub async fn run(app: Arc<Application>, name: String) {
    debug!(worker = %name, "Worker started");

    // Do not pick up work while the translator is unreachable.
    if app.translator.wait_until_available(&app.shutdown).await {
        app.translator_available.set();
    }

    let idle_timeout = app.config.idle_timeout;
    let mut last_activity = Instant::now();

    loop {
        if app.shutdown.triggered() && app.tasks.is_empty() {
            break;
        }
        if !app
            .translator_available
            .wait_timeout(Duration::from_secs(1))
            .await
        {
            if idle_expired(&app, last_activity, idle_timeout) {
                break;
            }
            continue;
        }
        let Some(task) = app.tasks.pop_timeout(Duration::from_millis(100)).await else {
            if idle_expired(&app, last_activity, idle_timeout) {
                break;
            }
            continue;
        };

        debug!(
            worker = %name,
            path = %task.path.display(),
            lang = %task.lang,
            task_id = %task.task_id,
            "Worker picked up task"
        );
        let start = Instant::now();
        let mut requeue = false;
        let mut interrupted = false;
        let outcome = match process_task(&app, &task).await {
            Ok(TaskOutcome::Succeeded) => "succeeded",
            Ok(TaskOutcome::Skipped) => "skipped",
            Err(e) => {
                error!(
                    worker = %name,
                    path = %task.path.display(),
                    lang = %task.lang,
                    task_id = %task.task_id,
                    error = %e,
                    "Translation failed"
                );
                if e.is_transient() {
                    // Park the whole pool until the service answers again,
                    // then retry this task at its original priority.
                    app.translator_available.clear();
                    interrupted = !app.translator.wait_until_available(&app.shutdown).await;
                    app.translator_available.set();
                    requeue = true;
                }
                "failed"
            }
        };
        let elapsed = start.elapsed();
        last_activity = Instant::now();

        if requeue {
            app.tasks.push(task.priority, task.clone());
            app.metrics.record_outcome("requeued", elapsed.as_secs_f64());
            info!(
                worker = %name,
                path = %task.path.display(),
                lang = %task.lang,
                task_id = %task.task_id,
                queue = app.db.count(),
                "Task requeued"
            );
            // Shutdown arrived while the translator was down; the task is
            // safely requeued (and still persisted), so stop instead of
            // spinning on a dead service.
            if interrupted {
                break;
            }
        } else {
            app.finish_task(&task.path, &task.lang);
            if let Err(e) = app.db.remove(&task.path, &task.lang) {
                warn!(path = %task.path.display(), lang = %task.lang, error = %e, "Failed to remove queue record");
            }
            let queue_depth = app.db.count();
            app.metrics.queue_depth.set(queue_depth as f64);
            app.metrics.record_outcome(outcome, elapsed.as_secs_f64());
            info!(
                worker = %name,
                path = %task.path.display(),
                lang = %task.lang,
                task_id = %task.task_id,
                outcome,
                duration = elapsed.as_secs_f64(),
                queue = queue_depth,
                "Translation finished"
            );
            if outcome == "succeeded" {
                if let Some(jellyfin) = &app.jellyfin {
                    jellyfin
                        .refresh_best_effort(&app.output_path(&task.path, &task.lang))
                        .await;
                }
            }
        }
    }

    app.worker_exited(&name);
}

fn idle_expired(app: &Application, last_activity: Instant, idle_timeout: Duration) -> bool {
    !app.shutdown.triggered() && last_activity.elapsed() > idle_timeout
}

async fn process_task(
    app: &Application,
    task: &TranslationTask,
) -> Result<TaskOutcome, TranslateError> {
    if !task.path.exists() {
        warn!(
            path = %task.path.display(),
            lang = %task.lang,
            task_id = %task.task_id,
            "Source missing; dropping task"
        );
        return Ok(TaskOutcome::Skipped);
    }

    let output = app.output_path(&task.path, &task.lang);
    if output.exists() {
        debug!(output = %output.display(), "Translation already exists");
        return Ok(TaskOutcome::Skipped);
    }

    let source_lang = app.config.source_lang();
    let translated = app
        .translator
        .translate(&task.path, &source_lang, &task.lang)
        .await?;

    // The source may vanish while the request is in flight; never write an
    // output for a file that is gone.
    if !task.path.exists() {
        warn!(
            path = %task.path.display(),
            lang = %task.lang,
            task_id = %task.task_id,
            "Source disappeared during translation; skipping"
        );
        return Ok(TaskOutcome::Skipped);
    }

    let sanitized = srt::sanitize(&translated);
    srt::write_atomic(&output, &sanitized).await?;
    info!(
        path = %task.path.display(),
        lang = %task.lang,
        task_id = %task.task_id,
        output = %output.display(),
        "Saved translation"
    );
    Ok(TaskOutcome::Succeeded)
}
