//! Babelarr - keeps translated subtitle sidecars in sync with a media
//! library.
//!
//! Two pipelines share a translator and persistence layer: a sidecar
//! pipeline that watches for `*.en.srt`-style sources, and an MKV pipeline
//! that reconciles embedded subtitle streams against the configured target
//! languages.

pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod ignore;
pub mod mkv;
pub mod notify;
pub mod queue;
pub mod shutdown;
pub mod sidecar;
pub mod srt;
pub mod translate;
pub mod watcher;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::app::Application;
use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::db::{ProbeCache, QueueRepository, WorkIndex};
use crate::error::ConfigError;
use crate::mkv::{MkvExtractor, MkvScanner, MkvSubtitleTagger, MkvWorkflow};
use crate::notify::{JellyfinClient, Metrics, MetricsServer};
use crate::sidecar::SidecarCleaner;
use crate::translate::{LibreTranslateClient, Translate};
use crate::webhook::WebhookServer;

/// Runs the selected command.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level(), cli.verbose > 0)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_pipeline().await,
        Commands::ConfigShow => show_config(),
        Commands::QueueList => list_queue(),
        Commands::QueueClear => clear_queue(),
    }
}

/// Initializes the tracing subscriber for structured logging.
///
/// `LOG_LEVEL` seeds the filter unless `-v` flags were given; `LOG_FILE`
/// redirects output to an append-mode file.
fn setup_logging(cli_level: &str, cli_override: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli_override {
        cli_level.to_string()
    } else {
        std::env::var("LOG_LEVEL")
            .map(|l| l.to_lowercase())
            .unwrap_or_else(|_| cli_level.to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true);

    match std::env::var("LOG_FILE") {
        Ok(path) if !path.is_empty() => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            builder.with_writer(Arc::new(file)).init();
        }
        _ => builder.init(),
    }
    Ok(())
}

/// Runs the daemon until a shutdown signal arrives.
async fn run_pipeline() -> Result<()> {
    info!("Starting babelarr");

    let mut config = Config::from_env()?;
    config.validate_roots()?;

    let translator = Arc::new(LibreTranslateClient::new(&config)?);

    // Language support is queried once; unsupported targets are dropped.
    let discovered = translator.load_languages().await;
    if discovered > 0 {
        config.target_langs.retain(|lang| {
            let supported = translator.is_target_supported(lang);
            if !supported {
                warn!(lang = %lang, "Translator does not support target language; dropping");
            }
            supported
        });
        if config.target_langs.is_empty() {
            return Err(ConfigError::NoTargetLanguages.into());
        }
    }
    info!(
        targets = ?config.target_langs,
        workers = config.workers,
        "Configuration loaded and validated"
    );

    let (signal, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal.trigger();
    });

    let metrics = Arc::new(Metrics::new()?);
    if config.metrics_port > 0 {
        let server = MetricsServer::new(metrics.clone(), config.metrics_port);
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(server_shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let jellyfin = config.jellyfin.as_ref().map(|c| Arc::new(JellyfinClient::new(c)));

    let translator_dyn: Arc<dyn Translate> = translator.clone();
    let workflow = if config.mkv_dirs.is_empty() {
        None
    } else {
        let extractor = Arc::new(MkvExtractor::new());
        let work_index = Arc::new(WorkIndex::open(&config.mkv_work_db));
        let probe_cache = Arc::new(ProbeCache::open(
            extractor.clone(),
            Some(&config.probe_cache_db),
            config.probe_cache_entries,
        ));
        let tagger = Arc::new(MkvSubtitleTagger::new(
            extractor,
            translator_dyn.clone(),
            config.min_detection_confidence,
        ));
        let scanner = Arc::new(MkvScanner::new(
            config.mkv_dirs.clone(),
            tagger,
            translator_dyn.clone(),
            &config.target_langs,
            config.preferred_source_lang.as_deref(),
            probe_cache,
            jellyfin.clone(),
        ));
        Some(MkvWorkflow::new(
            scanner,
            config.workers,
            shutdown.clone(),
            work_index,
            metrics.clone(),
        ))
    };

    let app = Application::new(
        config,
        translator_dyn,
        jellyfin,
        workflow,
        metrics,
        shutdown.clone(),
    )?;

    // MKV workflow: workers first, then persisted work, then a full scan.
    let mut workflow_handles = Vec::new();
    if let Some(workflow) = &app.workflow {
        workflow_handles = workflow.start();
        workflow.recover();
        workflow.request_scan();
        info!("MKV workflow started");
    }

    // Sidecar pipeline: persisted queue, then a full walk of the roots.
    app.load_pending();
    app.full_scan();

    // One-shot cleanup of sidecars whose video is gone.
    if !app.config.mkv_dirs.is_empty() {
        let cleaner = SidecarCleaner::new(app.config.mkv_dirs.clone());
        tokio::task::spawn_blocking(move || cleaner.remove_orphans());
    }

    let watcher_handle = {
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher::run(app).await {
                error!(error = %e, "Watcher failed");
            }
        })
    };

    if let Some(webhook_config) = app.config.webhook.clone() {
        match WebhookServer::bind(app.clone(), &webhook_config).await {
            Ok(server) => {
                let server_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    server.run(server_shutdown).await;
                });
            }
            Err(e) => {
                warn!(
                    host = %webhook_config.host,
                    port = webhook_config.port,
                    error = %e,
                    "Webhook listen failed"
                );
            }
        }
    }

    // Periodic full scans for both pipelines.
    {
        let app = app.clone();
        let scan_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if scan_shutdown.sleep(app.config.scan_interval).await {
                    break;
                }
                app.full_scan();
                if let Some(workflow) = &app.workflow {
                    workflow.request_scan();
                }
            }
        });
    }

    info!("Service started");
    shutdown.wait().await;

    info!("Shutdown initiated");
    while app.active_workers() > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for handle in workflow_handles {
        let _ = handle.await;
    }
    let _ = watcher_handle.await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Prints the resolved configuration.
fn show_config() -> Result<()> {
    let config = Config::from_env()?;
    println!("{config:#?}");
    Ok(())
}

/// Lists all persisted sidecar queue records.
fn list_queue() -> Result<()> {
    let config = Config::from_env()?;
    let repo = QueueRepository::open(&config.queue_db)?;
    let records = repo.all()?;
    if records.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    println!("Queue ({} records):", records.len());
    for record in records {
        println!(
            "  [{}] {} -> {}",
            record.priority,
            record.path.display(),
            record.lang
        );
    }
    Ok(())
}

/// Clears the persisted sidecar queue.
fn clear_queue() -> Result<()> {
    let config = Config::from_env()?;
    let repo = QueueRepository::open(&config.queue_db)?;
    let removed = repo.clear()?;
    println!("Cleared {removed} record(s) from queue.");
    Ok(())
}
