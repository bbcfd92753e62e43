//! Webhook endpoint tests against a bound server and a real work index.

mod common;

use std::fs;
use std::sync::Arc;

use babelarr::app::Application;
use babelarr::config::{Config, WebhookConfig};
use babelarr::db::{ProbeCache, WorkIndex};
use babelarr::mkv::{MkvExtractor, MkvScanner, MkvSubtitleTagger, MkvWorkflow};
use babelarr::notify::Metrics;
use babelarr::shutdown::{self, ShutdownSignal};
use babelarr::translate::Translate;
use babelarr::webhook::WebhookServer;
use common::FakeTranslator;
use serde_json::{json, Value};
use tempfile::TempDir;

struct WebhookFixture {
    url: String,
    work_index: Arc<WorkIndex>,
    _signal: ShutdownSignal,
    root: TempDir,
}

/// Boots an application with an MKV root and a bound webhook server. The
/// workflow workers are not started, so queued work stays observable.
async fn boot(token: Option<&str>) -> WebhookFixture {
    let root = TempDir::new().unwrap();
    let mkv_dir = root.path().join("library");
    fs::create_dir_all(&mkv_dir).unwrap();

    let watch = root.path().to_string_lossy().to_string();
    let library = mkv_dir.to_string_lossy().to_string();
    let queue_db = root.path().join("state/queue.db").to_string_lossy().to_string();
    let config = Config::from_lookup(move |key| match key {
        "WATCH_DIRS" => Some(watch.clone()),
        "MKV_DIRS" => Some(library.clone()),
        "TARGET_LANGS" => Some("es".to_string()),
        "QUEUE_DB" => Some(queue_db.clone()),
        _ => None,
    })
    .unwrap();

    let translator: Arc<dyn Translate> = FakeTranslator::returning(b"hola");
    let (signal, shutdown) = shutdown::channel();
    let metrics = Arc::new(Metrics::new().unwrap());

    let extractor = Arc::new(MkvExtractor::new());
    let work_index = Arc::new(WorkIndex::open(&root.path().join("state/mkv_work.db")));
    let probe_cache = Arc::new(ProbeCache::open(extractor.clone(), None, 16));
    let tagger = Arc::new(MkvSubtitleTagger::new(extractor, translator.clone(), 0.85));
    let scanner = Arc::new(MkvScanner::new(
        config.mkv_dirs.clone(),
        tagger,
        translator.clone(),
        &config.target_langs,
        None,
        probe_cache,
        None,
    ));
    let workflow = MkvWorkflow::new(
        scanner,
        1,
        shutdown.clone(),
        work_index.clone(),
        metrics.clone(),
    );

    let app = Application::new(
        config,
        translator,
        None,
        Some(workflow),
        metrics,
        shutdown.clone(),
    )
    .unwrap();

    let server = WebhookServer::bind(
        app,
        &WebhookConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            token: token.map(String::from),
        },
    )
    .await
    .unwrap();
    let url = format!("http://{}/webhook/tdarr", server.local_addr());
    tokio::spawn(server.run(shutdown));

    WebhookFixture {
        url,
        work_index,
        _signal: signal,
        root,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn priority_request_is_accepted_and_recorded() {
    let fixture = boot(Some("secret")).await;
    let video = fixture.root.path().join("library/movie.mkv");
    fs::write(&video, "mkv-bytes").unwrap();

    let response = reqwest::Client::new()
        .post(&fixture.url)
        .bearer_auth("secret")
        .json(&json!({"path": video.to_string_lossy(), "priority": true}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["queued"],
        json!([video.to_string_lossy()]),
        "body: {body}"
    );
    assert_eq!(body["priority"], json!(0));

    // The work index saw the enqueue at high priority.
    let recovered = fixture.work_index.recover_pending();
    assert_eq!(recovered, vec![(video, 0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_is_unauthorized() {
    let fixture = boot(Some("secret")).await;
    let response = reqwest::Client::new()
        .post(&fixture.url)
        .bearer_auth("wrong")
        .json(&json!({"path": "/x.mkv"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // The custom token header is accepted as an alternative.
    let video = fixture.root.path().join("library/alt.mkv");
    fs::write(&video, "v").unwrap();
    let response = reqwest::Client::new()
        .post(&fixture.url)
        .header("X-Webhook-Token", "secret")
        .json(&json!({"path": video.to_string_lossy()}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_path_is_a_bad_request() {
    let fixture = boot(None).await;
    let response = reqwest::Client::new()
        .post(&fixture.url)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("missing path"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unqueueable_paths_return_ok_with_reasons() {
    let fixture = boot(None).await;
    let outside = fixture.root.path().join("elsewhere/movie.mkv");
    fs::create_dir_all(outside.parent().unwrap()).unwrap();
    fs::write(&outside, "v").unwrap();

    let response = reqwest::Client::new()
        .post(&fixture.url)
        .json(&json!({
            "paths": [
                fixture.root.path().join("library/absent.mkv").to_string_lossy(),
                outside.to_string_lossy(),
            ],
            "priority": 1,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["queued"], json!([]));
    assert_eq!(body["priority"], json!(1));
    let reasons: Vec<&str> = body["skipped"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["reason"].as_str().unwrap())
        .collect();
    assert_eq!(reasons, vec!["not_found", "outside_roots"]);
}
