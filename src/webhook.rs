//! Tdarr-style webhook ingress for the MKV pipeline.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::app::Application;
use crate::config::WebhookConfig;
use crate::shutdown::Shutdown;

/// Minimal HTTP endpoint accepting `{path?, paths?, priority?}` payloads.
pub struct WebhookServer {
    app: Arc<Application>,
    token: Option<String>,
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
}

impl WebhookServer {
    /// Binds the listener; port 0 picks a free port.
    pub async fn bind(app: Arc<Application>, config: &WebhookConfig) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            app,
            token: config.token.clone(),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until shutdown is signaled.
    pub async fn run(self, shutdown: Shutdown) {
        info!(addr = %self.local_addr, "Webhook server listening");
        loop {
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Webhook accept failed");
                        continue;
                    }
                },
                _ = shutdown.wait() => {
                    info!("Webhook server stopping");
                    return;
                }
            };

            let io = TokioIo::new(stream);
            let app = self.app.clone();
            let token = self.token.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let app = app.clone();
                    let token = token.clone();
                    async move { Ok::<_, hyper::Error>(handle(app, token, req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving webhook connection");
                }
            });
        }
    }
}

async fn handle(
    app: Arc<Application>,
    token: Option<String>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if !matches!(req.uri().path(), "/webhook/tdarr" | "/tdarr") {
        return json_response(StatusCode::NOT_FOUND, json!({"error": "not found"}));
    }
    if req.method() != Method::POST {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"error": "method not allowed"}),
        );
    }
    if !authorized(&req, token.as_deref()) {
        return json_response(StatusCode::UNAUTHORIZED, json!({"error": "unauthorized"}));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read webhook body");
            return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid body"}));
        }
    };
    let payload: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(_) => {
                return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid json"}));
            }
        }
    };
    if !payload.is_object() {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "expected JSON object"}),
        );
    }

    let paths = parse_paths(&payload);
    if paths.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "missing path", "queued": [], "skipped": []}),
        );
    }
    let priority = parse_priority(&payload);

    let total = paths.len();
    let (accepted, skipped) = app.enqueue_webhook_paths(paths, priority);
    info!(
        total,
        queued = accepted.len(),
        priority,
        "Webhook request handled"
    );

    let status = if accepted.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    json_response(
        status,
        json!({
            "queued": accepted
                .iter()
                .map(|p| p.to_string_lossy())
                .collect::<Vec<_>>(),
            "skipped": skipped
                .iter()
                .map(|(path, reason)| json!({
                    "path": path.to_string_lossy(),
                    "reason": reason,
                }))
                .collect::<Vec<_>>(),
            "priority": priority,
        }),
    )
}

fn authorized(req: &Request<Incoming>, token: Option<&str>) -> bool {
    let Some(expected) = token else {
        return true;
    };
    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, value) = v.split_once(' ')?;
            scheme
                .eq_ignore_ascii_case("bearer")
                .then(|| value.trim().to_string())
        })
        .or_else(|| {
            ["x-webhook-token", "x-babelarr-token"].iter().find_map(|header| {
                req.headers()
                    .get(*header)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
        });
    provided.as_deref() == Some(expected)
}

/// Collects `path` and `paths` entries, deduplicated in order.
pub(crate) fn parse_paths(payload: &Value) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(path) = payload.get("path").and_then(|v| v.as_str()) {
        paths.push(PathBuf::from(path));
    }
    if let Some(list) = payload.get("paths").and_then(|v| v.as_array()) {
        for item in list {
            if let Some(path) = item.as_str() {
                paths.push(PathBuf::from(path));
            }
        }
    }
    let mut seen = std::collections::HashSet::new();
    paths.retain(|path| seen.insert(path.clone()));
    paths
}

/// Normalizes the requested priority to `{0, 1}`; truthy and absent values
/// mean high priority.
pub(crate) fn parse_priority(payload: &Value) -> u8 {
    let priority = match payload.get("priority") {
        Some(Value::Bool(_)) => 0,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    if priority <= 0 {
        0
    } else {
        1
    }
}

fn json_response(status: StatusCode, payload: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json; charset=utf-8")
        .body(Full::new(Bytes::from(payload.to_string())))
        .unwrap_or_default()
}
