//! Prometheus metrics exporter.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use tracing::{error, info};

use crate::error::NotifyError;
use crate::shutdown::Shutdown;

/// Operational metrics for both pipelines.
pub struct Metrics {
    registry: Registry,
    /// Persistent sidecar queue size.
    pub queue_depth: Gauge,
    /// In-memory MKV queue size.
    pub mkv_queue_depth: Gauge,
    /// Translation outcomes by result.
    pub translations_total: CounterVec,
    /// End-to-end duration of one sidecar translation.
    pub translation_duration_seconds: Histogram,
    /// Enqueue-to-dequeue latency of priority-0 MKV items.
    pub priority_wait_seconds: Histogram,
    /// Live sidecar workers.
    pub active_workers: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, NotifyError> {
        let registry = Registry::new();

        let queue_depth = Gauge::new("babelarr_queue_depth", "Sidecar translations waiting in queue")
            .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;

        let mkv_queue_depth = Gauge::new(
            "babelarr_mkv_queue_depth",
            "MKV videos waiting for reconciliation",
        )
        .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;

        let translations_total = CounterVec::new(
            Opts::new("babelarr_translations_total", "Translation task outcomes"),
            &["outcome"],
        )
        .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;

        let translation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "babelarr_translation_duration_seconds",
                "Time to translate one sidecar",
            )
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 180.0, 600.0, 1800.0]),
        )
        .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;

        let priority_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "babelarr_priority_wait_seconds",
                "Queue latency of priority-0 MKV items",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        )
        .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;

        let active_workers = Gauge::new("babelarr_active_workers", "Live sidecar workers")
            .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;

        for collector in [
            Box::new(queue_depth.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(mkv_queue_depth.clone()),
            Box::new(translations_total.clone()),
            Box::new(translation_duration_seconds.clone()),
            Box::new(priority_wait_seconds.clone()),
            Box::new(active_workers.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;
        }

        Ok(Self {
            registry,
            queue_depth,
            mkv_queue_depth,
            translations_total,
            translation_duration_seconds,
            priority_wait_seconds,
            active_workers,
        })
    }

    /// Records one finished sidecar task.
    pub fn record_outcome(&self, outcome: &str, duration_secs: f64) {
        self.translations_total.with_label_values(&[outcome]).inc();
        if outcome == "succeeded" {
            self.translation_duration_seconds.observe(duration_secs);
        }
    }

    /// Renders the registry in Prometheus text format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// HTTP server exposing `/metrics`.
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    port: u16,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, port: u16) -> Self {
        Self { metrics, port }
    }

    /// Serves until shutdown is signaled.
    pub async fn start(self, shutdown: Shutdown) -> Result<(), NotifyError> {
        use http_body_util::Full;
        use hyper::body::{Bytes, Incoming};
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{Request, Response};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NotifyError::MetricsFailed(e.to_string()))?;

        info!(port = self.port, "Metrics server listening");

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => {
                    accepted.map_err(|e| NotifyError::MetricsFailed(e.to_string()))?
                }
                _ = shutdown.wait() => {
                    info!("Metrics server stopping");
                    return Ok(());
                }
            };

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move {
                        if req.uri().path() == "/metrics" {
                            let body = metrics.gather();
                            Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                        } else {
                            Ok(Response::builder()
                                .status(404)
                                .body(Full::new(Bytes::from("Not Found")))
                                .unwrap())
                        }
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving metrics connection");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_counted() {
        let metrics = Metrics::new().unwrap();
        metrics.record_outcome("succeeded", 2.0);
        metrics.record_outcome("failed", 0.0);
        metrics.queue_depth.set(3.0);

        let rendered = metrics.gather();
        assert!(rendered.contains("babelarr_translations_total"));
        assert!(rendered.contains("outcome=\"succeeded\""));
        assert!(rendered.contains("babelarr_queue_depth 3"));
    }
}
