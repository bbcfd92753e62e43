//! Outbound integrations: media-server refresh and Prometheus metrics.

pub mod jellyfin;
pub mod metrics;

pub use jellyfin::JellyfinClient;
pub use metrics::{Metrics, MetricsServer};
