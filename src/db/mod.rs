//! Embedded SQLite persistence: sidecar queue, MKV work index, probe cache.

pub mod probe_cache;
pub mod queue;
pub mod work_index;

pub use probe_cache::ProbeCache;
pub use queue::{QueueRecord, QueueRepository};
pub use work_index::WorkIndex;
