//! Translation service façade.

pub mod client;

pub use client::LibreTranslateClient;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::TranslateError;
use crate::shutdown::Shutdown;

/// A detected language with its confidence in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub language: String,
    pub confidence: f64,
}

/// Capabilities the pipelines need from a translation service.
///
/// Consumers call the predicates instead of inspecting the concrete client;
/// tests substitute fakes behind this trait.
#[async_trait]
pub trait Translate: Send + Sync {
    /// Translates the subtitle file at `path`, returning the translated bytes.
    async fn translate(
        &self,
        path: &Path,
        source: &str,
        target: &str,
    ) -> Result<Vec<u8>, TranslateError>;

    /// Detects the language of a subtitle sample, or `None` below the
    /// confidence floor.
    async fn detect_language(
        &self,
        sample: &[u8],
        min_confidence: f64,
    ) -> Result<Option<Detection>, TranslateError>;

    /// Fetches the source → targets support map from the service.
    async fn fetch_languages(&self) -> Result<HashMap<String, HashSet<String>>, TranslateError>;

    /// Probes service health.
    async fn is_available(&self) -> bool;

    /// Blocks until a health probe succeeds or shutdown is signaled.
    /// Returns false when interrupted by shutdown.
    async fn wait_until_available(&self, shutdown: &Shutdown) -> bool;

    /// Whether the service can translate `source` into `target`.
    fn supports_translation(&self, source: &str, target: &str) -> bool;

    /// Whether any source language can be translated into `target`.
    fn is_target_supported(&self, target: &str) -> bool;
}

/// Broadcast latch for translator availability.
///
/// `clear()` parks every worker in [`AvailabilityGate::wait_timeout`] until
/// `set()` releases them all at once.
pub struct AvailabilityGate {
    tx: watch::Sender<bool>,
}

impl Default for AvailabilityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }

    /// Marks the translator available, releasing all waiters.
    pub fn set(&self) {
        let _ = self.tx.send(true);
    }

    /// Marks the translator unavailable.
    pub fn clear(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits up to `timeout` for the gate to open. Returns whether it is open.
    pub async fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return *rx.borrow();
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {
                    if *rx.borrow() {
                        return true;
                    }
                }
                Ok(Err(_)) | Err(_) => return *rx.borrow(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_starts_open() {
        let gate = AvailabilityGate::new();
        assert!(gate.is_set());
        assert!(gate.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn cleared_gate_blocks_until_set() {
        let gate = Arc::new(AvailabilityGate::new());
        gate.clear();
        assert!(!gate.wait_timeout(Duration::from_millis(20)).await);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.set();
        assert!(waiter.await.unwrap());
    }
}
