//! Cooperative shutdown signal shared by every loop in the pipeline.

use tokio::sync::watch;

/// Sender half, held by the supervisor.
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

/// Receiver half, cloned into workers, watchers, and servers.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Creates a linked signal/listener pair.
pub fn channel() -> (ShutdownSignal, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSignal { tx }, Shutdown { rx })
}

impl ShutdownSignal {
    /// Signals shutdown to every listener.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// Returns true once shutdown has been signaled.
    pub fn triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is signaled.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `dur`, waking early on shutdown. Returns true if shutdown
    /// fired during the sleep.
    pub async fn sleep(&self, dur: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.triggered(),
            _ = self.wait() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let (signal, shutdown) = channel();
        assert!(!shutdown.triggered());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.wait().await;
                true
            })
        };

        signal.trigger();
        assert!(waiter.await.unwrap());
        assert!(shutdown.triggered());
    }

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let (signal, shutdown) = channel();
        signal.trigger();
        assert!(shutdown.sleep(Duration::from_secs(30)).await);
    }
}
