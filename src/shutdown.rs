//! Cooperative cancellation.
//!
//! A `Shutdown` handle is cloned into every long-running loop; I/O awaits
//! race against `cancelled()`. On trigger, each unit of work finishes or
//! abandons cleanly (commit fully or not at all) before the task returns.

use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Safe to race in `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // Sender dropped also counts as shutdown.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Sleep that wakes early on shutdown; returns false if interrupted.
    pub async fn sleep(&self, dur: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_sleepers() {
        let (trigger, shutdown) = channel();
        let s2 = shutdown.clone();
        let handle = tokio::spawn(async move { s2.sleep(Duration::from_secs(30)).await });
        trigger.trigger();
        let completed = handle.await.unwrap();
        assert!(!completed);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_completes_without_trigger() {
        let (_trigger, shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
    }
}
