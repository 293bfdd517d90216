//! Cooperative cancellation.
//!
//! The coordinator checks the signal before each chunk and while sleeping
//! between passes; controllers check it at step boundaries only.

use tokio::sync::watch;

/// Sending half. Dropping it does not cancel.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable receiving half.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // an error means the trigger was dropped without firing
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_is_observed_by_all_clones() {
        let (trigger, signal) = shutdown_channel();
        let other = signal.clone();
        assert!(!signal.is_cancelled());
        trigger.trigger();
        assert!(signal.is_cancelled());
        assert!(other.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), other.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn never_does_not_fire() {
        let signal = ShutdownSignal::never();
        let res = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(res.is_err());
        assert!(!signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trigger_does_not_cancel() {
        let (trigger, signal) = shutdown_channel();
        drop(trigger);
        let res = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(res.is_err());
    }
}
