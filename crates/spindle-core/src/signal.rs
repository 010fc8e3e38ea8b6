//! Cooperative shutdown signalling.
//!
//! The server owns a [`ShutdownController`]; every connection task,
//! request worker, and plugin call receives a [`ShutdownSignal`] derived
//! from it. Signals are edge-triggered (`watch`-based) and cheap to clone,
//! so a single trigger fans out to every observer without bookkeeping.

use std::sync::Arc;

use tokio::sync::watch;

/// Owning side of a shutdown signal.
///
/// Clones share the same trigger. Dropping the last controller also
/// cancels all derived signals, so a scope that creates a controller
/// cancels its children on unwind.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownController {
    /// Create a new, untriggered controller.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Derive a signal observing this controller.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of a shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    /// `None` means the signal never fires (detached contexts in tests).
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether shutdown has been requested.
    ///
    /// A dropped controller counts as a request: an orphaned signal must
    /// not keep its observer alive.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow(),
            None => false,
        }
    }

    /// Resolve once shutdown is requested.
    ///
    /// Cancel-safe: this borrows no state across await points that would
    /// be lost if the future is dropped, so it can sit in a `select!` arm.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            // An Err means the controller was dropped; treat it as shutdown.
            if rx.changed().await.is_err() {
                return;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_wakes_all_signals() {
        let controller = ShutdownController::new();
        let a = controller.signal();
        let b = controller.signal();

        assert!(!a.is_cancelled());
        controller.trigger();
        assert!(a.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), a.cancelled())
            .await
            .expect("signal a did not fire");
        tokio::time::timeout(Duration::from_secs(1), b.cancelled())
            .await
            .expect("signal b did not fire");
    }

    #[tokio::test]
    async fn dropped_controller_cancels_signals() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        drop(controller);

        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("orphaned signal did not fire");
    }

    #[tokio::test]
    async fn never_signal_does_not_fire() {
        let signal = ShutdownSignal::never();
        assert!(!signal.is_cancelled());

        let fired = tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .is_ok();
        assert!(!fired);
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let controller = ShutdownController::new();
        controller.trigger();
        controller.trigger();
        assert!(controller.is_triggered());
    }
}
