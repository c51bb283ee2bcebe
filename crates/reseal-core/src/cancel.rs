//! Run-scoped cancellation
//!
//! Cancelling stops dispatch of new work; in-flight jobs observe it at their
//! next suspension point and before they write anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<String>>>,
    rx: watch::Receiver<Option<String>>,
    parent: Option<Arc<CancelSignal>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
            parent: None,
        }
    }

    /// Cancel with a reason. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Own reason first, then the parent's
    pub fn reason(&self) -> Option<String> {
        self.rx
            .borrow()
            .clone()
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }

    /// Resolves once the signal is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }

    /// Sleep for `duration`. Returns false if cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }

    /// A signal cancelled whenever `self` is, but which can also be cancelled on its own.
    ///
    /// Synchronous checks on the child see the parent immediately; waiters are
    /// woken by the returned forwarding task.
    pub fn child(&self) -> (CancelSignal, JoinHandle<()>) {
        let mut child = CancelSignal::new();
        child.parent = Some(Arc::new(self.clone()));
        let parent = self.clone();
        let forward = child.clone();
        let handle = tokio::spawn(async move {
            parent.cancelled().await;
            forward.cancel(parent.reason().unwrap_or_default());
        });
        (child, handle)
    }

    /// Cancel automatically after `timeout`
    pub fn cancel_after(&self, timeout: Duration) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            if signal.sleep(timeout).await {
                signal.cancel(format!("timed out after {}s", timeout.as_secs()));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        signal.cancel("operator abort");
        signal.cancel("second");

        assert!(signal.is_cancelled());
        assert_eq!(signal.reason().as_deref(), Some("operator abort"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let sleeper = tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        signal.cancel("stop");

        assert!(!sleeper.await.unwrap());
        assert!(CancelSignal::new().sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = CancelSignal::new();
        let (child, _handle) = parent.child();

        child.cancel("child only");
        assert!(!parent.is_cancelled());

        let parent = CancelSignal::new();
        let (child, _handle) = parent.child();
        parent.cancel("parent");
        child.cancelled().await;
        assert_eq!(child.reason().as_deref(), Some("parent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_timeout() {
        let signal = CancelSignal::new();
        let _timer = signal.cancel_after(Duration::from_secs(30));

        signal.cancelled().await;
        assert_eq!(signal.reason().as_deref(), Some("timed out after 30s"));
    }
}
