//! Cancellation of in-flight loads.
//!
//! A [`CancelHandle`] is cloned into every place that may need to stop early:
//! the orchestrator checks it before each segment and races it against pacing
//! waits and backoff sleeps. A provider round-trip already in flight is allowed
//! to finish. Cancelling never undoes work; merged segments stay in the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation flag with async notification
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Create a handle that has not been cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Wakes every waiter; later calls are no-ops.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            self.state.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested. Returns immediately if it already was.
    pub async fn cancelled(&self) {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a cancel() in between is not lost.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Cancel this handle when Ctrl+C is received
    pub fn cancel_on_ctrl_c(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing current segment and stopping");
                handle.cancel();
            }
        });
    }
}
