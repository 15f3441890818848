//! Cooperative cancellation primitive for engine teardown.
//!
//! Clones share the same underlying state, so cancelling any clone notifies
//! all waiters. Recovery timers and the per-file write queues race their
//! sleeps against this token, which is what makes `disconnect()`
//! deterministic: no timer survives the cancel.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
#[derive(Debug, Default)]
pub struct Shutdown {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters. Idempotent.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        if self.cancelled() {
            return;
        }
        let notified = self.internal.notify.notified();
        // Re-check after registering to close the race with cancel().
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if
    /// cancellation is signaled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            internal: Arc::clone(&self.internal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_releases_waiters() {
        let token = Shutdown::new();
        let clone = token.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        waiter.await.unwrap();
        assert!(token.cancelled());
    }

    #[tokio::test]
    async fn select_prefers_cancellation() {
        let token = Shutdown::new();
        token.cancel();
        let out = token
            .select(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let token = Shutdown::new();
        token.cancel();
        token.cancel();
        assert!(token.cancelled());
        token.wait().await; // returns immediately
    }
}
