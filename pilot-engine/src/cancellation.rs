//! Cooperative cancellation for routing and pipeline execution.
//!
//! Hedging losers and budget expiry are modeled as explicit cancellation:
//! every provider call receives a token, checks it cooperatively, and the
//! router cancels the tokens of calls whose results will be discarded.
//! Cancellation is best-effort; nothing waits for acknowledgment.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Token for coordinating cancellation across tasks.
///
/// Cancelling is idempotent: only the first reason is stored. Waiters
/// registered via [`CancellationToken::cancelled`] are woken exactly once.
pub struct CancellationToken {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.flag.load(Ordering::SeqCst))
            .field("reason", &self.reason.lock())
            .finish()
    }
}

impl CancellationToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Requests cancellation with a reason. Idempotent.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            *self.reason.lock() = Some(reason.into());
            self.notify.notify_waiters();
        }
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Returns immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        // Register the waiter before re-checking the flag so a cancel
        // between the check and the await cannot be missed.
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self {
            flag: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_initial_state() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_cancel_stores_first_reason() {
        let token = CancellationToken::new();
        token.cancel("budget elapsed");
        token.cancel("second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("budget elapsed".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.reason()
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel("done waiting");

        let reason = handle.await.expect("waiter task");
        assert_eq!(reason, Some("done waiting".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("pre-cancelled");
        token.cancelled().await;
    }

}
