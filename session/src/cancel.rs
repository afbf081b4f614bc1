//! One-shot cancellation latch shared by all tasks of a session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// One-shot latch that flips once and never back.
///
/// Every asynchronous loop of a session polls the token at each re-entry
/// and must not resume work after observing it cancelled. The caller that
/// performs the first flip owns the single connection-terminated emission
/// and the final disposal of the session's resources.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the latch. Returns `true` when this call was the first flip.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.flag.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Whether the token has been flipped.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token has been cancelled.
    ///
    /// Intended as a `tokio::select!` arm next to the loop's I/O future.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before re-checking so a concurrent cancel()
        // cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_first_flip_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        assert!(token.cancel());
        assert!(token.is_cancelled());

        // Idempotent: later flips report not-first.
        assert!(!token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_the_latch() {
        let token = CancelToken::new();
        let other = token.clone();

        assert!(other.cancel());
        assert!(token.is_cancelled());
        assert!(!token.cancel());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();

        timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_after_flip() {
        let token = CancelToken::new();
        token.cancel();
        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token must not block");
    }
}
