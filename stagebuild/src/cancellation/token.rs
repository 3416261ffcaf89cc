//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
/// Tasks can poll [`is_cancelled`](Self::is_cancelled) or await
/// [`cancelled`](Self::cancelled) at their suspension points.
#[derive(Default)]
pub struct CancellationToken {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Callbacks to invoke on cancellation.
    callbacks: RwLock<Vec<CancelCallback>>,
    /// Tokens derived with `child()`. Dropped children are pruned on each new one.
    children: RwLock<Vec<Weak<CancellationToken>>>,
    /// Wakes tasks awaiting `cancelled()`.
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled whenever `self` is.
    ///
    /// Cancelling the child does not affect the parent.
    #[must_use]
    pub fn child(&self) -> Arc<Self> {
        let child = Arc::new(Self::new());
        {
            let mut children = self.children.write();
            if !self.is_cancelled() {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child));
                return child;
            }
        }
        child.cancel(self.reason().unwrap_or_default());
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let reason = reason.into();
            *self.reason.write() = Some(reason.clone());
            self.notify.notify_waiters();

            let children = std::mem::take(&mut *self.children.write());
            for child in children.iter().filter_map(Weak::upgrade) {
                child.cancel(reason.clone());
            }

            let callbacks = std::mem::take(&mut *self.callbacks.write());
            for callback in &callbacks {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&reason);
                })) {
                    warn!("Cancellation callback panicked: {:?}", e);
                }
            }
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        {
            // Checked under the lock so a concurrent cancel() cannot miss the callback.
            let mut callbacks = self.callbacks.write();
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }

        let reason = self.reason().unwrap_or_default();
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(&reason);
        })) {
            warn!("Cancellation callback panicked: {:?}", e);
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        // First reason wins
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_on_cancel_receives_reason() {
        let token = CancellationToken::new();
        let seen = Arc::new(RwLock::new(None));
        let seen_clone = seen.clone();

        token.on_cancel(move |reason| {
            *seen_clone.write() = Some(reason.to_string());
        });
        assert!(seen.read().is_none());

        token.cancel("stage failed");
        assert_eq!(seen.read().as_deref(), Some("stage failed"));
    }

    #[test]
    fn test_on_cancel_after_cancellation() {
        let token = CancellationToken::new();
        token.cancel("test");

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        // Should invoke immediately
        token.on_cancel(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|_| panic!("Intentional panic"));

        token.cancel("test");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel("child only");
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel("interrupted");
        assert!(other.is_cancelled());
        assert_eq!(other.reason(), Some("interrupted".to_string()));

        let late = parent.child();
        assert_eq!(late.reason(), Some("interrupted".to_string()));
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let parent = CancellationToken::new();
        for _ in 0..10 {
            drop(parent.child());
        }
        let live = parent.child();
        assert_eq!(parent.children.read().len(), 1);
        assert!(parent.callbacks.read().is_empty());

        parent.cancel("stop");
        assert!(live.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("wake up");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("done");
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
