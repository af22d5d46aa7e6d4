//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is shared by the caller, the execution engine and
//! any row-source producer threads. Cancelling a token propagates to every
//! child token created from it, never upward, so a worker group can be torn
//! down without touching the caller's token.
//!
//! Consumers poll with [`CancellationToken::checkpoint`] at natural iteration
//! boundaries (per row, per chunk). There is no forced preemption.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use musoq_error::{MusoqError, Result};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct TokenInner {
    cancel_requested: AtomicBool,
    reason: Mutex<Option<String>>,
    children: Mutex<Vec<Arc<TokenInner>>>,
}

// Release each node's lock before recursing into children.
fn propagate_cancel(inner: &TokenInner, reason: &str) {
    if inner.cancel_requested.swap(true, Ordering::AcqRel) {
        return;
    }
    inner.reason.lock().get_or_insert_with(|| reason.to_owned());
    let children: Vec<Arc<TokenInner>> = inner.children.lock().clone();
    for child in &children {
        propagate_cancel(child, reason);
    }
}

/// Shared cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled whenever `self` is. Cancelling the child does
    /// not cancel the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        self.inner.children.lock().push(Arc::clone(&child.inner));
        if self.is_cancelled() {
            let reason = self.reason().unwrap_or_default();
            propagate_cancel(&child.inner, &reason);
        }
        child
    }

    /// Request cancellation. Idempotent; the first reason wins.
    pub fn cancel(&self) {
        self.cancel_with_reason("cancelled by caller");
    }

    pub fn cancel_with_reason(&self, reason: &str) {
        propagate_cancel(&self.inner, reason);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// `Err(MusoqError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MusoqError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes_checkpoint() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.checkpoint().is_ok());
    }

    #[test]
    fn cancel_fails_checkpoint() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(MusoqError::Cancelled)));
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_propagates_to_children_only() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(grandchild.is_cancelled());
        parent.cancel();
        assert!(parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_token_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel_with_reason("deadline");
        let child = parent.child();
        assert!(child.is_cancelled());
        assert_eq!(child.reason().as_deref(), Some("deadline"));
    }

    #[test]
    fn first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel_with_reason("first");
        token.cancel_with_reason("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn cancel_across_threads() {
        let token = CancellationToken::new();
        let worker = token.clone();
        let handle = std::thread::spawn(move || {
            while worker.checkpoint().is_ok() {
                std::thread::yield_now();
            }
        });
        token.cancel();
        handle.join().unwrap();
    }
}
