//! Cancellation handle for in-flight streams

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stops one streaming call.
///
/// Clones share state. `cancel()` is idempotent: the first call flips the
/// shared flag and cancels the token the read loop selects on; later calls
/// do nothing.
#[derive(Clone, Debug)]
pub struct StreamCancellationHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    cancelled: AtomicBool,
}

impl StreamCancellationHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Handle for a request that never started a stream
    pub fn noop() -> Self {
        Self::new()
    }

    /// Token observed by the provider read loop
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn cancel(&self) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.token.cancel();
            tracing::debug!("Stream cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl Default for StreamCancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = StreamCancellationHandle::new();
        let token = handle.token();
        assert!(!handle.is_cancelled());

        handle.cancel();
        handle.cancel();

        assert!(handle.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = StreamCancellationHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
    }
}
