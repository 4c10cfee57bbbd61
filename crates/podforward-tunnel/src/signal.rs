//! Close-once signals

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A one-shot notification that can be closed exactly once.
///
/// Clones share state. Waiters observe the close through [`Signal::closed`].
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    closed: AtomicBool,
    token: CancellationToken,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the signal. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Signal already closed");
            return false;
        }
        self.inner.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait until the signal is closed
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }

    /// Token cancelled when this signal closes; cancelling it leaves the signal open
    pub fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_close_once() {
        let signal = Signal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = Signal::new();
        let waiter = signal.clone();

        let handle = tokio::spawn(async move { waiter.closed().await });
        signal.close();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_child_token() {
        let signal = Signal::new();
        let child = signal.child_token();
        child.cancel();
        assert!(!signal.is_closed());

        let child = signal.child_token();
        signal.close();
        assert!(child.is_cancelled());
    }
}
