//! Pending-ACK and pending-payload registries
//!
//! Backs the only two blocking semantics in the engine (§5): `waitForAck`
//! and `requestPayload`, both future-like awaits that resolve on a matching
//! reply or reject on a 10s timeout (default, configurable).

use std::time::Duration;

use canopy_core::error::PendingError;
use canopy_core::MsgId;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// A registry of in-flight requests keyed by the `msgId` they are waiting
/// to see echoed back as `replyTo`.
pub struct PendingRegistry<T> {
    waiters: DashMap<MsgId, oneshot::Sender<T>>,
    timeout: Duration,
}

impl<T: Send + 'static> PendingRegistry<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiters: DashMap::new(),
            timeout,
        }
    }

    /// Register a new pending request and return a future that resolves
    /// when [`PendingRegistry::resolve`] is called with a matching id, or
    /// rejects after the configured timeout.
    pub fn register(&self, id: MsgId) -> impl std::future::Future<Output = Result<T, PendingError>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        let timeout = self.timeout;
        async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(PendingError::Closing),
                Err(_) => Err(PendingError::TimedOut),
            }
        }
    }

    /// Resolve a pending request. Returns `true` if a waiter was found.
    /// Unsolicited replies (no matching `replyTo`) are silently ignored.
    pub fn resolve(&self, id: &MsgId, value: T) -> bool {
        if let Some((_, tx)) = self.waiters.remove(id) {
            let _ = tx.send(value);
            true
        } else {
            false
        }
    }

    /// Reject every pending waiter with a "closing" error, used on peer
    /// teardown (§5 cancellation).
    pub fn reject_all(&self) {
        self.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_value_to_waiter() {
        let registry: PendingRegistry<bool> = PendingRegistry::new(Duration::from_secs(1));
        let id = MsgId::generate();
        let fut = registry.register(id);
        assert!(registry.resolve(&id, true));
        assert_eq!(fut.await.unwrap(), true);
    }

    #[tokio::test]
    async fn unmatched_resolve_is_ignored() {
        let registry: PendingRegistry<bool> = PendingRegistry::new(Duration::from_secs(1));
        assert!(!registry.resolve(&MsgId::generate(), true));
    }

    #[tokio::test]
    async fn times_out_without_a_matching_reply() {
        let registry: PendingRegistry<bool> = PendingRegistry::new(Duration::from_millis(10));
        let id = MsgId::generate();
        let fut = registry.register(id);
        let result = fut.await;
        assert!(matches!(result, Err(PendingError::TimedOut)));
    }

    #[tokio::test]
    async fn teardown_rejects_all_pending() {
        let registry: PendingRegistry<bool> = PendingRegistry::new(Duration::from_secs(5));
        let fut = registry.register(MsgId::generate());
        registry.reject_all();
        assert!(matches!(fut.await, Err(PendingError::Closing)));
    }
}
