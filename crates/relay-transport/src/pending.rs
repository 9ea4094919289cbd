//! Pending-request correlation map.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use relay_protocol::{JsonRpcError, RequestId};

/// What a pending request eventually resolves to: the raw response object,
/// or the JSON-RPC error broadcast on a connection-level failure.
pub(crate) type PendingOutcome = Result<Value, JsonRpcError>;

/// One connection's map of in-flight, id-bearing requests.
///
/// Every entry is removed exactly once, by whichever fires first: a matching
/// response, the per-request timeout, or a connection-failure broadcast.
/// Removal happens before the single-use sender is consumed, so a late
/// second event finds nothing to resolve.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    inner: DashMap<RequestId, oneshot::Sender<PendingOutcome>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a request id and returns the receiver its caller awaits.
    ///
    /// Reusing an id that is still in flight drops the earlier entry; its
    /// waiter observes a closed channel.
    pub(crate) fn register(&self, id: RequestId) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        if self.inner.insert(id.clone(), tx).is_some() {
            warn!(%id, "request id reused while still pending; dropping earlier entry");
        }
        rx
    }

    /// Resolves the entry for `id` with a response. Returns `false` when no
    /// entry exists (already timed out, failed, or never registered).
    pub(crate) fn complete(&self, id: &RequestId, response: Value) -> bool {
        match self.inner.remove(id) {
            Some((_, tx)) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Removes the entry for `id` without resolving it (timeout and
    /// write-failure paths; the caller already holds its own error).
    pub(crate) fn remove(&self, id: &RequestId) {
        self.inner.remove(id);
    }

    /// Rejects every outstanding request with the same error object
    /// (connection-level failure broadcast).
    pub(crate) fn fail_all(&self, error: &JsonRpcError) {
        let ids: Vec<RequestId> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.inner.remove(&id) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_resolves_and_removes() {
        let pending = PendingRequests::new();
        let rx = pending.register(RequestId::from(1));

        assert!(pending.complete(&RequestId::from(1), json!({"result": "ok"})));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"result": "ok"}));

        // Second resolution finds nothing.
        assert!(!pending.complete(&RequestId::from(1), json!({})));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn fail_all_broadcasts_one_error_object() {
        let pending = PendingRequests::new();
        let rx1 = pending.register(RequestId::from(1));
        let rx2 = pending.register(RequestId::from("two"));

        pending.fail_all(&JsonRpcError::internal_error("Process terminated"));

        for rx in [rx1, rx2] {
            let err = rx.await.unwrap().unwrap_err();
            assert_eq!(err.code, -32603);
            assert_eq!(err.message, "Process terminated");
        }
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn removed_entry_is_not_resolvable() {
        let pending = PendingRequests::new();
        let rx = pending.register(RequestId::from(7));
        pending.remove(&RequestId::from(7));

        assert!(!pending.complete(&RequestId::from(7), json!({})));
        assert!(rx.await.is_err());
    }
}
