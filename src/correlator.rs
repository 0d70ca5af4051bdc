//! Request/response correlation.
//!
//! Every request draws its id from a process-wide counter, so no two
//! in-flight requests anywhere in the process share one. A registered id
//! holds a oneshot sender; the reader pump resolves it when the response
//! with the matching id arrives, in whatever order the server replies.
//! Responses for unknown ids (late arrivals after a timeout, or ids this
//! client never issued) are dropped with a debug log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use crate::errors::McpError;
use crate::types::{error_codes, JsonRpcError};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a request ID unique for the lifetime of the process.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Convert a response body into the waiter's outcome.
///
/// A populated `error` member wins over `result`; a response carrying
/// neither is itself a protocol violation and surfaces as a server error.
pub fn response_outcome(
    result: Option<Value>,
    error: Option<JsonRpcError>,
) -> Result<Value, McpError> {
    if let Some(err) = error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    result.ok_or_else(|| McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Correlator ──────────────────────────────────────────────────────────────

/// Waiters keyed by request id.
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, McpError>>>;

/// Pending-request table for one connection.
///
/// The lock is held only for map operations, never across an await.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: Mutex<PendingMap>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending_lock(&self) -> MutexGuard<'_, PendingMap> {
        // Recover the guard if a holder panicked mid-update.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate an id and register a waiter for its response.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<Value, McpError>>) {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(id, tx);
        (id, rx)
    }

    /// Hand a response outcome to the waiter registered for `id`.
    ///
    /// Returns `false` when no waiter is registered, which covers both
    /// ids this client never issued and duplicate responses after the
    /// first one already consumed the waiter.
    pub fn resolve(&self, id: u64, outcome: Result<Value, McpError>) -> bool {
        match self.pending_lock().remove(&id) {
            Some(tx) => {
                // The waiter may have given up already; nothing left to do then.
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::debug!(id, "dropping response with no pending request");
                false
            }
        }
    }

    /// Drop the waiter for `id` without resolving it.
    pub fn forget(&self, id: u64) {
        self.pending_lock().remove(&id);
    }

    /// Fail every pending request, in teardown or after transport loss.
    pub fn reject_all(&self, server: &str, reason: &str) {
        let drained: Vec<_> = self.pending_lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(
                server = %server,
                count = drained.len(),
                "rejecting pending requests"
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(McpError::ConnectionClosed {
                server: server.to_string(),
                reason: reason.to_string(),
            }));
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending_lock().len()
    }

    /// Await the outcome for `id`, bounded by the per-request timeout.
    ///
    /// On timeout the pending entry is removed so a late response for the
    /// same id is dropped rather than delivered.
    pub async fn wait(
        &self,
        server: &str,
        method: &str,
        id: u64,
        rx: oneshot::Receiver<Result<Value, McpError>>,
        timeout_millis: u64,
    ) -> Result<Value, McpError> {
        match timeout(Duration::from_millis(timeout_millis), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed {
                server: server.to_string(),
                reason: "request abandoned before a response arrived".into(),
            }),
            Err(_) => {
                self.forget(id);
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout_millis,
                })
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_response_outcome_error_wins() {
        let err = response_outcome(
            Some(json!({"ok": true})),
            Some(JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: "Method not found".into(),
                data: None,
            }),
        )
        .unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_response_outcome_missing_both() {
        let err = response_outcome(None, None).unwrap_err();
        assert!(matches!(
            err,
            McpError::ServerError {
                code: error_codes::INTERNAL_ERROR,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_resolution() {
        let correlator = RequestCorrelator::new();
        let (id_a, rx_a) = correlator.register();
        let (id_b, rx_b) = correlator.register();

        // Second request answered first.
        assert!(correlator.resolve(id_b, Ok(json!({"which": "b"}))));
        assert!(correlator.resolve(id_a, Ok(json!({"which": "a"}))));

        assert_eq!(rx_a.await.unwrap().unwrap()["which"], "a");
        assert_eq!(rx_b.await.unwrap().unwrap()["which"], "b");
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_to_their_own_payloads() {
        const REQUESTS: usize = 16;
        let correlator = Arc::new(RequestCorrelator::new());
        let (id_tx, mut id_rx) = mpsc::unbounded_channel();

        let mut waiters = Vec::new();
        for _ in 0..REQUESTS {
            let correlator = Arc::clone(&correlator);
            let id_tx = id_tx.clone();
            waiters.push(tokio::spawn(async move {
                let (id, rx) = correlator.register();
                id_tx.send(id).unwrap();
                let value = rx.await.unwrap().unwrap();
                assert_eq!(value["id"], id);
            }));
        }

        let mut ids = Vec::new();
        for _ in 0..REQUESTS {
            ids.push(id_rx.recv().await.unwrap());
        }
        assert_eq!(correlator.pending_len(), REQUESTS);

        // Stride 5 is coprime with 16, so every id resolves exactly once
        // in an order unrelated to registration.
        for step in 0..REQUESTS {
            let id = ids[step * 5 % REQUESTS];
            assert!(correlator.resolve(id, Ok(json!({"id": id}))));
        }

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_dropped() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.register();

        assert!(correlator.resolve(id, Ok(json!(1))));
        assert!(!correlator.resolve(id, Ok(json!(2))));

        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_unknown_id_dropped() {
        let correlator = RequestCorrelator::new();
        assert!(!correlator.resolve(424242, Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_wait_times_out_and_forgets() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.register();
        assert_eq!(correlator.pending_len(), 1);

        let err = correlator
            .wait("files", "tools/call", id, rx, 10)
            .await
            .unwrap_err();
        match err {
            McpError::Timeout { method, timeout_ms } => {
                assert_eq!(method, "tools/call");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }

        // A late response for the timed-out id finds nothing to resolve.
        assert_eq!(correlator.pending_len(), 0);
        assert!(!correlator.resolve(id, Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_wait_returns_resolved_value() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.register();

        correlator.resolve(id, Ok(json!({"tools": []})));
        let value = correlator
            .wait("files", "tools/list", id, rx, 1_000)
            .await
            .unwrap();
        assert_eq!(value["tools"], json!([]));
    }

    #[tokio::test]
    async fn test_reject_all_fails_every_pending_request() {
        let correlator = RequestCorrelator::new();
        let (_, rx_a) = correlator.register();
        let (_, rx_b) = correlator.register();

        correlator.reject_all("files", "transport closed");
        assert_eq!(correlator.pending_len(), 0);

        for rx in [rx_a, rx_b] {
            let err = rx.await.unwrap().unwrap_err();
            match err {
                McpError::ConnectionClosed { server, reason } => {
                    assert_eq!(server, "files");
                    assert_eq!(reason, "transport closed");
                }
                other => panic!("expected ConnectionClosed, got {other:?}"),
            }
        }
    }
}
