//! Request/subscription correlation
//!
//! Matches asynchronous inbound frames to the outbound operation that
//! caused them. Each in-flight operation is keyed by a correlation id:
//! a monotonic integer for `post`, the canonical form of the framed
//! request for `subscribe`/`unsubscribe`, and a sentinel for `ping`
//! (only one liveness probe is ever outstanding).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result, TerminationReason};
use crate::protocol::{
    canonical_key, ping_frame, post_frame, subscription_body, subscription_id, Method,
};

// ─────────────────────────────────────────────────────────────────
// Correlation Ids
// ─────────────────────────────────────────────────────────────────

/// Key matching an inbound response to its outbound operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    /// `post` request, numbered from a counter that is never reset so ids
    /// from before a reconnect cannot collide with new ones
    Post(u64),

    /// `subscribe`/`unsubscribe` request, keyed by the canonical form of
    /// the full framed body (the acknowledgement echoes the same body)
    Sub(String),

    /// The single outstanding liveness probe
    Ping,
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Post(id) => write!(f, "post:{}", id),
            CorrelationId::Sub(key) => write!(f, "sub:{}", key),
            CorrelationId::Ping => write!(f, "ping"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Correlator
// ─────────────────────────────────────────────────────────────────

/// The in-flight operation registry
pub struct Correlator {
    conn: Connection,
    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<Result<Value>>>>,
    next_post_id: AtomicU64,
    last_send: Mutex<Instant>,
}

impl Correlator {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            pending: Mutex::new(HashMap::new()),
            next_post_id: AtomicU64::new(1),
            last_send: Mutex::new(Instant::now()),
        }
    }

    /// When the last outbound operation was sent; the keep-alive scheduler
    /// measures idle time from this instant
    pub fn last_send(&self) -> Instant {
        *self.last_send.lock()
    }

    /// Number of operations currently awaiting a response
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send one operation and await its response.
    ///
    /// Cancelling removes this caller's registry entry but does not recall
    /// the request already on the wire.
    pub async fn execute(
        &self,
        method: Method,
        payload: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (id, frame) = match method {
            Method::Post => {
                let post_id = self.next_post_id.fetch_add(1, Ordering::Relaxed);
                let request = payload.unwrap_or(Value::Null);
                (CorrelationId::Post(post_id), post_frame(post_id, &request))
            }
            Method::Subscribe | Method::Unsubscribe => {
                let subscription = payload.unwrap_or(Value::Null);
                let body = subscription_body(method, &subscription);
                (CorrelationId::Sub(subscription_id(&body)), body.to_string())
            }
            Method::Ping => (CorrelationId::Ping, ping_frame()),
        };

        let rx = {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(Error::DuplicateRequest { id: id.to_string() });
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id.clone(), tx);
            rx
        };

        if let Err(e) = self.conn.send(frame) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        *self.last_send.lock() = Instant::now();
        debug!(id = %id, method = method.as_str(), "operation sent");

        tokio::select! {
            result = rx => match result {
                Ok(outcome) => outcome,
                // Sender dropped without a verdict; the connection is gone.
                Err(_) => Err(Error::closed(
                    self.conn
                        .termination_reason()
                        .unwrap_or(TerminationReason::UserClose),
                )),
            },
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&id);
                Err(Error::Cancelled)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Frame Resolution
    // ─────────────────────────────────────────────────────────────

    /// Resolve a `post` response frame
    pub fn resolve_post(&self, data: &Value) {
        let Some(id) = data.get("id").and_then(Value::as_u64) else {
            debug!("post response without numeric id dropped");
            return;
        };
        let Some(response) = data.get("response") else {
            debug!(id, "post response without body dropped");
            return;
        };
        let value = match response.get("type").and_then(Value::as_str) {
            Some("info") => response
                .get("payload")
                .and_then(|payload| payload.get("data"))
                .cloned()
                .unwrap_or(Value::Null),
            Some("action") => response.get("payload").cloned().unwrap_or(Value::Null),
            other => {
                debug!(id, kind = ?other, "post response with unknown type dropped");
                return;
            }
        };
        self.complete(&CorrelationId::Post(id), Ok(value));
    }

    /// Resolve a subscribe/unsubscribe acknowledgement
    pub fn resolve_subscription(&self, data: &Value) {
        let id = CorrelationId::Sub(canonical_key(data));
        self.complete(&id, Ok(data.clone()));
    }

    /// Resolve the outstanding liveness probe
    pub fn resolve_ping(&self) {
        self.complete(&CorrelationId::Ping, Ok(Value::Null));
    }

    /// Reject the operation named by a server error frame. The payload is a
    /// human-readable string with an embedded JSON fragment identifying the
    /// failed request; an unmatchable fragment is dropped silently.
    pub fn reject_from_error(&self, data: &Value) {
        let Some(text) = data.as_str() else {
            return;
        };
        let Some(id) = extract_failed_id(text) else {
            debug!(error = text, "error frame without parsable fragment dropped");
            return;
        };
        self.complete(&id, Err(Error::rejected(text)));
    }

    /// Reject every pending operation; the connection is permanently gone.
    pub fn reject_all(&self, reason: TerminationReason) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!(
                count = drained.len(),
                %reason,
                "rejecting pending operations on permanent close"
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::closed(reason.clone())));
        }
    }

    fn complete(&self, id: &CorrelationId, outcome: Result<Value>) {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(tx) => {
                // A dropped receiver means the caller cancelled; nothing to do.
                let _ = tx.send(outcome);
            }
            None => debug!(id = %id, "no pending operation for frame"),
        }
    }
}

/// Extract the correlation id from an error string's embedded JSON
/// fragment (first `{` through last `}`).
fn extract_failed_id(text: &str) -> Option<CorrelationId> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let fragment: Value = serde_json::from_str(&text[start..=end]).ok()?;
    if let Some(id) = fragment.get("id").and_then(Value::as_u64) {
        return Some(CorrelationId::Post(id));
    }
    // Subscription echoes and anything else are matched wholesale by their
    // canonical form.
    Some(CorrelationId::Sub(canonical_key(&fragment)))
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
