//! Transport orchestrator
//!
//! The public face of the crate. [`WsTransport`] owns the connection, the
//! correlator, the subscription registry, and the keep-alive scheduler, and
//! wires demultiplexed inbound frames to the right consumer: post responses
//! and acks resolve pending operations, push events fan out to subscription
//! listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionEvent, SocketState, Status};
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::protocol::{
    canonical_key, classify, Method, ERROR_CHANNEL, PONG_CHANNEL, POST_CHANNEL,
    SUBSCRIPTION_RESPONSE_CHANNEL,
};

/// Per-subscription fan-out queue depth; a listener that falls further
/// behind than this observes a lag notice and skips ahead
const BROADCAST_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────
// Subscription Registry
// ─────────────────────────────────────────────────────────────────

/// Acknowledgement progress shared by every listener of one entry
#[derive(Debug, Clone)]
enum AckState {
    Pending,
    Acked,
    Failed(Error),
}

/// One tracked wire subscription with its fan-out state
struct SubEntry {
    channel: String,
    payload: Value,
    /// Distinguishes re-created entries for the same key, so a stale
    /// subscribe driver never tears down its successor
    epoch: u64,
    listeners: usize,
    tx: broadcast::Sender<Value>,
    ack_rx: watch::Receiver<AckState>,
    resub_failed: CancellationToken,
}

struct TransportInner {
    config: TransportConfig,
    conn: Connection,
    correlator: Correlator,
    subs: Mutex<HashMap<String, SubEntry>>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
    next_epoch: AtomicU64,
}

impl TransportInner {
    /// Run one correlated operation under an optional timeout. A fired
    /// timeout cancels only this operation and maps to
    /// [`Error::RequestTimeout`]; the caller's own token still reports
    /// [`Error::Cancelled`].
    async fn execute_with_timeout(
        &self,
        method: Method,
        payload: Option<Value>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        match timeout {
            None => self.correlator.execute(method, payload, cancel).await,
            Some(duration) => {
                let child = cancel.child_token();
                let operation = self.correlator.execute(method, payload, child.clone());
                tokio::pin!(operation);
                tokio::select! {
                    result = &mut operation => result,
                    _ = tokio::time::sleep(duration) => {
                        child.cancel();
                        match operation.await {
                            Err(Error::Cancelled) => Err(Error::RequestTimeout { timeout: duration }),
                            other => other,
                        }
                    }
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Subscription Handle
// ─────────────────────────────────────────────────────────────────

/// Handle to one listener registration on a shared wire subscription.
///
/// Dropping the handle unregisters the listener; [`unsubscribe`]
/// additionally awaits the wire unsubscribe when this was the last
/// listener.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    key: String,
    inner: Arc<TransportInner>,
    rx: broadcast::Receiver<Value>,
    resub_failed: CancellationToken,
    active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Receive the next push event. Returns `None` once the subscription
    /// has been detached (permanent close, or resubscription disabled and
    /// the connection dropped).
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "subscription listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Token cancelled when automatic resubscription after a reconnect
    /// fails for this subscription. Other subscriptions are unaffected.
    pub fn resubscription_failed(&self) -> CancellationToken {
        self.resub_failed.clone()
    }

    /// Unregister this listener. The last listener for a payload removes
    /// the tracked entry and, while the connection is open, sends the wire
    /// unsubscribe.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.active = false;
        let inner = self.inner.clone();
        let key = self.key.clone();
        remove_listener(&inner, &key).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(payload) = drop_listener(&self.inner, &self.key) {
            if self.inner.conn.is_open() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let inner = self.inner.clone();
                    handle.spawn(async move {
                        let _ = inner
                            .execute_with_timeout(
                                Method::Unsubscribe,
                                Some(payload),
                                CancellationToken::new(),
                                inner.config.request_timeout,
                            )
                            .await;
                    });
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// A resilient, multiplexed WebSocket transport.
///
/// Connecting begins immediately on construction; await [`ready`] before
/// the first operation to know the connection is open. All operations are
/// safe to issue earlier — outbound traffic is buffered until open.
///
/// [`ready`]: WsTransport::ready
pub struct WsTransport {
    inner: Arc<TransportInner>,
    dispatcher: JoinHandle<()>,
}

impl WsTransport {
    /// Validate the configuration and start connecting.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let (conn, events) = Connection::spawn(&config)?;
        let inner = Arc::new(TransportInner {
            correlator: Correlator::new(conn.clone()),
            conn,
            config,
            subs: Mutex::new(HashMap::new()),
            keep_alive: Mutex::new(None),
            next_epoch: AtomicU64::new(0),
        });
        let dispatcher = tokio::spawn(dispatch_events(events, inner.clone()));
        Ok(Self { inner, dispatcher })
    }

    /// Current connection status
    pub fn status(&self) -> Status {
        self.inner.conn.status()
    }

    /// Watch channel tracking the connection status
    pub fn status_watch(&self) -> watch::Receiver<Status> {
        self.inner.conn.watch_status()
    }

    /// Send a `post` request and await the correlated response.
    ///
    /// `kind` selects the request family (e.g. `"info"` or `"action"`);
    /// `payload` is the request body. The default request timeout applies
    /// unless disabled in the configuration.
    pub async fn request(
        &self,
        kind: &str,
        payload: Value,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        let body = json!({ "type": kind, "payload": payload });
        self.inner
            .execute_with_timeout(
                Method::Post,
                Some(body),
                cancel.unwrap_or_default(),
                self.inner.config.request_timeout,
            )
            .await
    }

    /// Subscribe to a channel with the given payload.
    ///
    /// Identical payloads share one wire subscription: the first caller
    /// issues the subscribe frame, concurrent callers await the same
    /// in-flight acknowledgement, and later callers attach immediately.
    pub async fn subscribe(
        &self,
        channel: &str,
        payload: Value,
        cancel: Option<CancellationToken>,
    ) -> Result<Subscription> {
        let cancel = cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let key = canonical_key(&payload);

        let (mut ack_rx, rx, resub_failed) = {
            let mut subs = self.inner.subs.lock();
            match subs.get_mut(&key) {
                Some(entry) => {
                    entry.listeners += 1;
                    (
                        entry.ack_rx.clone(),
                        entry.tx.subscribe(),
                        entry.resub_failed.clone(),
                    )
                }
                None => {
                    let (tx, rx) = broadcast::channel(BROADCAST_CAPACITY);
                    let (ack_tx, ack_rx) = watch::channel(AckState::Pending);
                    let resub_failed = CancellationToken::new();
                    let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
                    subs.insert(
                        key.clone(),
                        SubEntry {
                            channel: channel.to_string(),
                            payload: payload.clone(),
                            epoch,
                            listeners: 1,
                            tx,
                            ack_rx: ack_rx.clone(),
                            resub_failed: resub_failed.clone(),
                        },
                    );
                    spawn_subscribe_driver(self.inner.clone(), key.clone(), payload, epoch, ack_tx);
                    (ack_rx, rx, resub_failed)
                }
            }
        };

        match await_ack(&mut ack_rx, &cancel).await {
            Ok(()) => Ok(Subscription {
                key,
                inner: self.inner.clone(),
                rx,
                resub_failed,
                active: true,
            }),
            Err(e) => {
                // Walk back this caller's registration. On ack failure the
                // driver already removed the entry; on cancellation it may
                // survive for other listeners.
                let _ = remove_listener(&self.inner, &key).await;
                Err(e)
            }
        }
    }

    /// Resolve once the connection is open; immediately if it already is.
    /// Fails if the connection terminates first or the token fires.
    pub async fn ready(&self, cancel: Option<CancellationToken>) -> Result<()> {
        let cancel = cancel.unwrap_or_default();
        let mut status = self.inner.conn.watch_status();
        loop {
            {
                let current = status.borrow_and_update().clone();
                if let Some(reason) = current.terminated {
                    return Err(Error::closed(reason));
                }
                if current.state == SocketState::Open {
                    return Ok(());
                }
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(Error::closed(
                            self.inner
                                .conn
                                .termination_reason()
                                .unwrap_or(crate::error::TerminationReason::UserClose),
                        ));
                    }
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Permanently close the connection and resolve once it is closed.
    /// Closing an already-terminated transport resolves immediately.
    pub async fn close(&self, cancel: Option<CancellationToken>) -> Result<()> {
        let cancel = cancel.unwrap_or_default();
        self.inner.conn.close(1000, "client close", true);
        let mut status = self.inner.conn.watch_status();
        loop {
            {
                let current = status.borrow_and_update().clone();
                if current.state == SocketState::Closed {
                    return Ok(());
                }
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        stop_keep_alive(&self.inner);
        self.dispatcher.abort();
        self.inner.conn.close(1000, "transport dropped", true);
    }
}

// ─────────────────────────────────────────────────────────────────
// Event Dispatch
// ─────────────────────────────────────────────────────────────────

/// Single consumer of connection events: classifies inbound frames and
/// routes them, and drives keep-alive and resubscription on lifecycle
/// transitions.
async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    inner: Arc<TransportInner>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Opened { reconnected } => {
                start_keep_alive(&inner);
                if reconnected && inner.config.auto_resubscribe {
                    resubscribe_all(&inner);
                }
            }
            ConnectionEvent::Message(text) => handle_frame(&inner, &text),
            ConnectionEvent::Closed(_) => {
                stop_keep_alive(&inner);
                if !inner.config.auto_resubscribe {
                    detach_all(&inner);
                }
            }
            ConnectionEvent::Terminated { reason } => {
                stop_keep_alive(&inner);
                inner.correlator.reject_all(reason);
                detach_all(&inner);
            }
            ConnectionEvent::Error { message } => {
                warn!(%message, "connection error");
            }
        }
    }
}

fn handle_frame(inner: &Arc<TransportInner>, raw: &str) {
    let Some(frame) = classify(raw) else {
        debug!("unrecognized inbound frame dropped");
        return;
    };
    let (channel, data) = frame.into_parts();
    match channel.as_str() {
        POST_CHANNEL => inner.correlator.resolve_post(&data),
        SUBSCRIPTION_RESPONSE_CHANNEL => inner.correlator.resolve_subscription(&data),
        PONG_CHANNEL => inner.correlator.resolve_ping(),
        ERROR_CHANNEL => inner.correlator.reject_from_error(&data),
        _ => fan_out(inner, &channel, data),
    }
}

/// Deliver one push event to every listener subscribed on its channel
fn fan_out(inner: &Arc<TransportInner>, channel: &str, data: Value) {
    let subs = inner.subs.lock();
    for entry in subs.values() {
        if entry.channel == channel {
            // Fails only when every receiver is gone; nothing to do then.
            let _ = entry.tx.send(data.clone());
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Subscription Plumbing
// ─────────────────────────────────────────────────────────────────

/// Await the shared acknowledgement of a subscription entry
async fn await_ack(ack_rx: &mut watch::Receiver<AckState>, cancel: &CancellationToken) -> Result<()> {
    loop {
        {
            let state = ack_rx.borrow_and_update().clone();
            match state {
                AckState::Acked => return Ok(()),
                AckState::Failed(e) => return Err(e),
                AckState::Pending => {}
            }
        }
        tokio::select! {
            changed = ack_rx.changed() => {
                if changed.is_err() {
                    // Driver gone without a verdict: the transport was
                    // dropped out from under us.
                    return Err(Error::closed(crate::error::TerminationReason::UserClose));
                }
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}

/// Drive the wire subscribe for a freshly created entry and publish the
/// outcome to every waiting listener.
fn spawn_subscribe_driver(
    inner: Arc<TransportInner>,
    key: String,
    payload: Value,
    epoch: u64,
    ack_tx: watch::Sender<AckState>,
) {
    tokio::spawn(async move {
        let result = inner
            .execute_with_timeout(
                Method::Subscribe,
                Some(payload.clone()),
                CancellationToken::new(),
                inner.config.request_timeout,
            )
            .await;
        match result {
            Ok(_ack) => {
                let stale = {
                    let subs = inner.subs.lock();
                    subs.get(&key).map(|entry| entry.epoch) != Some(epoch)
                };
                if stale {
                    // Every listener left while the ack was in flight; the
                    // wire subscription is unwanted.
                    if inner.conn.is_open() {
                        let cleanup = inner.clone();
                        tokio::spawn(async move {
                            let _ = cleanup
                                .execute_with_timeout(
                                    Method::Unsubscribe,
                                    Some(payload),
                                    CancellationToken::new(),
                                    cleanup.config.request_timeout,
                                )
                                .await;
                        });
                    }
                }
                let _ = ack_tx.send(AckState::Acked);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "subscribe failed");
                {
                    let mut subs = inner.subs.lock();
                    if subs.get(&key).map(|entry| entry.epoch) == Some(epoch) {
                        subs.remove(&key);
                    }
                }
                let _ = ack_tx.send(AckState::Failed(e));
            }
        }
    });
}

/// Unregister one listener; returns the payload when the entry emptied
/// and was removed
fn drop_listener(inner: &Arc<TransportInner>, key: &str) -> Option<Value> {
    let mut subs = inner.subs.lock();
    let entry = subs.get_mut(key)?;
    entry.listeners = entry.listeners.saturating_sub(1);
    if entry.listeners == 0 {
        let payload = entry.payload.clone();
        subs.remove(key);
        Some(payload)
    } else {
        None
    }
}

/// Unregister one listener and, when the last one leaves while the
/// connection is open, send the wire unsubscribe
async fn remove_listener(inner: &Arc<TransportInner>, key: &str) -> Result<()> {
    if let Some(payload) = drop_listener(inner, key) {
        if inner.conn.is_open() {
            inner
                .execute_with_timeout(
                    Method::Unsubscribe,
                    Some(payload),
                    CancellationToken::new(),
                    inner.config.request_timeout,
                )
                .await?;
        }
    }
    Ok(())
}

/// Re-issue every tracked subscription after a reconnect. Failures cancel
/// only the affected entry's failure token.
fn resubscribe_all(inner: &Arc<TransportInner>) {
    let entries: Vec<(String, Value, CancellationToken)> = inner
        .subs
        .lock()
        .iter()
        .map(|(key, entry)| {
            (
                key.clone(),
                entry.payload.clone(),
                entry.resub_failed.clone(),
            )
        })
        .collect();
    if entries.is_empty() {
        return;
    }
    info!(count = entries.len(), "resubscribing after reconnect");
    for (key, payload, resub_failed) in entries {
        let task = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = task
                .execute_with_timeout(
                    Method::Subscribe,
                    Some(payload),
                    CancellationToken::new(),
                    task.config.request_timeout,
                )
                .await
            {
                warn!(key = %key, error = %e, "resubscription failed");
                resub_failed.cancel();
            }
        });
    }
}

/// Drop every tracked entry: listeners observe the end of their streams
/// and resubscription dependents are signalled
fn detach_all(inner: &Arc<TransportInner>) {
    let drained: Vec<SubEntry> = {
        let mut subs = inner.subs.lock();
        subs.drain().map(|(_, entry)| entry).collect()
    };
    if drained.is_empty() {
        return;
    }
    debug!(count = drained.len(), "detaching subscriptions");
    for entry in drained {
        entry.resub_failed.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────
// Keep-Alive
// ─────────────────────────────────────────────────────────────────

/// (Re)start the keep-alive task. It sleeps until the next check is due;
/// if the connection has been idle for a full interval it sends a ping
/// (failures ignored), otherwise it sleeps out the remaining idle time.
fn start_keep_alive(inner: &Arc<TransportInner>) {
    let Some(keep_alive) = inner.config.keep_alive else {
        return;
    };
    let mut slot = inner.keep_alive.lock();
    if let Some(task) = slot.take() {
        task.abort();
    }
    let task = inner.clone();
    *slot = Some(tokio::spawn(async move {
        let interval = keep_alive.interval;
        let mut wait = interval;
        loop {
            tokio::time::sleep(wait).await;
            let idle = task.correlator.last_send().elapsed();
            if idle >= interval {
                if let Err(e) = task
                    .execute_with_timeout(
                        Method::Ping,
                        None,
                        CancellationToken::new(),
                        keep_alive.timeout,
                    )
                    .await
                {
                    debug!(error = %e, "keep-alive ping failed");
                }
                wait = interval;
            } else {
                wait = interval - idle;
            }
        }
    }));
}

fn stop_keep_alive(inner: &Arc<TransportInner>) {
    if let Some(task) = inner.keep_alive.lock().take() {
        task.abort();
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
