//! Self-healing WebSocket connection
//!
//! Provides a connection wrapper with:
//! - Automatic reconnection with configurable delay and retry limit
//! - Outbound buffering while disconnected, replayed FIFO on open
//! - Connect timeout enforcement
//! - A stable handle whose status watch and event stream survive every
//!   underlying socket swap, so observers never re-attach

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

use crate::config::{BufferPolicy, ReconnectConfig, ReconnectDelay, TransportConfig};
use crate::error::{Error, Result, TerminationReason};

/// Close code reported when the connect timeout elapses
pub const CONNECT_TIMEOUT_CLOSE_CODE: u16 = 3008;

/// Close code reported for abnormal closure (no close frame received)
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Socket lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Connecting or waiting between reconnect attempts
    Connecting,
    /// Open for traffic
    Open,
    /// Close initiated, not yet closed
    Closing,
    /// Closed; `terminated` on [`Status`] says whether permanently
    Closed,
}

/// Observable connection status
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// Current socket state
    pub state: SocketState,

    /// Set once the connection is permanently closed
    pub terminated: Option<TerminationReason>,
}

/// A close observed on the underlying socket, passed to the reconnect
/// predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// WebSocket close code
    pub code: u16,

    /// Human-readable close reason (may be empty)
    pub reason: String,
}

/// Events emitted by the connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The socket reached the open state
    Opened {
        /// `false` on the first connect, `true` on every reconnect
        reconnected: bool,
    },

    /// One inbound text frame
    Message(String),

    /// Transient close; a reconnect will be attempted
    Closed(CloseEvent),

    /// Permanent close; no further reconnects
    Terminated { reason: TerminationReason },

    /// Non-fatal diagnostic from the reconnect machinery
    Error { message: String },
}

/// Commands from the handle to the connection task
enum Command {
    Send(String),
    Close {
        code: u16,
        reason: String,
        permanent: bool,
    },
}

// ─────────────────────────────────────────────────────────────────
// Connection Handle
// ─────────────────────────────────────────────────────────────────

/// Handle to a self-healing connection.
///
/// Cloning is cheap; all clones address the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<Status>,
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    buffer: Mutex<VecDeque<String>>,
    buffer_policy: BufferPolicy,
    reconnect_attempts: AtomicU32,
}

impl ConnectionShared {
    fn buffer_message(&self, data: String) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if let BufferPolicy::Bounded(capacity) = self.buffer_policy {
            if buffer.len() >= capacity {
                return Err(Error::BufferFull { capacity });
            }
        }
        buffer.push_back(data);
        Ok(())
    }
}

impl Connection {
    /// Validate the configuration and spawn the connection task.
    ///
    /// Returns the handle together with the single-consumer event stream;
    /// the stream outlives every underlying socket.
    pub fn spawn(
        config: &TransportConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            state: SocketState::Connecting,
            terminated: None,
        });
        let shared = Arc::new(ConnectionShared {
            buffer: Mutex::new(VecDeque::new()),
            buffer_policy: config.buffer,
            reconnect_attempts: AtomicU32::new(0),
        });

        let task = ConnectionTask {
            url: config.url.clone(),
            reconnect: config.reconnect.clone(),
            connect_timeout: config.connect_timeout,
            cmd_rx,
            event_tx,
            status_tx,
            shared: shared.clone(),
        };
        tokio::spawn(task.run());

        Ok((
            Self {
                cmd_tx,
                status_rx,
                shared,
            },
            event_rx,
        ))
    }

    /// Current status snapshot
    pub fn status(&self) -> Status {
        self.status_rx.borrow().clone()
    }

    /// Watch channel tracking the status across socket swaps
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status_rx.clone()
    }

    /// Termination reason, once permanently closed
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.status_rx.borrow().terminated.clone()
    }

    /// Reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Number of messages currently buffered while disconnected
    pub fn buffered(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    /// Whether the socket is currently open
    pub fn is_open(&self) -> bool {
        self.status().state == SocketState::Open
    }

    /// Send one text frame. Buffers while disconnected; fails once the
    /// connection is permanently closed or the buffer is full.
    pub fn send(&self, data: String) -> Result<()> {
        let status = self.status_rx.borrow().clone();
        if let Some(reason) = status.terminated {
            return Err(Error::closed(reason));
        }
        if status.state == SocketState::Open {
            self.cmd_tx
                .send(Command::Send(data))
                .map_err(|_| Error::closed(TerminationReason::UserClose))
        } else {
            self.shared.buffer_message(data)
        }
    }

    /// Close the connection. A permanent close terminates the wrapper; a
    /// transient close feeds the normal reconnect logic.
    pub fn close(&self, code: u16, reason: impl Into<String>, permanent: bool) {
        // Ignore a dead task: the connection is already closed.
        let _ = self.cmd_tx.send(Command::Close {
            code,
            reason: reason.into(),
            permanent,
        });
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Task
// ─────────────────────────────────────────────────────────────────

/// Outcome of driving one live socket
enum Drive {
    Transient(CloseEvent),
    Terminate(TerminationReason),
}

/// Outcome of one connect attempt
enum ConnectFailure {
    Transient(CloseEvent),
    Fatal(String),
}

struct ConnectionTask {
    url: String,
    reconnect: ReconnectConfig,
    connect_timeout: Option<Duration>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    status_tx: watch::Sender<Status>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut expo = self.exponential_backoff();
        let mut reconnected = false;

        loop {
            self.set_state(SocketState::Connecting);
            debug!(url = %self.url, "connecting");

            let close_event = match self.connect_once().await {
                Ok(socket) => {
                    if let Some(backoff) = expo.as_mut() {
                        backoff.reset();
                    }
                    self.shared.reconnect_attempts.store(0, Ordering::Relaxed);
                    self.set_state(SocketState::Open);
                    info!(url = %self.url, reconnected, "connection open");
                    self.emit(ConnectionEvent::Opened { reconnected });
                    reconnected = true;

                    match self.drive(socket).await {
                        Drive::Transient(event) => event,
                        Drive::Terminate(reason) => {
                            self.terminate(reason);
                            return;
                        }
                    }
                }
                Err(ConnectFailure::Fatal(message)) => {
                    self.emit(ConnectionEvent::Error {
                        message: message.clone(),
                    });
                    self.terminate(TerminationReason::UnknownError(message));
                    return;
                }
                Err(ConnectFailure::Transient(event)) => event,
            };

            debug!(code = close_event.code, reason = %close_event.reason, "connection closed");
            self.emit(ConnectionEvent::Closed(close_event.clone()));

            let attempt = self.shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt > self.reconnect.max_attempts {
                self.terminate(TerminationReason::RetryLimitReached);
                return;
            }
            if let Some(predicate) = &self.reconnect.should_reconnect {
                if !predicate(&close_event) {
                    self.terminate(TerminationReason::StoppedByCaller);
                    return;
                }
            }

            let delay = self.delay_for(attempt, &mut expo);
            info!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            if !self.wait_before_reconnect(delay).await {
                return;
            }
        }
    }

    /// One connect attempt under the configured timeout
    async fn connect_once(&mut self) -> std::result::Result<WsStream, ConnectFailure> {
        let connect = connect_async(self.url.as_str());
        let result = match self.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "connect timed out");
                    return Err(ConnectFailure::Transient(CloseEvent {
                        code: CONNECT_TIMEOUT_CLOSE_CODE,
                        reason: "connect timeout".to_string(),
                    }));
                }
            },
            None => connect.await,
        };

        match result {
            Ok((socket, _response)) => Ok(socket),
            // A URL the handshake itself rejects will never succeed; treat
            // it as an unrecoverable machinery error rather than retrying.
            Err(WsError::Url(e)) => Err(ConnectFailure::Fatal(e.to_string())),
            Err(e) => {
                warn!(error = %e, "connect failed");
                Err(ConnectFailure::Transient(CloseEvent {
                    code: ABNORMAL_CLOSE_CODE,
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Drive one live socket: replay the buffer, then shuttle commands and
    /// inbound frames until the socket closes.
    async fn drive(&mut self, socket: WsStream) -> Drive {
        let (mut sink, mut stream) = socket.split();

        // FIFO replay of everything queued while disconnected. A failed
        // replay puts the message back at the front so nothing is lost or
        // reordered across the next reconnect.
        loop {
            let queued = self.shared.buffer.lock().pop_front();
            let Some(message) = queued else { break };
            if let Err(e) = sink.send(WsMessage::Text(message.clone())).await {
                self.shared.buffer.lock().push_front(message);
                return Drive::Transient(close_event_from(&e));
            }
        }

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Send(message)) => {
                        if let Err(e) = sink.send(WsMessage::Text(message.clone())).await {
                            self.shared.buffer.lock().push_front(message);
                            return Drive::Transient(close_event_from(&e));
                        }
                    }
                    Some(Command::Close { code, reason, permanent }) => {
                        self.set_state(SocketState::Closing);
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(WsMessage::Close(Some(frame))).await;
                        if permanent {
                            return Drive::Terminate(TerminationReason::UserClose);
                        }
                        return Drive::Transient(CloseEvent { code, reason });
                    }
                    None => {
                        // Every handle dropped; nobody is left to observe.
                        return Drive::Terminate(TerminationReason::UserClose);
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.emit(ConnectionEvent::Message(text));
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.emit(ConnectionEvent::Message(text)),
                        Err(_) => debug!("dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        let event = frame
                            .map(|f| CloseEvent {
                                code: f.code.into(),
                                reason: f.reason.into_owned(),
                            })
                            .unwrap_or_else(|| CloseEvent {
                                code: ABNORMAL_CLOSE_CODE,
                                reason: String::new(),
                            });
                        return Drive::Transient(event);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        return Drive::Transient(close_event_from(&e));
                    }
                    None => {
                        return Drive::Transient(CloseEvent {
                            code: ABNORMAL_CLOSE_CODE,
                            reason: "stream ended".to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Wait out the reconnect delay, still honoring commands. Returns
    /// `false` if the connection terminated during the wait.
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Send(message)) => {
                        // A send raced against the close; queue it for replay.
                        if let Err(e) = self.shared.buffer_message(message) {
                            debug!(error = %e, "dropping send raced against close");
                        }
                    }
                    Some(Command::Close { permanent: true, .. }) => {
                        self.terminate(TerminationReason::UserClose);
                        return false;
                    }
                    Some(Command::Close { .. }) => {}
                    None => {
                        self.terminate(TerminationReason::UserClose);
                        return false;
                    }
                },
            }
        }
    }

    fn delay_for(&self, attempt: u32, expo: &mut Option<ExponentialBackoff>) -> Duration {
        match &self.reconnect.delay {
            ReconnectDelay::Fixed(delay) => *delay,
            ReconnectDelay::Exponential { max, .. } => expo
                .as_mut()
                .and_then(|backoff| backoff.next_backoff())
                .unwrap_or(*max),
            ReconnectDelay::Custom(f) => f(attempt),
        }
    }

    fn exponential_backoff(&self) -> Option<ExponentialBackoff> {
        match self.reconnect.delay {
            ReconnectDelay::Exponential { initial, max } => Some(ExponentialBackoff {
                initial_interval: initial,
                max_interval: max,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            }),
            _ => None,
        }
    }

    fn set_state(&self, state: SocketState) {
        self.status_tx.send_modify(|status| status.state = state);
    }

    fn terminate(&mut self, reason: TerminationReason) {
        info!(%reason, "connection terminated");
        self.shared.buffer.lock().clear();
        self.status_tx.send_modify(|status| {
            status.state = SocketState::Closed;
            status.terminated = Some(reason.clone());
        });
        self.emit(ConnectionEvent::Terminated { reason });
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn close_event_from(error: &WsError) -> CloseEvent {
    CloseEvent {
        code: ABNORMAL_CLOSE_CODE,
        reason: error.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
