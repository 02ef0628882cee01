//! Integration tests for the transport
//!
//! Tests the full flow against an in-process WebSocket server:
//! connect → post/subscribe → push fan-out → reconnect → close

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

use marketwire::{
    Error, ReconnectDelay, TerminationReason, TransportConfig, WsTransport,
    EXPLORER_BLOCK_CHANNEL,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .try_init();
}

// ─────────────────────────────────────────────────────────────────
// Mock Server
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ServerOptions {
    /// Acknowledge subscribe/unsubscribe frames
    ack_subscriptions: bool,
    /// Respond to post frames
    respond_posts: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ack_subscriptions: true,
            respond_posts: true,
        }
    }
}

#[derive(Clone)]
enum Control {
    /// Send a raw text frame to every connected client
    Push(String),
    /// Close every connection (clients will reconnect)
    Kick,
}

/// Scripted WebSocket server for testing
struct MockServer {
    addr: SocketAddr,
    control: broadcast::Sender<Control>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    frames: Arc<RwLock<Vec<Value>>>,
}

impl MockServer {
    async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    async fn start_with(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control, _) = broadcast::channel::<Control>(16);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let frames = Arc::new(RwLock::new(Vec::new()));

        let accept_control = control.clone();
        let accept_frames = frames.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        if let Ok((stream, _)) = accepted {
                            let frames = accept_frames.clone();
                            let control = accept_control.subscribe();
                            let options = options.clone();
                            tokio::spawn(async move {
                                if let Ok(ws) = accept_async(stream).await {
                                    handle_connection(ws, frames, control, options).await;
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            control,
            shutdown_tx: Some(shutdown_tx),
            frames,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every frame received so far, parsed
    fn frames(&self) -> Vec<Value> {
        self.frames.read().clone()
    }

    /// Received frames with the given method
    fn frames_with_method(&self, method: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.get("method").and_then(Value::as_str) == Some(method))
            .collect()
    }

    /// Push a `{channel, data}` frame to every connected client
    fn push(&self, channel: &str, data: Value) {
        self.push_raw(json!({ "channel": channel, "data": data }).to_string());
    }

    /// Push a raw text frame to every connected client
    fn push_raw(&self, raw: String) {
        let _ = self.control.send(Control::Push(raw));
    }

    /// Drop every connection; clients are expected to reconnect
    fn kick(&self) {
        let _ = self.control.send(Control::Kick);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

/// Handle one client connection: log frames, script responses, obey control
async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    frames: Arc<RwLock<Vec<Value>>>,
    mut control: broadcast::Receiver<Control>,
    options: ServerOptions,
) {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    frames.write().push(parsed.clone());

                    match parsed.get("method").and_then(Value::as_str) {
                        Some("post") if options.respond_posts => {
                            let response = json!({
                                "channel": "post",
                                "data": {
                                    "id": parsed["id"],
                                    "response": {
                                        "type": "info",
                                        "payload": {
                                            "type": parsed["request"]["type"],
                                            "data": "ok"
                                        }
                                    }
                                }
                            });
                            let _ = write.send(WsMessage::Text(response.to_string())).await;
                        }
                        Some("subscribe") | Some("unsubscribe")
                            if options.ack_subscriptions =>
                        {
                            let ack = json!({
                                "channel": "subscriptionResponse",
                                "data": parsed
                            });
                            let _ = write.send(WsMessage::Text(ack.to_string())).await;
                        }
                        Some("ping") => {
                            let pong = json!({ "channel": "pong", "data": null });
                            let _ = write.send(WsMessage::Text(pong.to_string())).await;
                        }
                        _ => {}
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            ctrl = control.recv() => match ctrl {
                Ok(Control::Push(raw)) => {
                    let _ = write.send(WsMessage::Text(raw)).await;
                }
                Ok(Control::Kick) => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn test_config(url: &str) -> TransportConfig {
    TransportConfig::new(url)
        .reconnect_delay(ReconnectDelay::Fixed(Duration::from_millis(25)))
        .max_reconnect_attempts(20)
        .connect_timeout(Some(Duration::from_secs(2)))
        .request_timeout(Some(Duration::from_secs(2)))
        .keep_alive(None)
}

// ─────────────────────────────────────────────────────────────────
// Request/Response
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_post_buffered_while_connecting_resolves_after_flush() {
    init_logging();
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();

    // Issued before the socket can possibly be open: the frame is buffered,
    // flushed on open, answered by the server, and resolved here.
    let result = transport
        .request("info", json!({"type": "meta"}), None)
        .await
        .unwrap();
    assert_eq!(result, json!("ok"));

    let posts = server.frames_with_method("post");
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["id"], 1);
    assert_eq!(posts[0]["request"]["type"], "info");
}

#[tokio::test]
async fn test_buffered_messages_flush_in_order() {
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();

    // Both issued while still connecting; the buffer must drain FIFO.
    let (first, second) = tokio::join!(
        transport.request("info", json!({"type": "meta"}), None),
        transport.request("info", json!({"type": "allMids"}), None),
    );
    first.unwrap();
    second.unwrap();

    let posts = server.frames_with_method("post");
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0]["id"], 1);
    assert_eq!(posts[0]["request"]["type"], "meta");
    assert_eq!(posts[1]["id"], 2);
    assert_eq!(posts[1]["request"]["type"], "allMids");
}

#[tokio::test]
async fn test_post_after_ready() {
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();

    let result = transport
        .request("info", json!({"type": "allMids"}), None)
        .await
        .unwrap();
    assert_eq!(result, json!("ok"));
}

#[tokio::test]
async fn test_post_ids_survive_reconnect() {
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();

    transport
        .request("info", json!({"type": "meta"}), None)
        .await
        .unwrap();

    server.kick();
    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.ready(None).await.unwrap();

    transport
        .request("info", json!({"type": "meta"}), None)
        .await
        .unwrap();

    // The id counter is never reset across reconnects.
    let posts = server.frames_with_method("post");
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0]["id"], 1);
    assert_eq!(posts[1]["id"], 2);
}

#[tokio::test]
async fn test_error_frame_rejects_request() {
    let server = MockServer::start_with(ServerOptions {
        respond_posts: false,
        ..Default::default()
    })
    .await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();

    let request = tokio::spawn({
        let transport = Arc::new(transport);
        let handle = transport.clone();
        async move { handle.request("info", json!({"type": "meta"}), None).await }
    });

    // Let the post frame reach the server, then reject id 1.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.push(
        "error",
        json!(r#"Something went wrong: {"id":1,"request":{"type":"meta"}}"#),
    );

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ServerRejected { .. }));
}

// ─────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_identical_subscribes_share_one_wire_frame() {
    init_logging();
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();

    let payload = json!({"type": "trades", "coin": "BTC"});
    let (first, second) = tokio::join!(
        transport.subscribe("trades", payload.clone(), None),
        transport.subscribe("trades", payload.clone(), None),
    );
    let mut first = first.unwrap();
    let mut second = second.unwrap();

    assert_eq!(server.frames_with_method("subscribe").len(), 1);

    // One push fans out to both listeners.
    server.push("trades", json!([{"px": "50000", "sz": "0.1"}]));
    assert_eq!(first.recv().await.unwrap(), json!([{"px": "50000", "sz": "0.1"}]));
    assert_eq!(second.recv().await.unwrap(), json!([{"px": "50000", "sz": "0.1"}]));
}

#[tokio::test]
async fn test_unsubscribe_sent_only_for_last_listener() {
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();

    let payload = json!({"type": "l2Book", "coin": "ETH"});
    let first = transport
        .subscribe("l2Book", payload.clone(), None)
        .await
        .unwrap();
    let second = transport
        .subscribe("l2Book", payload.clone(), None)
        .await
        .unwrap();

    first.unsubscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.frames_with_method("unsubscribe").is_empty());

    second.unsubscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let unsubs = server.frames_with_method("unsubscribe");
    assert_eq!(unsubs.len(), 1);
    assert_eq!(unsubs[0]["subscription"]["coin"], "ETH");
}

#[tokio::test]
async fn test_subscribe_timeout_removes_entry() {
    let server = MockServer::start_with(ServerOptions {
        ack_subscriptions: false,
        ..Default::default()
    })
    .await;
    let config = test_config(&server.ws_url()).request_timeout(Some(Duration::from_millis(150)));
    let transport = WsTransport::new(config).unwrap();
    transport.ready(None).await.unwrap();

    let payload = json!({"type": "trades", "coin": "BTC"});
    let err = transport
        .subscribe("trades", payload.clone(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestTimeout { .. }));

    // The entry is gone: a retry issues a fresh wire subscribe instead of
    // attaching to a dead one.
    let _ = transport.subscribe("trades", payload, None).await;
    assert_eq!(server.frames_with_method("subscribe").len(), 2);
}

#[tokio::test]
async fn test_auto_resubscribe_after_reconnect() {
    init_logging();
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();

    let mut sub = transport
        .subscribe("l2Book", json!({"type": "l2Book", "coin": "ETH"}), None)
        .await
        .unwrap();
    assert_eq!(server.frames_with_method("subscribe").len(), 1);

    server.kick();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Exactly one subscribe was re-issued, without caller action.
    let subscribes = server.frames_with_method("subscribe");
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[1]["subscription"]["coin"], "ETH");

    // The original handle keeps receiving after the reconnect.
    server.push("l2Book", json!({"levels": []}));
    assert_eq!(sub.recv().await.unwrap(), json!({"levels": []}));
}

#[tokio::test]
async fn test_no_resubscribe_when_disabled() {
    let server = MockServer::start().await;
    let config = test_config(&server.ws_url()).auto_resubscribe(false);
    let transport = WsTransport::new(config).unwrap();
    transport.ready(None).await.unwrap();

    let mut sub = transport
        .subscribe("trades", json!({"type": "trades", "coin": "BTC"}), None)
        .await
        .unwrap();

    server.kick();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(server.frames_with_method("subscribe").len(), 1);
    // The listener observes the end of its stream.
    assert_eq!(sub.recv().await, None);
}

#[tokio::test]
async fn test_explorer_feed_reaches_subscribers() {
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();

    let mut blocks = transport
        .subscribe(
            EXPLORER_BLOCK_CHANNEL,
            json!({"type": "explorerBlock"}),
            None,
        )
        .await
        .unwrap();

    // The feed arrives as a bare array with no channel envelope.
    server.push_raw(
        json!([{
            "height": 123,
            "blockTime": 1_700_000_000_000_u64,
            "hash": "0xabc",
            "proposer": "0xdef",
            "numTxs": 7
        }])
        .to_string(),
    );

    let event = blocks.recv().await.unwrap();
    assert_eq!(event[0]["height"], 123);
}

// ─────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_permanent_close_rejects_all_pending() {
    init_logging();
    let server = MockServer::start_with(ServerOptions {
        ack_subscriptions: false,
        respond_posts: false,
    })
    .await;
    let config = test_config(&server.ws_url()).request_timeout(None);
    let transport = Arc::new(WsTransport::new(config).unwrap());
    transport.ready(None).await.unwrap();

    let post = tokio::spawn({
        let transport = transport.clone();
        async move { transport.request("info", json!({"type": "meta"}), None).await }
    });
    let subscribe = tokio::spawn({
        let transport = transport.clone();
        async move {
            transport
                .subscribe("trades", json!({"type": "trades", "coin": "BTC"}), None)
                .await
                .map(|_| ())
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.close(None).await.unwrap();

    let post_err = post.await.unwrap().unwrap_err();
    assert!(matches!(
        post_err,
        Error::ConnectionClosed {
            reason: TerminationReason::UserClose
        }
    ));
    let sub_err = subscribe.await.unwrap().unwrap_err();
    assert!(matches!(
        sub_err,
        Error::ConnectionClosed {
            reason: TerminationReason::UserClose
        }
    ));
}

#[tokio::test]
async fn test_keep_alive_ping_sent_when_idle() {
    let server = MockServer::start().await;
    let config = test_config(&server.ws_url()).keep_alive(Some(marketwire::KeepAliveConfig {
        interval: Duration::from_millis(100),
        timeout: Some(Duration::from_secs(1)),
    }));
    let transport = WsTransport::new(config).unwrap();
    transport.ready(None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!server.frames_with_method("ping").is_empty());

    // Probes stop once the connection is closed.
    transport.close(None).await.unwrap();
    let pings_at_close = server.frames_with_method("ping").len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.frames_with_method("ping").len(), pings_at_close);
}

#[tokio::test]
async fn test_ready_resolves_immediately_when_open() {
    let server = MockServer::start().await;
    let transport = WsTransport::new(test_config(&server.ws_url())).unwrap();
    transport.ready(None).await.unwrap();
    // Already open: resolves without waiting.
    transport.ready(None).await.unwrap();
}
