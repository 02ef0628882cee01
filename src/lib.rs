//! marketwire - resilient multiplexed WebSocket transport
//!
//! Many independent callers share one persistent WebSocket connection to a
//! remote service while seeing plain request/response and
//! publish/subscribe semantics:
//!
//! - **Connection wrapper**: reconnects with backoff after drops, buffers
//!   outbound traffic while disconnected, and keeps its observer surface
//!   stable across socket swaps
//! - **Frame demultiplexer**: classifies interleaved inbound traffic
//!   (post responses, subscription acks, pushes, liveness replies, errors)
//! - **Request correlator**: matches inbound responses to the outbound
//!   operation that caused them, with cooperative cancellation
//! - **Transport orchestrator**: de-duplicated subscriptions with fan-out,
//!   automatic resubscription after reconnect, and idle-aware keep-alive
//!
//! # Example
//!
//! ```ignore
//! use marketwire::{TransportConfig, WsTransport};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> marketwire::Result<()> {
//!     let transport = WsTransport::new(TransportConfig::new("wss://api.example.com/ws"))?;
//!     transport.ready(None).await?;
//!
//!     let meta = transport.request("info", json!({"type": "meta"}), None).await?;
//!     println!("meta: {meta}");
//!
//!     let mut trades = transport
//!         .subscribe("trades", json!({"type": "trades", "coin": "BTC"}), None)
//!         .await?;
//!     while let Some(event) = trades.recv().await {
//!         println!("trade: {event}");
//!     }
//!
//!     transport.close(None).await
//! }
//! ```

mod config;
mod connection;
mod correlator;
mod error;
mod protocol;
mod transport;

pub use config::{
    BufferPolicy, KeepAliveConfig, ReconnectConfig, ReconnectDelay, ReconnectPredicate,
    TransportConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_KEEP_ALIVE_TIMEOUT, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT,
};
pub use connection::{
    CloseEvent, Connection, ConnectionEvent, SocketState, Status, ABNORMAL_CLOSE_CODE,
    CONNECT_TIMEOUT_CLOSE_CODE,
};
pub use error::{Error, Result, TerminationReason};
pub use protocol::{
    canonical_key, classify, InboundFrame, Method, ERROR_CHANNEL, EXPLORER_BLOCK_CHANNEL,
    EXPLORER_TXS_CHANNEL, PONG_CHANNEL, POST_CHANNEL, SUBSCRIPTION_RESPONSE_CHANNEL,
};
pub use transport::{Subscription, WsTransport};
