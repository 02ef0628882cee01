//! Wire frame shapes and inbound classification
//!
//! Outbound frames are JSON objects tagged by a `method` field. Inbound
//! traffic is irregular: most frames carry a `{channel, data}` envelope, but
//! block-summary and transaction-detail feeds arrive as bare arrays with no
//! envelope at all. [`classify`] hides that irregularity behind a closed
//! enum so the rest of the transport dispatches on frame kind alone.

use serde_json::{json, Value};

use super::canonical::canonical_key;

// ─────────────────────────────────────────────────────────────────
// Channel Names
// ─────────────────────────────────────────────────────────────────

/// Channel carrying responses to `post` requests
pub const POST_CHANNEL: &str = "post";

/// Channel carrying subscribe/unsubscribe acknowledgements
pub const SUBSCRIPTION_RESPONSE_CHANNEL: &str = "subscriptionResponse";

/// Channel carrying liveness probe replies
pub const PONG_CHANNEL: &str = "pong";

/// Channel carrying server error frames
pub const ERROR_CHANNEL: &str = "error";

/// Reserved channel for the enveloped-less block-summary feed
pub const EXPLORER_BLOCK_CHANNEL: &str = "_explorerBlock";

/// Reserved channel for the enveloped-less transaction-detail feed
pub const EXPLORER_TXS_CHANNEL: &str = "_explorerTxs";

// ─────────────────────────────────────────────────────────────────
// Outbound Frames
// ─────────────────────────────────────────────────────────────────

/// Operation kinds multiplexed over the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Post,
    Subscribe,
    Unsubscribe,
    Ping,
}

impl Method {
    /// The wire name of this method
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Post => "post",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Ping => "ping",
        }
    }
}

/// Build a `post` request frame
pub fn post_frame(id: u64, request: &Value) -> String {
    json!({ "method": "post", "id": id, "request": request }).to_string()
}

/// Build a `subscribe`/`unsubscribe` request body. Returned as a [`Value`]
/// because its canonical form doubles as the correlation id.
pub fn subscription_body(method: Method, subscription: &Value) -> Value {
    json!({ "method": method.as_str(), "subscription": subscription })
}

/// Canonical correlation id for a `subscribe`/`unsubscribe` body. The
/// acknowledgement echoes the same body, so both sides derive the same id.
pub fn subscription_id(body: &Value) -> String {
    canonical_key(body)
}

/// Build a `ping` frame
pub fn ping_frame() -> String {
    json!({ "method": "ping" }).to_string()
}

// ─────────────────────────────────────────────────────────────────
// Inbound Classification
// ─────────────────────────────────────────────────────────────────

/// One classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A `{channel, data}` envelope
    Channel { channel: String, data: Value },

    /// A bare array of block summaries
    BlockSummaries(Value),

    /// A bare array of transaction details
    TxDetails(Value),
}

impl InboundFrame {
    /// The channel this frame is republished under
    pub fn channel(&self) -> &str {
        match self {
            InboundFrame::Channel { channel, .. } => channel,
            InboundFrame::BlockSummaries(_) => EXPLORER_BLOCK_CHANNEL,
            InboundFrame::TxDetails(_) => EXPLORER_TXS_CHANNEL,
        }
    }

    /// Split into `(channel, payload)` for dispatch
    pub fn into_parts(self) -> (String, Value) {
        match self {
            InboundFrame::Channel { channel, data } => (channel, data),
            InboundFrame::BlockSummaries(data) => (EXPLORER_BLOCK_CHANNEL.to_string(), data),
            InboundFrame::TxDetails(data) => (EXPLORER_TXS_CHANNEL.to_string(), data),
        }
    }
}

/// Classify one raw inbound text frame.
///
/// Returns `None` for anything malformed or unrecognized; a bad frame must
/// never take down the connection.
pub fn classify(raw: &str) -> Option<InboundFrame> {
    let value: Value = serde_json::from_str(raw).ok()?;

    if let Value::Object(map) = &value {
        let channel = map.get("channel")?.as_str()?;
        let data = map.get("data")?;
        return Some(InboundFrame::Channel {
            channel: channel.to_string(),
            data: data.clone(),
        });
    }

    if let Value::Array(items) = &value {
        let first = items.first()?;
        if is_block_summary(first) {
            return Some(InboundFrame::BlockSummaries(value));
        }
        if is_tx_detail(first) {
            return Some(InboundFrame::TxDetails(value));
        }
    }

    None
}

/// Structural check for the block-summary shape
fn is_block_summary(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("height").is_some_and(Value::is_number)
        && obj.get("blockTime").is_some_and(Value::is_number)
        && obj.get("hash").is_some_and(Value::is_string)
        && obj.get("proposer").is_some_and(Value::is_string)
        && obj.get("numTxs").is_some_and(Value::is_number)
}

/// Structural check for the transaction-detail shape
fn is_tx_detail(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("action").is_some_and(Value::is_object)
        && obj.get("block").is_some_and(Value::is_number)
        && obj
            .get("error")
            .is_some_and(|e| e.is_string() || e.is_null())
        && obj.get("hash").is_some_and(Value::is_string)
        && obj.get("time").is_some_and(Value::is_number)
        && obj.get("user").is_some_and(Value::is_string)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_frame_shape() {
        let frame = post_frame(7, &json!({"type": "info", "payload": {"type": "meta"}}));
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["method"], "post");
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["request"]["type"], "info");
    }

    #[test]
    fn test_subscription_body_and_id() {
        let payload = json!({"type": "trades", "coin": "BTC"});
        let body = subscription_body(Method::Subscribe, &payload);
        assert_eq!(body["method"], "subscribe");
        assert_eq!(body["subscription"]["coin"], "BTC");

        // Subscribe and unsubscribe for the same payload must not share an id.
        let unsub = subscription_body(Method::Unsubscribe, &payload);
        assert_ne!(subscription_id(&body), subscription_id(&unsub));
    }

    #[test]
    fn test_ping_frame_shape() {
        assert_eq!(ping_frame(), r#"{"method":"ping"}"#);
    }

    #[test]
    fn test_classify_channel_envelope() {
        let frame = classify(r#"{"channel":"trades","data":[{"px":"1.0"}]}"#).unwrap();
        assert_eq!(frame.channel(), "trades");
        let (channel, data) = frame.into_parts();
        assert_eq!(channel, "trades");
        assert!(data.is_array());
    }

    #[test]
    fn test_classify_requires_data_field() {
        assert_eq!(classify(r#"{"channel":"pong"}"#), None);
        assert!(classify(r#"{"channel":"pong","data":null}"#).is_some());
    }

    #[test]
    fn test_classify_block_summaries() {
        let raw = r#"[{"height":123,"blockTime":1700000000000,"hash":"0xabc","proposer":"0xdef","numTxs":42}]"#;
        let frame = classify(raw).unwrap();
        assert_eq!(frame.channel(), EXPLORER_BLOCK_CHANNEL);
        assert!(matches!(frame, InboundFrame::BlockSummaries(_)));
    }

    #[test]
    fn test_classify_tx_details() {
        let raw = r#"[{"action":{"type":"order"},"block":5,"error":null,"hash":"0x1","time":1700000000000,"user":"0x2"}]"#;
        let frame = classify(raw).unwrap();
        assert_eq!(frame.channel(), EXPLORER_TXS_CHANNEL);

        let with_error = r#"[{"action":{},"block":5,"error":"rejected","hash":"0x1","time":1,"user":"0x2"}]"#;
        assert!(matches!(
            classify(with_error),
            Some(InboundFrame::TxDetails(_))
        ));
    }

    #[test]
    fn test_classify_drops_unrecognized_frames() {
        assert_eq!(classify("not json"), None);
        assert_eq!(classify("[]"), None);
        assert_eq!(classify("42"), None);
        assert_eq!(classify(r#"{"data":"no channel"}"#), None);
        // Array whose first element matches neither sniffed shape
        assert_eq!(classify(r#"[{"height":"tall"}]"#), None);
        // error must be string or null on a tx detail
        assert_eq!(
            classify(r#"[{"action":{},"block":5,"error":7,"hash":"0x1","time":1,"user":"0x2"}]"#),
            None
        );
        // missing error field fails the structural check
        assert_eq!(
            classify(r#"[{"action":{},"block":5,"hash":"0x1","time":1,"user":"0x2"}]"#),
            None
        );
    }
}
