//! Canonical key derivation
//!
//! A canonical key is a deterministic string form of a JSON payload:
//! object keys sorted recursively, hex-style identifier tokens lowercased,
//! compact serialization. The same key serves two roles: correlation id for
//! subscribe/unsubscribe operations and de-duplication key in the
//! subscription registry, so two JSON-equal payloads always map to the same
//! wire subscription.

use std::collections::BTreeMap;

use serde_json::Value;

/// Derive the canonical key for a payload.
pub fn canonical_key(value: &Value) -> String {
    normalize(value).to_string()
}

/// Recursively sort object keys and lowercase hex identifier tokens.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = serde_json::Map::with_capacity(sorted.len());
            for (key, val) in sorted {
                out.insert(key.clone(), normalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::String(s) if is_hex_token(s) => Value::String(s.to_ascii_lowercase()),
        other => other.clone(),
    }
}

/// A `0x`-prefixed string of hex digits (addresses, transaction hashes).
/// These identifiers are case-insensitive upstream, so mixed-case variants
/// must collapse to one key.
fn is_hex_token(s: &str) -> bool {
    let rest = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(rest) => rest,
        None => return false,
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_hexdigit())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
