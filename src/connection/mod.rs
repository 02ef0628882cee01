//! Connection management module
//!
//! Owns the raw WebSocket and hides its instability: reconnection with
//! backoff, outbound buffering while disconnected, connect timeouts, and a
//! stable observer surface across socket swaps.

mod wrapper;

pub use wrapper::*;
