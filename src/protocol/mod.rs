//! Wire protocol for the multiplexed connection
//!
//! Defines the outbound frame builders, the inbound frame classifier, and
//! canonical key derivation. The protocol is JSON over WebSocket with no
//! uniform envelope on the inbound side.

mod canonical;
mod frames;

pub use canonical::*;
pub use frames::*;
