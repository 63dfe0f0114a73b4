//! Signaling with the relay.
//!
//! - `message`: delimiter-framed wire format and typed messages
//! - `channel`: WebSocket transport and the send primitive used by the session

pub mod channel;
pub mod message;

pub use channel::*;
pub use message::*;
