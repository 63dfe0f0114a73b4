//! Peer connection management.
//!
//! Handles per-peer connection lifecycle and negotiation for a full mesh.

pub mod connection;
pub mod negotiation;
pub mod registry;
pub mod rtc;
pub mod transport;

pub use connection::*;
pub use negotiation::{NegotiationState, NegotiationStep, PendingCandidates};
pub use registry::*;
pub use rtc::{DecoderFactory, EncoderFactory, FrameDecoder, FrameEncoder, RtcBackend, RtcCaptureTrack, RtcConnection};
pub use transport::*;
