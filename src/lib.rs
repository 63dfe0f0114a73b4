//! Mesh voice-chat client
//!
//! Joins a room through a WebSocket relay and keeps one WebRTC connection to
//! every other participant. Remote audio is mixed locally through one
//! spatial node per peer.
//!
//! # Architecture
//!
//! ```text
//! relay (WebSocket, "kind::::peer::::payload" frames)
//!        |
//!   WsChannel ──> SessionEvent queue <── negotiation tasks, connection callbacks, UI
//!                        |
//!                     Session
//!                    /   |    \
//!       PeerRegistry  MixGraph  LocalStream
//!             |
//!     MediaBackend (RtcBackend: webrtc-rs)
//! ```
//!
//! All state is owned by `Session` and changed only while it handles one
//! event; async work posts its result back to the queue.

pub mod audio;
pub mod config;
pub mod error;
pub mod ice;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use audio::{AudioOptions, CaptureSink, ContextState, GainParam, LocalStream, MixGraph, NodeId, PlaybackSink};
pub use config::VoiceConfig;
pub use error::VoiceError;
pub use ice::{default_ice_servers, IceServerConfig};
pub use peer::{
    CreateOutcome, DecoderFactory, EncoderFactory, FrameDecoder, FrameEncoder, LinkState, MediaBackend,
    NegotiationState, PeerConnection, PeerRegistry, PeerTransport, PendingCandidates, RtcBackend, RtcCaptureTrack,
    RtcConnection,
};
pub use session::{
    event_channel, EventReceiver, EventSender, MicrophoneState, PeerEvents, Session, SessionEvent, UiAction, UiNotice,
};
pub use signaling::{
    ChannelEvent, FrameError, FrameCodec, IceCandidate, KindAliases, PeerId, SdpType, SessionDescription,
    SignalingMessage, SignalingSink, WsChannel, WsSink,
};
