//! Seams between the session core and a media stack.
//!
//! `PeerTransport` is one negotiated connection object; `MediaBackend`
//! creates them, grants the microphone and routes remote tracks into the mix.
//! The webrtc-rs implementation lives in `peer::rtc`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::audio::{CaptureSink, NodeInput};
use crate::error::VoiceError;
use crate::ice::IceServerConfig;
use crate::session::PeerEvents;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

/// Transport-level connection state reported by the connection object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One connection object toward one remote participant.
///
/// The session holds remote candidates back until the remote description
/// has been applied; implementations may still see early candidates from
/// other callers and should queue them rather than fail.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, VoiceError>;

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), VoiceError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), VoiceError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), VoiceError>;

    async fn close(&self) -> Result<(), VoiceError>;
}

/// Media stack used by a session
#[async_trait]
pub trait MediaBackend: Send + Sync + Sized + 'static {
    type Connection: PeerTransport;
    /// Local capture track, shared by every connection
    type LocalTrack: CaptureSink + Clone + Send + Sync + 'static;
    /// Remote media track delivered by a connection
    type RemoteTrack: Clone + Send + Sync + 'static;

    /// Ask for microphone access. `VoiceError::PermissionDenied` on refusal.
    async fn request_microphone(&self) -> Result<Self::LocalTrack, VoiceError>;

    /// Open a connection with `local` as its one outbound media path.
    ///
    /// Locally discovered candidates, remote audio tracks and link state
    /// changes must be reported through `events`.
    async fn open_connection(
        &self,
        ice_servers: &[IceServerConfig],
        local: &Self::LocalTrack,
        events: PeerEvents<Self>,
    ) -> Result<Arc<Self::Connection>, VoiceError>;

    /// Start feeding `track` into a spatial node.
    fn route_track(&self, peer: &PeerId, track: &Self::RemoteTrack, input: NodeInput);
}
