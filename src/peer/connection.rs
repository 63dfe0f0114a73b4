//! State held for one remote participant.

use std::sync::Arc;

use super::negotiation::{NegotiationState, PendingCandidates};
use super::transport::MediaBackend;
use crate::audio::NodeId;
use crate::signaling::{IceCandidate, PeerId};

/// Inbound audio container: empty, then exactly one track wide.
#[derive(Debug)]
pub struct RemoteAudio<T> {
    track: Option<T>,
}

impl<T> Default for RemoteAudio<T> {
    fn default() -> Self {
        Self { track: None }
    }
}

impl<T> RemoteAudio<T> {
    /// Attach the first track. Later tracks are ignored and return false.
    pub fn attach(&mut self, track: T) -> bool {
        if self.track.is_some() {
            return false;
        }
        self.track = Some(track);
        true
    }

    pub fn track(&self) -> Option<&T> {
        self.track.as_ref()
    }

    pub fn track_count(&self) -> usize {
        usize::from(self.track.is_some())
    }
}

/// One negotiated connection plus its playback path
pub struct PeerConnection<B: MediaBackend> {
    id: PeerId,
    /// Distinguishes this connection from earlier ones for the same peer
    generation: u64,
    connection: Arc<B::Connection>,
    remote_audio: RemoteAudio<B::RemoteTrack>,
    spatial_node: NodeId,
    state: NegotiationState,
    remote_candidates: PendingCandidates<IceCandidate>,
}

impl<B: MediaBackend> PeerConnection<B> {
    pub(crate) fn new(id: PeerId, generation: u64, connection: Arc<B::Connection>, spatial_node: NodeId) -> Self {
        Self {
            id,
            generation,
            connection,
            remote_audio: RemoteAudio::default(),
            spatial_node,
            state: NegotiationState::New,
            remote_candidates: PendingCandidates::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<B::Connection> {
        &self.connection
    }

    pub fn remote_audio(&self) -> &RemoteAudio<B::RemoteTrack> {
        &self.remote_audio
    }

    pub fn remote_audio_mut(&mut self) -> &mut RemoteAudio<B::RemoteTrack> {
        &mut self.remote_audio
    }

    pub fn spatial_node(&self) -> NodeId {
        self.spatial_node
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn set_state(&mut self, state: NegotiationState) {
        self.state = state;
    }

    /// Remote candidates waiting for the remote description
    pub fn remote_candidates_mut(&mut self) -> &mut PendingCandidates<IceCandidate> {
        &mut self.remote_candidates
    }

    pub fn queued_candidates(&self) -> usize {
        self.remote_candidates.len()
    }
}
