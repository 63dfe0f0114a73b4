//! Events processed by the session task, and the handles that post them.

use tokio::sync::mpsc;

use crate::error::VoiceError;
use crate::peer::{LinkState, MediaBackend, NegotiationStep};
use crate::signaling::{ChannelEvent, IceCandidate, PeerId};

/// Everything the session reacts to, in one ordered queue
pub enum SessionEvent<B: MediaBackend> {
    /// Signaling transport event
    Channel(ChannelEvent),
    /// Local user action
    Ui(UiAction),
    /// Microphone request finished
    MicrophoneReady(Result<B::LocalTrack, VoiceError>),
    /// A negotiation step finished for one connection
    Negotiated {
        peer: PeerId,
        generation: u64,
        outcome: Result<NegotiationStep, VoiceError>,
    },
    /// The connection discovered a local candidate
    LocalCandidate {
        peer: PeerId,
        generation: u64,
        candidate: IceCandidate,
    },
    /// A remote audio track became available
    TrackAvailable {
        peer: PeerId,
        generation: u64,
        track: B::RemoteTrack,
    },
    /// The connection's transport state changed
    LinkStateChanged {
        peer: PeerId,
        generation: u64,
        state: LinkState,
    },
}

impl<B: MediaBackend> SessionEvent<B> {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Channel(_) => "channel",
            SessionEvent::Ui(_) => "ui",
            SessionEvent::MicrophoneReady(_) => "microphone_ready",
            SessionEvent::Negotiated { .. } => "negotiated",
            SessionEvent::LocalCandidate { .. } => "local_candidate",
            SessionEvent::TrackAvailable { .. } => "track_available",
            SessionEvent::LinkStateChanged { .. } => "link_state",
        }
    }
}

/// Local user actions (the join/mute/deafen buttons)
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    /// Unlock the audio output context
    UnlockAudio,
    SetMute(bool),
    ToggleMute,
    SetDeafen(bool),
    ToggleDeafen,
    SetPeerPosition { peer: PeerId, position: [f32; 3] },
}

/// Notices for the UI shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiNotice {
    /// Microphone refused; the client stays un-joined
    MicrophoneDenied(String),
    Joined,
    AudioUnlocked,
    MuteChanged(bool),
    DeafenChanged(bool),
    Disconnected { reason: Option<String> },
}

/// Sender half of the session queue
pub type EventSender<B> = mpsc::UnboundedSender<SessionEvent<B>>;

/// Receiver half of the session queue
pub type EventReceiver<B> = mpsc::UnboundedReceiver<SessionEvent<B>>;

/// Create the session queue.
pub fn event_channel<B: MediaBackend>() -> (EventSender<B>, EventReceiver<B>) {
    mpsc::unbounded_channel()
}

/// Posts events for one connection, tagged with its peer and generation.
pub struct PeerEvents<B: MediaBackend> {
    peer: PeerId,
    generation: u64,
    tx: EventSender<B>,
}

impl<B: MediaBackend> Clone for PeerEvents<B> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            generation: self.generation,
            tx: self.tx.clone(),
        }
    }
}

impl<B: MediaBackend> PeerEvents<B> {
    pub fn new(peer: PeerId, generation: u64, tx: EventSender<B>) -> Self {
        Self { peer, generation, tx }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session has stopped.
    pub fn local_candidate(&self, candidate: IceCandidate) -> bool {
        self.post(SessionEvent::LocalCandidate {
            peer: self.peer.clone(),
            generation: self.generation,
            candidate,
        })
    }

    pub fn track_available(&self, track: B::RemoteTrack) -> bool {
        self.post(SessionEvent::TrackAvailable {
            peer: self.peer.clone(),
            generation: self.generation,
            track,
        })
    }

    pub fn link_state(&self, state: LinkState) -> bool {
        self.post(SessionEvent::LinkStateChanged {
            peer: self.peer.clone(),
            generation: self.generation,
            state,
        })
    }

    pub(crate) fn negotiated(&self, outcome: Result<NegotiationStep, VoiceError>) -> bool {
        self.post(SessionEvent::Negotiated {
            peer: self.peer.clone(),
            generation: self.generation,
            outcome,
        })
    }

    fn post(&self, event: SessionEvent<B>) -> bool {
        self.tx.send(event).is_ok()
    }
}
