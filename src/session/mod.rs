//! Voice session: owns all per-session state and routes events.
//!
//! Every input (signaling frames, UI actions, completions of background
//! negotiation steps, connection callbacks) arrives on one queue and is
//! handled to completion before the next one. The registry, local stream,
//! audio options and mix graph are only touched from here.

pub mod event;


pub use event::*;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::audio::{switch_gain, AudioOptions, LocalStream, MixGraph, PlaybackSink};
use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::peer::negotiation::{spawn_add_candidate, spawn_answer, spawn_apply_answer, spawn_offer};
use crate::peer::{CreateOutcome, LinkState, MediaBackend, NegotiationState, NegotiationStep, PeerRegistry};
use crate::signaling::{
    ChannelEvent, FrameError, FrameCodec, IceCandidate, PeerId, SessionDescription, SignalingMessage,
    SignalingSink,
};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Microphone request progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneState {
    NotRequested,
    Pending,
    Granted,
    Denied,
}

/// One client's voice session
pub struct Session<B: MediaBackend> {
    codec: FrameCodec,
    backend: Arc<B>,
    registry: PeerRegistry<B>,
    graph: MixGraph,
    local: Option<LocalStream<B::LocalTrack>>,
    options: AudioOptions,
    microphone: MicrophoneState,
    sink: Arc<dyn SignalingSink>,
    events: EventSender<B>,
    ui: mpsc::UnboundedSender<UiNotice>,
    channel_open: bool,
    ended: bool,
    sample_rate: u32,
    playback: Vec<f32>,
}

impl<B: MediaBackend> Session<B> {
    /// Create a session.
    ///
    /// # Arguments
    /// * `config` - Validated client configuration
    /// * `backend` - Media stack
    /// * `sink` - Send half of the signaling channel
    /// * `events` - Sender of the queue this session is driven from
    /// * `ui` - Notices for the UI shell
    pub fn new(
        config: &VoiceConfig,
        backend: Arc<B>,
        sink: Arc<dyn SignalingSink>,
        events: EventSender<B>,
        ui: mpsc::UnboundedSender<UiNotice>,
    ) -> Self {
        Self {
            codec: config.codec(),
            registry: PeerRegistry::new(backend.clone(), config.ice_servers.clone()),
            backend,
            graph: MixGraph::new(config.node_capacity()),
            local: None,
            options: AudioOptions::new(config.mute_on_connect),
            microphone: MicrophoneState::NotRequested,
            sink,
            events,
            ui,
            channel_open: false,
            ended: false,
            sample_rate: config.sample_rate,
            playback: Vec::new(),
        }
    }

    /// Process events until the signaling channel closes.
    pub async fn run(mut self, mut rx: EventReceiver<B>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
            if self.ended {
                break;
            }
        }
        info!("[Session] Stopped");
    }

    /// Like `run`, additionally pulling one mixed block of length `block`
    /// into `output` per tick.
    pub async fn run_with_output(mut self, mut rx: EventReceiver<B>, mut output: Box<dyn PlaybackSink>, block: Duration) {
        let frames = (self.sample_rate as u128 * block.as_micros() / 1_000_000) as usize;
        let mut ticker = tokio::time::interval(block);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await;
                    if self.ended {
                        break;
                    }
                }
                _ = ticker.tick() => self.render_block(frames, output.as_mut()),
            }
        }
        info!("[Session] Stopped");
    }

    /// Mix `frames` stereo frames through the graph and hand them to
    /// `output`. Silent until audio is unlocked, and while deafened.
    pub fn render_block(&mut self, frames: usize, output: &mut dyn PlaybackSink) {
        self.playback.resize(frames * 2, 0.0);
        self.graph.render(&mut self.playback);
        if let Err(e) = output.play(&self.playback) {
            warn!("[Session] Playback output failed: {}", e);
        }
    }

    /// Route one event. Never fails: every error is handled here.
    pub async fn handle(&mut self, event: SessionEvent<B>) {
        if self.ended {
            debug!("[Session] Ignoring {} event after session end", event.name());
            return;
        }

        match event {
            SessionEvent::Channel(ChannelEvent::Opened) => self.on_channel_open(),
            SessionEvent::Channel(ChannelEvent::Frame(text)) => self.on_frame(&text).await,
            SessionEvent::Channel(ChannelEvent::Error(e)) => error!("[Session] Signaling error: {}", e),
            SessionEvent::Channel(ChannelEvent::Closed { reason }) => self.on_channel_closed(reason).await,
            SessionEvent::Ui(action) => self.on_ui(action),
            SessionEvent::MicrophoneReady(result) => self.on_microphone(result),
            SessionEvent::Negotiated {
                peer,
                generation,
                outcome,
            } => self.on_negotiated(peer, generation, outcome),
            SessionEvent::LocalCandidate {
                peer,
                generation,
                candidate,
            } => self.on_local_candidate(peer, generation, candidate),
            SessionEvent::TrackAvailable {
                peer,
                generation,
                track,
            } => self.on_track(peer, generation, track),
            SessionEvent::LinkStateChanged {
                peer,
                generation,
                state,
            } => self.on_link_state(peer, generation, state),
        }
    }

    // ------------------------------------------------------------------
    // Signaling channel
    // ------------------------------------------------------------------

    fn on_channel_open(&mut self) {
        info!("[Session] Connected to relay");
        self.channel_open = true;

        if self.local.is_some() {
            self.send(SignalingMessage::Join);
            self.notify(UiNotice::Joined);
            return;
        }

        match self.microphone {
            MicrophoneState::NotRequested => {
                info!("[Session] Requesting access to microphone");
                self.microphone = MicrophoneState::Pending;
                let backend = self.backend.clone();
                let tx = self.events.clone();
                tokio::spawn(async move {
                    let result = backend.request_microphone().await;
                    let _ = tx.send(SessionEvent::MicrophoneReady(result));
                });
            }
            MicrophoneState::Pending => debug!("[Session] Microphone request already pending"),
            MicrophoneState::Denied => warn!("[Session] Microphone was denied, not joining"),
            MicrophoneState::Granted => {}
        }
    }

    fn on_microphone(&mut self, result: Result<B::LocalTrack, VoiceError>) {
        match result {
            Ok(track) => {
                info!("[Session] Microphone access granted");
                self.microphone = MicrophoneState::Granted;
                if self.local.is_none() {
                    self.local = Some(LocalStream::new(track, self.options.mute));
                }
                if self.channel_open {
                    self.send(SignalingMessage::Join);
                    self.notify(UiNotice::Joined);
                }
            }
            Err(e) => {
                error!("[Session] {}", e);
                self.microphone = MicrophoneState::Denied;
                let text = if e.is_permission_failure() {
                    "You have denied access to your microphone. You will be unable to use this chat.".to_string()
                } else {
                    format!("Microphone unavailable: {}", e)
                };
                self.notify(UiNotice::MicrophoneDenied(text));
            }
        }
    }

    async fn on_channel_closed(&mut self, reason: Option<String>) {
        info!("[Session] Relay connection closed ({})", reason.as_deref().unwrap_or("no reason"));
        self.channel_open = false;
        self.registry.clear(&mut self.graph).await;
        self.graph.close();
        self.local = None;
        self.ended = true;
        info!("[Session] Audio closed");
        self.notify(UiNotice::Disconnected { reason });
    }

    async fn on_frame(&mut self, text: &str) {
        debug!("[Session] <- {}", text);
        match self.codec.decode(text) {
            Ok(message) => self.dispatch(message).await,
            Err(FrameError::UnknownKind(kind)) => warn!("[Session] Unknown event type '{}'", kind),
            Err(e) => warn!("[Session] Dropping frame: {}", e),
        }
    }

    async fn dispatch(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::AddPeer { peer } => self.initiate(peer).await,
            SignalingMessage::Offer { peer, description } => self.respond(peer, description).await,
            SignalingMessage::Answer { peer, description } => self.complete(peer, description),
            SignalingMessage::Candidate { peer, candidate } => self.add_remote_candidate(peer, candidate),
            SignalingMessage::RemovePeer { peer } => {
                self.registry.remove(&peer, &mut self.graph).await;
            }
            SignalingMessage::Join => debug!("[Session] Ignoring inbound join"),
        }
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    async fn initiate(&mut self, peer: PeerId) {
        let outcome = self
            .registry
            .create(&peer, self.local.as_ref(), &mut self.graph, &self.events)
            .await;

        match outcome {
            Ok(CreateOutcome::Created(generation)) => {
                if let Some(entry) = self.registry.get(&peer) {
                    spawn_offer(entry.connection().clone(), PeerEvents::new(peer, generation, self.events.clone()));
                }
            }
            Ok(CreateOutcome::AlreadyConnected) => {}
            Err(e) => warn!("[Session] Cannot connect to {}: {}", peer, e),
        }
    }

    async fn respond(&mut self, peer: PeerId, description: SessionDescription) {
        if let Err(e) = self
            .registry
            .create(&peer, self.local.as_ref(), &mut self.graph, &self.events)
            .await
        {
            warn!("[Session] Cannot answer {}: {}", peer, e);
            return;
        }

        let Some(entry) = self.registry.get_mut(&peer) else {
            return;
        };
        entry.set_state(NegotiationState::OfferReceived);
        let events = PeerEvents::new(peer, entry.generation(), self.events.clone());
        spawn_answer(entry.connection().clone(), description, events);
    }

    fn complete(&mut self, peer: PeerId, description: SessionDescription) {
        let Some(entry) = self.registry.get(&peer) else {
            debug!("[Session] Answer for unknown peer {}", peer);
            return;
        };
        if entry.state() != NegotiationState::OfferSent {
            debug!("[Session] Answer for {} while {:?}", peer, entry.state());
        }
        let events = PeerEvents::new(peer, entry.generation(), self.events.clone());
        spawn_apply_answer(entry.connection().clone(), description, events);
    }

    fn add_remote_candidate(&mut self, peer: PeerId, candidate: IceCandidate) {
        let Some(entry) = self.registry.get_mut(&peer) else {
            debug!("[Session] Candidate for unknown peer {}", peer);
            return;
        };
        match entry.remote_candidates_mut().admit(candidate) {
            Some(candidate) => spawn_add_candidate(entry.connection().clone(), peer, candidate),
            None => debug!("[Session] Queued candidate for {} until its remote description is set", peer),
        }
    }

    fn on_negotiated(&mut self, peer: PeerId, generation: u64, outcome: Result<NegotiationStep, VoiceError>) {
        let Some(entry) = self.registry.get_current(&peer, generation) else {
            debug!("[Session] Negotiation finished for stale peer {}", peer);
            return;
        };

        let step = match outcome {
            Ok(step) => step,
            Err(e) => {
                warn!("[Session] Negotiation with {} failed: {}", peer, e);
                return;
            }
        };

        entry.set_state(entry.state().after(&step));
        if matches!(step, NegotiationStep::AnswerCreated(_) | NegotiationStep::AnswerApplied) {
            let queued = entry.remote_candidates_mut().release();
            if !queued.is_empty() {
                debug!("[Session] Applying {} queued candidate(s) for {}", queued.len(), peer);
            }
            for candidate in queued {
                spawn_add_candidate(entry.connection().clone(), peer.clone(), candidate);
            }
        }
        let outbound = match step {
            NegotiationStep::OfferCreated(description) => Some(SignalingMessage::Offer { peer, description }),
            NegotiationStep::AnswerCreated(description) => Some(SignalingMessage::Answer { peer, description }),
            NegotiationStep::AnswerApplied => None,
        };
        if let Some(message) = outbound {
            self.send(message);
        }
    }

    fn on_local_candidate(&mut self, peer: PeerId, generation: u64, candidate: IceCandidate) {
        if self.registry.get_current(&peer, generation).is_none() {
            debug!("[Session] Dropping local candidate for stale peer {}", peer);
            return;
        }
        self.send(SignalingMessage::Candidate { peer, candidate });
    }

    fn on_track(&mut self, peer: PeerId, generation: u64, track: B::RemoteTrack) {
        let Some(entry) = self.registry.get_current(&peer, generation) else {
            debug!("[Session] Track for stale peer {}", peer);
            return;
        };
        if !entry.remote_audio_mut().attach(track.clone()) {
            debug!("[Session] {} already has a remote track", peer);
            return;
        }

        let node = entry.spatial_node();
        match self.graph.take_node_input(node) {
            Some(input) => {
                info!("[Session] Routing audio from {} into {}", peer, node);
                self.backend.route_track(&peer, &track, input);
            }
            None => warn!("[Session] {} has no free input for {}", node, peer),
        }
    }

    fn on_link_state(&mut self, peer: PeerId, generation: u64, state: LinkState) {
        let Some(entry) = self.registry.get_current(&peer, generation) else {
            return;
        };
        entry.set_state(entry.state().on_link(state));
        match state {
            LinkState::Connected => info!("[Session] Connected to {}", peer),
            LinkState::Failed => warn!("[Session] Connection to {} failed", peer),
            other => debug!("[Session] {} link {:?}", peer, other),
        }
    }

    // ------------------------------------------------------------------
    // Audio controls
    // ------------------------------------------------------------------

    fn on_ui(&mut self, action: UiAction) {
        match action {
            UiAction::UnlockAudio => self.unlock_audio(),
            UiAction::SetMute(mute) => self.set_local_mute(mute),
            UiAction::ToggleMute => self.set_local_mute(!self.options.mute),
            UiAction::SetDeafen(deaf) => self.set_deafen(deaf),
            UiAction::ToggleDeafen => self.set_deafen(!self.options.deaf),
            UiAction::SetPeerPosition { peer, position } => {
                let moved = self
                    .registry
                    .get(&peer)
                    .map(|entry| self.graph.set_position(entry.spatial_node(), position))
                    .unwrap_or(false);
                if !moved {
                    debug!("[Session] Cannot position unknown peer {}", peer);
                }
            }
        }
    }

    /// First phase of joining audio: resume the output context.
    pub fn unlock_audio(&mut self) {
        match self.graph.resume() {
            Ok(()) => {
                info!("[Session] Audio output unlocked");
                self.notify(UiNotice::AudioUnlocked);
            }
            Err(e) => warn!("[Session] {}", e),
        }
    }

    /// Set the capture gain to 0 (muted) or 1.
    pub fn set_local_mute(&mut self, mute: bool) {
        self.options.mute = mute;
        if let Some(local) = &self.local {
            local.set_muted(mute);
        }
        info!("[Session] mute {}", mute);
        self.notify(UiNotice::MuteChanged(mute));
    }

    /// Set the master playback gain to 0 (deafened) or 1.
    pub fn set_deafen(&mut self, deaf: bool) {
        self.options.deaf = deaf;
        self.graph.master_gain().set(switch_gain(deaf));
        info!("[Session] deaf {}", deaf);
        self.notify(UiNotice::DeafenChanged(deaf));
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn registry(&self) -> &PeerRegistry<B> {
        &self.registry
    }

    pub fn graph(&self) -> &MixGraph {
        &self.graph
    }

    pub fn local_stream(&self) -> Option<&LocalStream<B::LocalTrack>> {
        self.local.as_ref()
    }

    pub fn options(&self) -> AudioOptions {
        self.options
    }

    pub fn microphone(&self) -> MicrophoneState {
        self.microphone
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Sender for posting events (UI actions) to this session
    pub fn events(&self) -> EventSender<B> {
        self.events.clone()
    }

    fn send(&self, message: SignalingMessage) {
        debug!("[Session] Sending {} {}", message.name(), message.peer().map(|p| p.as_str()).unwrap_or(""));
        if let Err(e) = self.sink.send(&message) {
            error!("[Session] Failed to send {}: {}", message.name(), e);
        }
    }

    fn notify(&self, notice: UiNotice) {
        let _ = self.ui.send(notice);
    }
}
