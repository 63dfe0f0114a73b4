//! In-memory doubles for the media backend and the signaling channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::audio::{CaptureSink, NodeInput, PlaybackSink};
use crate::error::VoiceError;
use crate::ice::IceServerConfig;
use crate::peer::{MediaBackend, PeerTransport};
use crate::session::PeerEvents;
use crate::signaling::{IceCandidate, PeerId, SessionDescription, SignalingMessage, SignalingSink};

pub const FAKE_OFFER_SDP: &str = "fake-offer";
pub const FAKE_ANSWER_SDP: &str = "fake-answer";

/// Operation performed on a fake connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// Connection object that records every call.
///
/// Like webrtc-rs, it rejects remote candidates until a remote description
/// has been set.
pub struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    fail_remote: bool,
    remote_set: AtomicBool,
    rejected_candidates: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_remote: false,
            remote_set: AtomicBool::new(false),
            rejected_candidates: AtomicUsize::new(0),
        }
    }

    /// Rejects every remote description
    pub fn failing_remote() -> Self {
        Self {
            fail_remote: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Candidates refused because no remote description was set
    pub fn rejected_candidates(&self) -> usize {
        self.rejected_candidates.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, VoiceError> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer(FAKE_OFFER_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(FAKE_ANSWER_SDP))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), VoiceError> {
        self.record(Call::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), VoiceError> {
        self.record(Call::SetRemote(description));
        if self.fail_remote {
            return Err(VoiceError::Negotiation("remote description rejected".to_string()));
        }
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), VoiceError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            self.rejected_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(VoiceError::Connection("remote description is not set".to_string()));
        }
        self.record(Call::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.record(Call::Close);
        Ok(())
    }
}

/// Capture track that keeps every frame written to it
#[derive(Clone, Debug, Default)]
pub struct FakeMic {
    frames: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl FakeMic {
    pub fn frames(&self) -> Vec<Vec<f32>> {
        self.frames.lock().clone()
    }
}

impl PartialEq for FakeMic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.frames, &other.frames)
    }
}

#[async_trait]
impl CaptureSink for FakeMic {
    async fn write_frame(&self, samples: &[f32], _duration: Duration) -> Result<(), VoiceError> {
        self.frames.lock().push(samples.to_vec());
        Ok(())
    }
}

/// Media backend whose connections are `FakeTransport`s, whose microphone is
/// a `FakeMic` and whose remote tracks are plain strings
#[derive(Default)]
pub struct FakeBackend {
    connections: Mutex<Vec<(PeerId, Arc<FakeTransport>, PeerEvents<FakeBackend>)>>,
    routed: Mutex<Vec<(PeerId, String)>>,
    inputs: Mutex<Vec<(PeerId, NodeInput)>>,
    mic: FakeMic,
    mic_requests: AtomicUsize,
    deny_microphone: AtomicBool,
    fail_next_open: AtomicBool,
    fail_remote: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Connections opened from now on reject remote descriptions
    pub fn fail_remote_descriptions(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    pub fn mic_requests(&self) -> usize {
        self.mic_requests.load(Ordering::SeqCst)
    }

    /// Peers a connection was opened for, in order
    pub fn opened(&self) -> Vec<PeerId> {
        self.connections.lock().iter().map(|(id, _, _)| id.clone()).collect()
    }

    /// Most recent connection opened for `id`
    pub fn transport(&self, id: &PeerId) -> Option<Arc<FakeTransport>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|(peer, _, _)| peer == id)
            .map(|(_, t, _)| t.clone())
    }

    /// Event handle given to the most recent connection for `id`
    pub fn peer_events(&self, id: &PeerId) -> Option<PeerEvents<FakeBackend>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|(peer, _, _)| peer == id)
            .map(|(_, _, events)| events.clone())
    }

    pub fn routed(&self) -> Vec<(PeerId, String)> {
        self.routed.lock().clone()
    }

    /// Node input handed over when the track of `id` was routed
    pub fn take_input(&self, id: &PeerId) -> Option<NodeInput> {
        let mut inputs = self.inputs.lock();
        let index = inputs.iter().position(|(peer, _)| peer == id)?;
        Some(inputs.remove(index).1)
    }

    /// The microphone every grant hands out
    pub fn mic(&self) -> FakeMic {
        self.mic.clone()
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    type Connection = FakeTransport;
    type LocalTrack = FakeMic;
    type RemoteTrack = String;

    async fn request_microphone(&self) -> Result<Self::LocalTrack, VoiceError> {
        self.mic_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(VoiceError::PermissionDenied("NotAllowedError".to_string()));
        }
        Ok(self.mic.clone())
    }

    async fn open_connection(
        &self,
        _ice_servers: &[IceServerConfig],
        _local: &Self::LocalTrack,
        events: PeerEvents<Self>,
    ) -> Result<Arc<FakeTransport>, VoiceError> {
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(VoiceError::Connection("open refused".to_string()));
        }
        let transport = if self.fail_remote.load(Ordering::SeqCst) {
            Arc::new(FakeTransport::failing_remote())
        } else {
            Arc::new(FakeTransport::new())
        };
        self.connections
            .lock()
            .push((events.peer().clone(), transport.clone(), events));
        Ok(transport)
    }

    fn route_track(&self, peer: &PeerId, track: &Self::RemoteTrack, input: NodeInput) {
        self.routed.lock().push((peer.clone(), track.clone()));
        self.inputs.lock().push((peer.clone(), input));
    }
}

/// Signaling sink that keeps every outbound message
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalingMessage>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }
}

impl SignalingSink for RecordingSink {
    fn send(&self, message: &SignalingMessage) -> Result<(), VoiceError> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

/// Playback output that keeps every block it is given
#[derive(Default)]
pub struct RecordingOutput {
    pub blocks: Vec<Vec<f32>>,
}

impl PlaybackSink for RecordingOutput {
    fn play(&mut self, block: &[f32]) -> Result<(), VoiceError> {
        self.blocks.push(block.to_vec());
        Ok(())
    }
}
