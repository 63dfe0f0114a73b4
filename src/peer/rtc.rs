//! webrtc-rs media backend.
//!
//! One `API` instance (media engine + default interceptors) is shared by every
//! connection. The local capture track wraps an OPUS `TrackLocalStaticSample`:
//! gained microphone blocks are encoded by a pluggable `FrameEncoder` and
//! written as samples. Remote OPUS tracks are read from RTP and, when a
//! decoder is installed, pushed into the peer's spatial node.
//!
//! Remote candidates that reach a connection before its remote description
//! are queued and applied once the description is set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::negotiation::PendingCandidates;
use super::transport::{LinkState, MediaBackend, PeerTransport};
use crate::audio::{CaptureSink, NodeInput};
use crate::error::VoiceError;
use crate::ice::IceServerConfig;
use crate::session::PeerEvents;
use crate::signaling::{IceCandidate, PeerId, SdpType, SessionDescription};

/// Decodes one RTP payload into interleaved f32 samples.
pub trait FrameDecoder: Send {
    /// Returns samples per channel written to `out`.
    fn decode(&mut self, payload: &[u8], out: &mut [f32]) -> Result<usize, VoiceError>;

    /// Size `out` must have for the largest frame (all channels).
    fn max_frame_samples(&self) -> usize;
}

/// Creates one decoder per remote track
pub type DecoderFactory = Arc<dyn Fn() -> Result<Box<dyn FrameDecoder>, VoiceError> + Send + Sync>;

/// Encodes one block of interleaved f32 samples into an RTP payload.
pub trait FrameEncoder: Send {
    /// Returns the number of bytes written to `out`.
    fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, VoiceError>;
}

/// Creates the encoder of a capture track
pub type EncoderFactory = Arc<dyn Fn() -> Result<Box<dyn FrameEncoder>, VoiceError> + Send + Sync>;

/// Largest encoded packet accepted from an encoder
const MAX_PACKET_BYTES: usize = 4000;

/// Consecutive failed RTP reads after which a remote track is abandoned
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;

/// webrtc-rs backed media stack
pub struct RtcBackend {
    /// WebRTC API instance (shared across all connections)
    api: API,
    sample_rate: u32,
    channels: u16,
    decoder_factory: Mutex<Option<DecoderFactory>>,
    encoder_factory: Mutex<Option<EncoderFactory>>,
}

impl RtcBackend {
    /// Build the shared API with default codecs and interceptors.
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, VoiceError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| VoiceError::Connection(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| VoiceError::Connection(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            sample_rate,
            channels,
            decoder_factory: Mutex::new(None),
            encoder_factory: Mutex::new(None),
        })
    }

    /// Install the decoder used for remote tracks routed after this call.
    pub fn set_decoder_factory(&self, factory: DecoderFactory) {
        *self.decoder_factory.lock() = Some(factory);
    }

    /// Install the encoder used by capture tracks opened after this call.
    pub fn set_encoder_factory(&self, factory: EncoderFactory) {
        *self.encoder_factory.lock() = Some(factory);
    }

    fn build_rtc_config(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: ice_servers.iter().map(|s| s.to_rtc_ice_server()).collect(),
            ..Default::default()
        }
    }
}

/// Microphone track shared by every connection
#[derive(Clone)]
pub struct RtcCaptureTrack {
    track: Arc<TrackLocalStaticSample>,
    encoder: Arc<Mutex<Option<Box<dyn FrameEncoder>>>>,
}

impl RtcCaptureTrack {
    fn new(track: Arc<TrackLocalStaticSample>, encoder: Option<Box<dyn FrameEncoder>>) -> Self {
        Self {
            track,
            encoder: Arc::new(Mutex::new(encoder)),
        }
    }

    /// The OPUS track added to each connection
    pub fn track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    pub fn set_encoder(&self, encoder: Box<dyn FrameEncoder>) {
        *self.encoder.lock() = Some(encoder);
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.lock().is_some()
    }
}

#[async_trait]
impl CaptureSink for RtcCaptureTrack {
    async fn write_frame(&self, samples: &[f32], duration: Duration) -> Result<(), VoiceError> {
        let data = {
            let mut encoder = self.encoder.lock();
            let encoder = encoder
                .as_mut()
                .ok_or_else(|| VoiceError::Audio("no encoder installed on the capture track".to_string()))?;
            let mut packet = vec![0u8; MAX_PACKET_BYTES];
            let len = encoder.encode(samples, &mut packet)?;
            packet.truncate(len);
            Bytes::from(packet)
        };

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| VoiceError::Audio(format!("Failed to write sample: {}", e)))
    }
}

/// One RTCPeerConnection
pub struct RtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    /// Remote candidates received before the remote description
    pending: Mutex<PendingCandidates<RTCIceCandidateInit>>,
}

impl RtcConnection {
    fn new(peer_connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            peer_connection,
            pending: Mutex::new(PendingCandidates::new()),
        }
    }

    /// Get the peer connection for advanced usage
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// Remote candidates waiting for the remote description
    pub fn queued_candidates(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl PeerTransport for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, VoiceError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), VoiceError> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), VoiceError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to set remote description: {}", e)))?;

        // Apply any candidates that arrived early
        let queued = self.pending.lock().release();
        for candidate in queued {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                warn!("[RtcConnection] Failed to add queued ICE candidate: {}", e);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), VoiceError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        let Some(candidate_init) = self.pending.lock().admit(candidate_init) else {
            debug!("[RtcConnection] Queued ICE candidate until the remote description is set");
            return Ok(());
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| VoiceError::Connection(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| VoiceError::Connection(format!("Failed to close peer connection: {}", e)))
    }
}

#[async_trait]
impl MediaBackend for RtcBackend {
    type Connection = RtcConnection;
    type LocalTrack = RtcCaptureTrack;
    type RemoteTrack = Arc<TrackRemote>;

    async fn request_microphone(&self) -> Result<Self::LocalTrack, VoiceError> {
        info!("[RtcBackend] Opening capture track ({} Hz, {} ch)", self.sample_rate, self.channels);
        let factory = self.encoder_factory.lock().clone();
        let encoder = match factory {
            Some(factory) => Some(factory()?),
            None => {
                info!("[RtcBackend] No encoder installed, capture stays silent until one is set");
                None
            }
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: self.sample_rate,
                channels: self.channels,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "mesh-voice".to_owned(),
        ));
        Ok(RtcCaptureTrack::new(track, encoder))
    }

    async fn open_connection(
        &self,
        ice_servers: &[IceServerConfig],
        local: &Self::LocalTrack,
        events: PeerEvents<Self>,
    ) -> Result<Arc<Self::Connection>, VoiceError> {
        let peer_connection = self
            .api
            .new_peer_connection(Self::build_rtc_config(ice_servers))
            .await
            .map_err(|e| VoiceError::Connection(format!("Failed to create peer connection: {}", e)))?;
        let peer_connection = Arc::new(peer_connection);

        peer_connection
            .add_track(local.track().clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| VoiceError::Connection(format!("Failed to add track: {}", e)))?;

        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering and is not forwarded
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        ice_events.local_candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index,
                            sdp_mid: init.sdp_mid,
                        });
                    }
                    Err(e) => warn!("[RtcBackend] Unserializable local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Audio {
                    track_events.track_available(track);
                } else {
                    debug!("[RtcBackend] Ignoring non-audio track from {}", track_events.peer());
                }
                Box::pin(async {})
            },
        ));

        let state_events = events;
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::New => LinkState::New,
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                _ => LinkState::New,
            };
            state_events.link_state(state);
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcConnection::new(peer_connection)))
    }

    fn route_track(&self, peer: &PeerId, track: &Self::RemoteTrack, input: NodeInput) {
        let decoder = self.decoder_factory.lock().clone().map(|factory| factory());
        let decoder = match decoder {
            Some(Ok(d)) => Some(d),
            Some(Err(e)) => {
                error!("[RtcBackend] Failed to create decoder for {}: {}", peer, e);
                None
            }
            None => {
                info!("[RtcBackend] No decoder installed, {} will be received but not played", peer);
                None
            }
        };

        tokio::spawn(read_remote_track(
            peer.clone(),
            track.clone(),
            input,
            decoder,
            self.channels as usize,
        ));
    }
}

/// Read RTP from a remote track until it ends, feeding decoded audio (mono)
/// into the spatial node.
async fn read_remote_track(
    peer: PeerId,
    track: Arc<TrackRemote>,
    mut input: NodeInput,
    mut decoder: Option<Box<dyn FrameDecoder>>,
    channels: usize,
) {
    let channels = channels.max(1);
    let mut pcm = vec![0.0f32; decoder.as_ref().map(|d| d.max_frame_samples()).unwrap_or(0)];
    let mut mono = Vec::with_capacity(pcm.len() / channels);
    let mut packets: u64 = 0;
    let mut errors = ReadErrors::default();

    loop {
        match track.read_rtp().await {
            Ok((rtp_packet, _attributes)) => {
                packets += 1;
                errors.reset();
                let payload = rtp_packet.payload.as_ref();
                let Some(decoder) = decoder.as_mut() else {
                    continue;
                };
                if payload.is_empty() {
                    continue;
                }

                match decoder.decode(payload, &mut pcm) {
                    Ok(samples_per_channel) => {
                        mono.clear();
                        mono.extend(
                            pcm.chunks_exact(channels)
                                .take(samples_per_channel)
                                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                        );
                        input.push(&mono);
                    }
                    Err(e) => debug!("[RtcBackend] Decode error from {}: {}", peer, e),
                }
            }
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("eof") || err_str.contains("closed") {
                    break;
                }
                if errors.record() {
                    error!("[RtcBackend] Giving up on track from {} after repeated read errors: {}", peer, e);
                    break;
                }
                warn!("[RtcBackend] RTP read error from {}: {}", peer, e);
            }
        }
    }

    debug!("[RtcBackend] Track from {} ended after {} packets ({})", peer, packets, input.node());
}

/// Consecutive read failures of one remote track
#[derive(Debug, Default)]
struct ReadErrors {
    consecutive: u32,
}

impl ReadErrors {
    /// Count a failure; true once the limit is reached.
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= MAX_CONSECUTIVE_READ_ERRORS
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, VoiceError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(VoiceError::Negotiation("rollback descriptions are not supported".to_string()))
        }
    };
    result.map_err(|e| VoiceError::Negotiation(format!("Invalid SDP: {}", e)))
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription, VoiceError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(VoiceError::Negotiation(format!("unexpected description type {}", other)))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::LocalStream;
    use crate::session::{event_channel, EventReceiver};

    async fn open(backend: &RtcBackend, peer: &str) -> (Arc<RtcConnection>, EventReceiver<RtcBackend>) {
        let (tx, rx) = event_channel::<RtcBackend>();
        let local = backend.request_microphone().await.unwrap();
        let conn = backend
            .open_connection(&[], &local, PeerEvents::new(PeerId::from(peer), 1, tx))
            .await
            .unwrap();
        (conn, rx)
    }

    fn host_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 8189 typ host".to_string(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        }
    }

    struct PassThrough {
        seen: Arc<Mutex<Vec<f32>>>,
    }

    impl FrameEncoder for PassThrough {
        fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, VoiceError> {
            self.seen.lock().extend_from_slice(pcm);
            out[0] = 0xfc;
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_descriptions_convert_both_ways() {
        let backend = RtcBackend::new(48000, 2).unwrap();
        let (caller, _caller_rx) = open(&backend, "callee").await;
        let (callee, _callee_rx) = open(&backend, "caller").await;

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        let rtc_offer = to_rtc_description(offer.clone()).unwrap();
        assert_eq!(rtc_offer.sdp_type, RTCSdpType::Offer);
        assert_eq!(from_rtc_description(&rtc_offer).unwrap(), offer);

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        let rtc_answer = to_rtc_description(answer.clone()).unwrap();
        assert_eq!(rtc_answer.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc_description(&rtc_answer).unwrap(), answer);

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_early_candidate_queued_until_remote_description() {
        let backend = RtcBackend::new(48000, 2).unwrap();
        let (caller, _caller_rx) = open(&backend, "callee").await;
        let (callee, _callee_rx) = open(&backend, "caller").await;

        callee.add_ice_candidate(host_candidate()).await.unwrap();
        assert_eq!(callee.queued_candidates(), 1);

        let offer = caller.create_offer().await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        assert_eq!(callee.queued_candidates(), 0);

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[test]
    fn test_rollback_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(to_rtc_description(desc), Err(VoiceError::Negotiation(_))));
    }

    #[tokio::test]
    async fn test_capture_track_is_opus() {
        let backend = RtcBackend::new(48000, 2).unwrap();
        let local = backend.request_microphone().await.unwrap();
        let codec = local.track().codec();
        assert_eq!(codec.mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec.clock_rate, 48000);
        assert_eq!(codec.channels, 2);
        assert!(!local.has_encoder());
    }

    #[tokio::test]
    async fn test_capture_without_encoder_fails() {
        let backend = RtcBackend::new(48000, 1).unwrap();
        let local = backend.request_microphone().await.unwrap();
        let result = local.write_frame(&[0.1; 960], Duration::from_millis(20)).await;
        assert!(matches!(result, Err(VoiceError::Audio(_))));
    }

    #[tokio::test]
    async fn test_capture_gain_applied_before_encoding() {
        let backend = RtcBackend::new(48000, 2).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let encoder_seen = seen.clone();
        backend.set_encoder_factory(Arc::new(move || {
            Ok(Box::new(PassThrough {
                seen: encoder_seen.clone(),
            }) as Box<dyn FrameEncoder>)
        }));

        let track = backend.request_microphone().await.unwrap();
        assert!(track.has_encoder());
        let local = LocalStream::new(track, true);
        let block = Duration::from_millis(20);

        let _ = local.write_frame(&mut [0.5, -0.5], block).await;
        local.set_muted(false);
        let _ = local.write_frame(&mut [0.5, -0.5], block).await;

        assert_eq!(*seen.lock(), vec![0.0, 0.0, 0.5, -0.5]);
    }

    #[test]
    fn test_read_errors_bounded() {
        let mut errors = ReadErrors::default();
        for _ in 1..MAX_CONSECUTIVE_READ_ERRORS {
            assert!(!errors.record());
        }
        errors.reset();
        for _ in 1..MAX_CONSECUTIVE_READ_ERRORS {
            assert!(!errors.record());
        }
        assert!(errors.record());
    }
}
