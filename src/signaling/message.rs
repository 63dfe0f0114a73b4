//! Relay wire format.
//!
//! A frame is UTF-8 text with two or three fields joined by a delimiter that
//! never appears inside a field. Field 0 names the message kind, field 1 is
//! the peer id and field 2 (when present) is a JSON payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default field delimiter used by the relay
pub const DEFAULT_DELIMITER: &str = "::::";

const KIND_JOIN: &str = "join";
const KIND_ADD_PEER: &str = "add_peer";
const KIND_CANDIDATE: &str = "candidate";
const KIND_REMOVE_PEER: &str = "remove_peer";

/// Relay-assigned participant identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Session description type (`type` field of the JSON record)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description record exchanged during offer/answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// Signaling messages, decoded once at the channel boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Announce self to the relay
    Join,
    /// Relay asks us to initiate toward a new participant
    AddPeer { peer: PeerId },
    /// Session offer (sent by the initiator, received by the responder)
    Offer {
        peer: PeerId,
        description: SessionDescription,
    },
    /// Session answer
    Answer {
        peer: PeerId,
        description: SessionDescription,
    },
    /// ICE candidate, either direction
    Candidate { peer: PeerId, candidate: IceCandidate },
    /// Relay reports a participant left
    RemovePeer { peer: PeerId },
}

impl SignalingMessage {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SignalingMessage::Join => "join",
            SignalingMessage::AddPeer { .. } => "add_peer",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::RemovePeer { .. } => "remove_peer",
        }
    }

    /// Peer this message targets, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Join => None,
            SignalingMessage::AddPeer { peer }
            | SignalingMessage::Offer { peer, .. }
            | SignalingMessage::Answer { peer, .. }
            | SignalingMessage::Candidate { peer, .. }
            | SignalingMessage::RemovePeer { peer } => Some(peer),
        }
    }
}

/// Errors turning frames into messages and back. A decode error drops only
/// that frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    #[error("'{kind}' frame is missing field '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("'{kind}' frame carries an empty peer id")]
    EmptyPeerId { kind: &'static str },

    #[error("'{kind}' payload is not valid JSON: {source}")]
    Json {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize '{kind}' payload: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Kind names for offer/answer as seen from each direction.
///
/// The relay renames `offer` to `get_offer` (and `answer` to `get_answer`)
/// when forwarding, so outbound and inbound names are configured separately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindAliases {
    pub offer_out: String,
    pub answer_out: String,
    pub offer_in: Vec<String>,
    pub answer_in: Vec<String>,
}

impl Default for KindAliases {
    fn default() -> Self {
        Self {
            offer_out: "offer".to_string(),
            answer_out: "answer".to_string(),
            offer_in: vec!["get_offer".to_string(), "offer".to_string()],
            answer_in: vec!["get_answer".to_string(), "answer".to_string()],
        }
    }
}

/// Encoder/decoder for delimiter-joined frames
#[derive(Clone, Debug)]
pub struct FrameCodec {
    delimiter: String,
    aliases: KindAliases,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER, KindAliases::default())
    }
}

impl FrameCodec {
    pub fn new(delimiter: &str, aliases: KindAliases) -> Self {
        Self {
            delimiter: delimiter.to_string(),
            aliases,
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Encode an outbound message into a text frame.
    pub fn encode(&self, message: &SignalingMessage) -> Result<String, FrameError> {
        let fields: Vec<String> = match message {
            SignalingMessage::Join => vec![KIND_JOIN.to_string()],
            SignalingMessage::AddPeer { peer } => {
                vec![KIND_ADD_PEER.to_string(), peer.to_string()]
            }
            SignalingMessage::RemovePeer { peer } => {
                vec![KIND_REMOVE_PEER.to_string(), peer.to_string()]
            }
            SignalingMessage::Offer { peer, description } => vec![
                self.aliases.offer_out.clone(),
                peer.to_string(),
                to_json("offer", description)?,
            ],
            SignalingMessage::Answer { peer, description } => vec![
                self.aliases.answer_out.clone(),
                peer.to_string(),
                to_json("answer", description)?,
            ],
            SignalingMessage::Candidate { peer, candidate } => vec![
                KIND_CANDIDATE.to_string(),
                peer.to_string(),
                to_json("candidate", candidate)?,
            ],
        };
        Ok(fields.join(&self.delimiter))
    }

    /// Decode an inbound text frame.
    pub fn decode(&self, frame: &str) -> Result<SignalingMessage, FrameError> {
        if frame.is_empty() {
            return Err(FrameError::EmptyFrame);
        }

        let mut fields = frame.splitn(3, self.delimiter.as_str());
        let kind = fields.next().ok_or(FrameError::EmptyFrame)?;
        let peer = fields.next();
        let payload = fields.next();

        if kind == KIND_JOIN {
            return Ok(SignalingMessage::Join);
        }
        if kind == KIND_ADD_PEER {
            let peer = peer_field("add_peer", peer)?;
            return Ok(SignalingMessage::AddPeer { peer });
        }
        if kind == KIND_REMOVE_PEER {
            let peer = peer_field("remove_peer", peer)?;
            return Ok(SignalingMessage::RemovePeer { peer });
        }
        if kind == KIND_CANDIDATE {
            let peer = peer_field("candidate", peer)?;
            let candidate = json_field("candidate", payload)?;
            return Ok(SignalingMessage::Candidate { peer, candidate });
        }
        if self.aliases.offer_in.iter().any(|k| k == kind) {
            let peer = peer_field("offer", peer)?;
            let description = json_field("offer", payload)?;
            return Ok(SignalingMessage::Offer { peer, description });
        }
        if self.aliases.answer_in.iter().any(|k| k == kind) {
            let peer = peer_field("answer", peer)?;
            let description = json_field("answer", payload)?;
            return Ok(SignalingMessage::Answer { peer, description });
        }

        Err(FrameError::UnknownKind(kind.to_string()))
    }
}

fn to_json<T: Serialize>(kind: &'static str, value: &T) -> Result<String, FrameError> {
    serde_json::to_string(value).map_err(|source| FrameError::Encode { kind, source })
}

fn peer_field(kind: &'static str, field: Option<&str>) -> Result<PeerId, FrameError> {
    match field {
        None => Err(FrameError::MissingField {
            kind,
            field: "peer_id",
        }),
        Some("") => Err(FrameError::EmptyPeerId { kind }),
        Some(id) => Ok(PeerId::new(id)),
    }
}

fn json_field<T: for<'de> Deserialize<'de>>(
    kind: &'static str,
    field: Option<&str>,
) -> Result<T, FrameError> {
    let raw = field.ok_or(FrameError::MissingField {
        kind,
        field: "payload",
    })?;
    serde_json::from_str(raw).map_err(|source| FrameError::Json { kind, source })
}
