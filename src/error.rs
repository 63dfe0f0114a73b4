//! Error types shared across the session, registry and backends.

use thiserror::Error;

use crate::signaling::FrameError;

/// Errors that can occur while running a voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Local stream not initialized")]
    LocalStreamMissing,

    #[error("Signaling frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Peer connection error: {0}")]
    Connection(String),

    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether this error ends the session's media capability.
    pub fn is_permission_failure(&self) -> bool {
        matches!(self, VoiceError::PermissionDenied(_))
    }
}
