//! Local capture stream.

use std::time::Duration;

use async_trait::async_trait;

use super::{switch_gain, GainParam};
use crate::error::VoiceError;

/// Destination of microphone audio once the capture gain is applied
#[async_trait]
pub trait CaptureSink: Send + Sync {
    /// Send one block of interleaved samples covering `duration`.
    async fn write_frame(&self, samples: &[f32], duration: Duration) -> Result<(), VoiceError>;
}

/// Microphone track plus the gain applied before it reaches any peer.
///
/// Created once, on the first microphone grant, and reused by every peer
/// connection for the rest of the session.
#[derive(Clone, Debug)]
pub struct LocalStream<T> {
    track: T,
    gain: GainParam,
}

impl<T> LocalStream<T> {
    pub fn new(track: T, muted: bool) -> Self {
        Self {
            track,
            gain: GainParam::new(switch_gain(muted)),
        }
    }

    /// Track attached as the outbound media path of each connection
    pub fn track(&self) -> &T {
        &self.track
    }

    /// Capture gain (0 = muted)
    pub fn gain(&self) -> &GainParam {
        &self.gain
    }

    pub fn set_muted(&self, muted: bool) {
        self.gain.set(switch_gain(muted));
    }

    pub fn is_muted(&self) -> bool {
        self.gain.get() == 0.0
    }
}

impl<T: CaptureSink> LocalStream<T> {
    /// Scale one block from the microphone by the capture gain and send it
    /// on the shared track. A mute change applies from the next block.
    pub async fn write_frame(&self, samples: &mut [f32], duration: Duration) -> Result<(), VoiceError> {
        self.gain.apply(samples);
        self.track.write_frame(samples, duration).await
    }
}
