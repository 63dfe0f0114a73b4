//! Client configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes:
//!
//! ```json
//! { "signaling_url": "wss://voice.example.org/upgrade", "mute_on_connect": false }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::VoiceError;
use crate::ice::{default_ice_servers, IceServerConfig};
use crate::signaling::{FrameCodec, KindAliases, DEFAULT_DELIMITER};

/// Path of the relay's WebSocket upgrade endpoint
pub const UPGRADE_PATH: &str = "/upgrade";

/// Voice client configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Relay WebSocket URL
    pub signaling_url: String,
    /// Field delimiter of signaling frames
    pub delimiter: String,
    /// Start with the microphone muted
    pub mute_on_connect: bool,
    /// STUN/TURN servers for every peer connection
    pub ice_servers: Vec<IceServerConfig>,
    /// Offer/answer kind names per direction
    pub aliases: KindAliases,
    /// Capture and playback sample rate (48000 recommended)
    pub sample_rate: u32,
    /// Capture channels (1 or 2)
    pub channels: u16,
    /// Playback buffer per remote peer in milliseconds
    pub node_buffer_ms: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            signaling_url: Self::signaling_url_for("127.0.0.1", false),
            delimiter: DEFAULT_DELIMITER.to_string(),
            mute_on_connect: true,
            ice_servers: default_ice_servers(),
            aliases: KindAliases::default(),
            sample_rate: 48000,
            channels: 2,
            node_buffer_ms: 200,
        }
    }
}

impl VoiceConfig {
    /// Load from a JSON file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VoiceError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| VoiceError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Relay URL for a page served from `host`: `wss` when the page is
    /// secure, `ws` otherwise.
    pub fn signaling_url_for(host: &str, secure: bool) -> String {
        let scheme = if secure { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, host, UPGRADE_PATH)
    }

    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.delimiter.is_empty() {
            return Err(VoiceError::Config("delimiter must not be empty".to_string()));
        }

        let url = Url::parse(&self.signaling_url)
            .map_err(|e| VoiceError::Config(format!("invalid signaling_url '{}': {}", self.signaling_url, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(VoiceError::Config(format!(
                "signaling_url must use ws or wss, got '{}'",
                url.scheme()
            )));
        }

        if self.sample_rate == 0 || self.node_buffer_ms == 0 {
            return Err(VoiceError::Config("sample_rate and node_buffer_ms must be non-zero".to_string()));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(VoiceError::Config(format!("channels must be 1 or 2, got {}", self.channels)));
        }
        if self.aliases.offer_in.is_empty() || self.aliases.answer_in.is_empty() {
            return Err(VoiceError::Config("inbound offer/answer aliases must not be empty".to_string()));
        }
        Ok(())
    }

    /// Frame codec for this delimiter and alias set
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(&self.delimiter, self.aliases.clone())
    }

    /// Ring buffer size of one spatial node (mono samples)
    pub fn node_capacity(&self) -> usize {
        (self.sample_rate as usize / 1000) * self.node_buffer_ms as usize
    }
}
