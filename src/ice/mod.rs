//! ICE (Interactive Connectivity Establishment) configuration.
//!
//! Every peer connection is opened with the same STUN/TURN server list.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default public STUN server
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// ICE server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN-only server config
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server config with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// TURN servers need both halves of the credential pair.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.credential.is_some()
    }

    /// Convert to webrtc-rs RTCIceServer
    pub(crate) fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Server list used when the configuration names none
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun(DEFAULT_STUN_URL)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_has_no_credentials() {
        let server = IceServerConfig::stun(DEFAULT_STUN_URL);
        assert!(!server.has_credentials());
        let rtc = server.to_rtc_ice_server();
        assert_eq!(rtc.urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert!(rtc.username.is_empty());
    }

    #[test]
    fn test_turn_from_json() {
        let json = r#"{"urls":["turn:turn.example.org:3478"],"username":"u","credential":"c"}"#;
        let server: IceServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(server, IceServerConfig::turn("turn:turn.example.org:3478", "u", "c"));
        assert!(server.has_credentials());
    }
}
