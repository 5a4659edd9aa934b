//! Client configuration
//!
//! Every section has defaults so an empty (or missing) TOML file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::media::TrackKind;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the signaling server
    pub signaling_url: String,
    /// STUN servers handed to every peer connection
    pub ice_servers: Vec<IceServerConfig>,
    /// How long to wait for the signaling server to answer a join/create request
    pub join_timeout_ms: u64,
    pub media: MediaConfig,
    pub negotiation: NegotiationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".to_owned(),
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
            }],
            join_timeout_ms: 10_000,
            media: MediaConfig::default(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.media.audio && !self.media.video {
            return Err(Error::Config(
                "at least one of media.audio / media.video must be enabled".into(),
            ));
        }
        if self.media.max_access_attempts == 0 {
            return Err(Error::Config("media.max_access_attempts must be >= 1".into()));
        }
        if self.negotiation.chat_label.is_empty() {
            return Err(Error::Config("negotiation.chat_label must not be empty".into()));
        }
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// ICE server entry. STUN only; relays are not supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
}

/// Local capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub audio: bool,
    /// Off by default: the bundled synthetic devices only produce audio.
    pub video: bool,
    /// Number of join attempts after which a media denial is reported as terminal
    pub max_access_attempts: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
            max_access_attempts: 3,
        }
    }
}

impl MediaConfig {
    pub fn requested_kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

/// Per-peer negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// A peer not connected within this bound is dropped. `0` (or `None`
    /// from code) waits forever.
    pub timeout_ms: Option<u64>,
    /// Label of the data channel the offerer opens for chat
    pub chat_label: String,
    /// Maximum number of simultaneous remote peers
    pub max_peers: Option<usize>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Some(30_000),
            chat_label: "chat".to_owned(),
            max_peers: None,
        }
    }
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ClientConfig::from_toml("").unwrap();
        assert_eq!(config.signaling_url, "ws://127.0.0.1:8080");
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.negotiation.chat_label, "chat");
        assert_eq!(config.negotiation.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.media.requested_kinds(), vec![TrackKind::Audio]);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = ClientConfig::from_toml(
            r#"
            signaling_url = "wss://signal.example.org/ws"

            [media]
            video = true

            [negotiation]
            max_peers = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.signaling_url, "wss://signal.example.org/ws");
        assert!(config.media.audio);
        assert_eq!(
            config.media.requested_kinds(),
            vec![TrackKind::Audio, TrackKind::Video]
        );
        assert_eq!(config.negotiation.max_peers, Some(4));
        assert_eq!(config.negotiation.chat_label, "chat");
    }

    #[test]
    fn zero_timeout_disables_the_deadline() {
        let config = ClientConfig::from_toml("[negotiation]\ntimeout_ms = 0\n").unwrap();
        assert_eq!(config.negotiation.timeout(), None);

        let config = ClientConfig::from_toml("[negotiation]\ntimeout_ms = 1500\n").unwrap();
        assert_eq!(config.negotiation.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn rejects_config_without_media() {
        let err = ClientConfig::from_toml("[media]\naudio = false\nvideo = false\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ClientConfig::from_toml("signaling_url = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
