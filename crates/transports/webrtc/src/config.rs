//! Configuration types for the peer mesh

use crate::{Error, Result};
use peermux_core::{PeerAddress, RegistryConfig, TransmitConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for [`Mesh`](crate::Mesh)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// This node's IPv4 address on the overlay network, used as sender
    pub local_address: PeerAddress,

    /// This node's IPv6 address, advertised but not used for routing
    pub local_ipv6: Option<String>,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Session identifier exchange retry interval (default: 5000ms)
    pub role_exchange_interval_ms: u64,

    /// Answerer stall-recovery interval (default: 6000ms)
    pub ask_offer_interval_ms: u64,

    /// Control channel ping interval (default: 1000ms)
    pub ping_interval_ms: u64,

    /// Time without a pong before latency is reported as -1 (default: 5000ms)
    pub ping_timeout_ms: u64,

    /// Label of the control data channel (default: "data")
    pub control_channel_label: String,

    /// Whether the control channel delivers in order (default: false)
    pub control_channel_ordered: bool,

    /// Port peers' signaling endpoints listen on (default: 8848)
    pub signaling_port: u16,

    /// Host the local signaling endpoint binds to
    pub signaling_bind_host: String,

    /// Signaling request timeout (default: 5000ms)
    pub request_timeout_ms: u64,

    /// Outbound track pipelines
    pub transmit: TransmitConfig,

    /// Inbound decoders
    pub registry: RegistryConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            local_address: PeerAddress::new("127.0.0.1"),
            local_ipv6: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            role_exchange_interval_ms: 5000,
            ask_offer_interval_ms: 6000,
            ping_interval_ms: 1000,
            ping_timeout_ms: 5000,
            control_channel_label: "data".to_string(),
            control_channel_ordered: false,
            signaling_port: 8848,
            signaling_bind_host: "0.0.0.0".to_string(),
            request_timeout_ms: 5000,
            transmit: TransmitConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML document; missing keys keep their defaults
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn role_exchange_interval(&self) -> Duration {
        Duration::from_millis(self.role_exchange_interval_ms)
    }

    pub fn ask_offer_interval(&self) -> Duration {
        Duration::from_millis(self.ask_offer_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `local_address` is not an IPv4 address (the media relay prefix needs one)
    /// - a STUN URL does not start with `stun:` or `stuns:`
    /// - a TURN URL does not start with `turn:` or `turns:`
    /// - any interval or timeout is zero
    /// - `control_channel_label` is empty
    /// - the nested transmit or registry configuration is invalid
    pub fn validate(&self) -> Result<()> {
        self.local_address.to_ipv4_bytes().map_err(|_| {
            Error::InvalidConfig(format!(
                "local_address must be an IPv4 address, got {}",
                self.local_address
            ))
        })?;

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN URL must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        let intervals = [
            ("role_exchange_interval_ms", self.role_exchange_interval_ms),
            ("ask_offer_interval_ms", self.ask_offer_interval_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
        }

        if self.control_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "control_channel_label must not be empty".to_string(),
            ));
        }

        self.transmit.validate()?;
        self.registry.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ping_timeout(), Duration::from_secs(5));
        assert_eq!(config.control_channel_label, "data");
        assert!(!config.control_channel_ordered);
    }

    #[test]
    fn test_from_toml_keeps_defaults() {
        let config = MeshConfig::from_toml_str(
            r#"
            local_address = "100.64.0.7"
            ping_interval_ms = 500

            [transmit]
            audio_bitrate_tiers = [24000, 48000]
            "#,
        )
        .unwrap();

        assert_eq!(config.local_address.as_str(), "100.64.0.7");
        assert_eq!(config.ping_interval(), Duration::from_millis(500));
        assert_eq!(config.ask_offer_interval(), Duration::from_secs(6));
        assert_eq!(config.transmit.audio_bitrate_tiers, vec![24_000, 48_000]);
        assert_eq!(config.transmit.keyframe_interval, 30);
    }

    #[test]
    fn test_invalid_stun_url() {
        let config = MeshConfig {
            stun_servers: vec!["http://example.com".to_string()],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = MeshConfig::from_toml_str("ping_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("ping_timeout_ms"));
    }

    #[test]
    fn test_non_ipv4_local_address_rejected() {
        let config = MeshConfig {
            local_address: PeerAddress::new("my-laptop"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_config_error_surfaces() {
        let err = MeshConfig::from_toml_str("[transmit]\nkeyframe_interval = 0").unwrap_err();
        assert!(err.is_config_error());
    }
}
