//! Configuration types for transmission pipelines and the decoder registry

use crate::frame;
use crate::track::TrackId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bitrate tiers produced in parallel for microphone audio
pub const DEFAULT_AUDIO_BITRATE_TIERS: [u32; 3] = [32_000, 64_000, 128_000];

/// Configuration for outbound track pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    /// Bitrate tiers for multi-rate microphone audio (default: 32/64/128 kbps)
    pub audio_bitrate_tiers: Vec<u32>,

    /// Bitrate for single-rate audio tracks (default: 128 kbps)
    pub audio_bitrate: u32,

    /// Opus complexity (0-10)
    pub audio_complexity: u32,

    /// Video bitrate in bits per second (default: 2 Mbps)
    pub video_bitrate: u32,

    /// Video framerate (default: 30)
    pub video_framerate: u32,

    /// Force a key frame every N video frames (default: 30)
    pub keyframe_interval: u32,

    /// Upper bound on encoder flush during stop, in milliseconds
    pub flush_timeout_ms: u64,

    /// Outbound frames queued per track before new frames are dropped
    pub outbound_queue_capacity: usize,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            audio_bitrate_tiers: DEFAULT_AUDIO_BITRATE_TIERS.to_vec(),
            audio_bitrate: 128_000,
            audio_complexity: 10,
            video_bitrate: 2_000_000,
            video_framerate: 30,
            keyframe_interval: 30,
            flush_timeout_ms: 2000,
            outbound_queue_capacity: 256,
        }
    }
}

impl TransmitConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Whether outbound frames of `track_id` carry a bitrate tag
    pub fn carries_bitrate_tag(&self, track_id: TrackId) -> bool {
        frame::carries_bitrate_tag(track_id, &self.audio_bitrate_tiers)
    }

    /// Video frame duration in microseconds
    pub fn video_frame_duration_micros(&self) -> u64 {
        1_000_000 / u64::from(self.video_framerate.max(1))
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `audio_bitrate_tiers` is empty or contains a zero tier
    /// - `audio_complexity` is above 10
    /// - `keyframe_interval` or `video_framerate` is zero
    pub fn validate(&self) -> Result<()> {
        if self.audio_bitrate_tiers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one audio bitrate tier is required".to_string(),
            ));
        }

        if self.audio_bitrate_tiers.iter().any(|&tier| tier == 0) || self.audio_bitrate == 0 {
            return Err(Error::InvalidConfig(
                "Audio bitrates must be non-zero".to_string(),
            ));
        }

        if self.audio_complexity > 10 {
            return Err(Error::InvalidConfig(format!(
                "audio_complexity must be in range 0-10, got {}",
                self.audio_complexity
            )));
        }

        if self.keyframe_interval == 0 {
            return Err(Error::InvalidConfig(
                "keyframe_interval must be at least 1".to_string(),
            ));
        }

        if self.video_framerate == 0 {
            return Err(Error::InvalidConfig(
                "video_framerate must be at least 1".to_string(),
            ));
        }

        if self.outbound_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration for the inbound decoder registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Delay before a faulted decoder instance is torn down for recreation
    pub restart_delay_ms: u64,

    /// Upper bound on decoder flush during removal, in milliseconds
    pub flush_timeout_ms: u64,

    /// Decoded audio sample rate (default: 48000)
    pub audio_sample_rate: u32,

    /// Decoded audio channel count (default: 2)
    pub audio_channels: u16,

    /// Decoded frames buffered per output track subscriber
    pub output_buffer_frames: usize,

    /// Bitrate tiers remote senders encode microphone audio at; must match
    /// their `TransmitConfig::audio_bitrate_tiers`
    pub audio_bitrate_tiers: Vec<u32>,

    /// Microphone tier to decode: the largest tier not above this (default: 64 kbps)
    pub audio_bitrate_target: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 100,
            flush_timeout_ms: 1000,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            output_buffer_frames: 64,
            audio_bitrate_tiers: DEFAULT_AUDIO_BITRATE_TIERS.to_vec(),
            audio_bitrate_target: 64_000,
        }
    }
}

impl RegistryConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Whether inbound frames of `track_id` carry a bitrate tag
    pub fn carries_bitrate_tag(&self, track_id: TrackId) -> bool {
        frame::carries_bitrate_tag(track_id, &self.audio_bitrate_tiers)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.audio_bitrate_tiers.is_empty() {
            return Err(Error::InvalidConfig(
                "audio_bitrate_tiers must not be empty".to_string(),
            ));
        }

        if self.audio_channels != 1 && self.audio_channels != 2 {
            return Err(Error::InvalidConfig(format!(
                "audio_channels must be 1 or 2, got {}",
                self.audio_channels
            )));
        }

        if self.output_buffer_frames == 0 {
            return Err(Error::InvalidConfig(
                "output_buffer_frames must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmit_defaults() {
        let config = TransmitConfig::default();
        assert_eq!(config.audio_bitrate_tiers, vec![32_000, 64_000, 128_000]);
        assert_eq!(config.keyframe_interval, 30);
        assert_eq!(config.video_frame_duration_micros(), 33_333);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transmit_rejects_empty_tiers() {
        let config = TransmitConfig {
            audio_bitrate_tiers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_registry_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.restart_delay(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_tagging_matches_on_both_sides() {
        let transmit = TransmitConfig::default();
        let registry = RegistryConfig::default();
        for track in TrackId::KNOWN {
            assert_eq!(
                transmit.carries_bitrate_tag(track),
                registry.carries_bitrate_tag(track),
                "{track}"
            );
        }
        assert!(registry.carries_bitrate_tag(TrackId::MICROPHONE_AUDIO));
        assert!(!registry.carries_bitrate_tag(TrackId::SCREEN_VIDEO));
    }

    #[test]
    fn test_registry_rejects_empty_tiers() {
        let config = RegistryConfig {
            audio_bitrate_tiers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_registry_partial_json() {
        let config: RegistryConfig = serde_json::from_str(r#"{"restart_delay_ms": 250}"#).unwrap();
        assert_eq!(config.restart_delay_ms, 250);
        assert_eq!(config.audio_channels, 2);
    }
}
