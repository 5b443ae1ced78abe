//! Peer and track identifiers

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Stable identifier for a remote endpoint (an IPv4 address in deployed meshes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build an address from the 4-byte prefix of an inbound relay frame
    pub fn from_ipv4_bytes(bytes: [u8; 4]) -> Self {
        Self(Ipv4Addr::from(bytes).to_string())
    }

    /// Raw bytes of a dotted-quad address, as carried in relay frame prefixes
    pub fn to_ipv4_bytes(&self) -> Result<[u8; 4]> {
        self.0
            .parse::<Ipv4Addr>()
            .map(|ip| ip.octets())
            .map_err(|_| Error::InvalidConfig(format!("{} is not an IPv4 address", self.0)))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Media kind carried by a logical track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Logical track identifier, the first byte of every wire frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u8);

impl TrackId {
    /// Local microphone
    pub const MICROPHONE_AUDIO: TrackId = TrackId(0);
    /// System or application audio captured alongside a screen share
    pub const SECONDARY_AUDIO: TrackId = TrackId(1);
    /// Screen share video
    pub const SCREEN_VIDEO: TrackId = TrackId(2);

    /// Tracks this engine knows how to produce
    pub const KNOWN: [TrackId; 3] = [
        TrackId::MICROPHONE_AUDIO,
        TrackId::SECONDARY_AUDIO,
        TrackId::SCREEN_VIDEO,
    ];

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Unknown ids are treated as audio so they are never key-frame gated.
    pub fn kind(self) -> MediaKind {
        match self {
            TrackId::SCREEN_VIDEO => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }

    pub fn is_video(self) -> bool {
        self.kind() == MediaKind::Video
    }

    pub fn name(self) -> &'static str {
        match self {
            TrackId::MICROPHONE_AUDIO => "microphone-audio",
            TrackId::SECONDARY_AUDIO => "secondary-audio",
            TrackId::SCREEN_VIDEO => "screen-video",
            _ => "unknown",
        }
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl From<u8> for TrackId {
    fn from(value: u8) -> Self {
        TrackId(value)
    }
}
