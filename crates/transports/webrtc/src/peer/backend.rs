//! Seam between the negotiation state machine and the RTC stack
//!
//! [`PeerConnection`](super::PeerConnection) drives an [`RtcPeer`] and reacts
//! to the [`RtcEvent`]s it emits. Production uses the webrtc-rs backend;
//! tests script an in-memory one.

use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use peermux_core::{MediaKind, PeerAddress};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// ICE connection state as reported by the RTC stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }

    /// States the answerer treats as a stalled negotiation
    pub fn needs_offer(self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected
                | IceConnectionState::Failed
                | IceConnectionState::Closed
        )
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Event emitted by an [`RtcPeer`]
#[derive(Clone)]
pub enum RtcEvent {
    /// A local candidate was gathered
    IceCandidate(IceCandidate),
    /// Candidate gathering finished for the current description
    GatheringComplete,
    IceConnectionState(IceConnectionState),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannelLink>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

impl fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(&c.candidate).finish(),
            RtcEvent::GatheringComplete => f.write_str("GatheringComplete"),
            RtcEvent::IceConnectionState(s) => f.debug_tuple("IceConnectionState").field(s).finish(),
            RtcEvent::DataChannel(link) => f.debug_tuple("DataChannel").field(&link.label()).finish(),
            RtcEvent::ChannelOpen => f.write_str("ChannelOpen"),
            RtcEvent::ChannelMessage(text) => f.debug_tuple("ChannelMessage").field(text).finish(),
            RtcEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Sender half handed to a backend when a connection is created
pub type RtcEventSender = mpsc::UnboundedSender<RtcEvent>;

/// Outbound local track for one media kind
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<dyn TrackLocal + Send + Sync>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self { kind, track }
    }

    /// Opus sample track (48kHz stereo)
    pub fn opus(track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            track_id.to_string(),
            stream_id.to_string(),
        ));
        Self::new(MediaKind::Audio, track)
    }

    /// VP9 sample track
    pub fn vp9(track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP9".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            track_id.to_string(),
            stream_id.to_string(),
        ));
        Self::new(MediaKind::Video, track)
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .finish()
    }
}

/// Data channel handle
#[async_trait]
pub trait DataChannelLink: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One underlying RTC connection
///
/// Created with placeholder audio and video senders already attached so a
/// description can be produced before real media exists.
#[async_trait]
pub trait RtcPeer: Send + Sync {
    async fn create_control_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannelLink>>;

    /// Create and apply a local offer; gathering starts afterwards
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer, then create and apply the local answer
    async fn accept_offer(&self, offer: &SessionDescription) -> Result<SessionDescription>;

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    fn ice_connection_state(&self) -> IceConnectionState;

    /// Swap the track of the existing sender for `track.kind()`
    ///
    /// # Errors
    ///
    /// `NoMatchingSender` when no sender of that kind exists.
    async fn replace_track(&self, track: LocalTrack) -> Result<()>;

    /// Stop emitting events; later callbacks from the stack are dropped
    fn detach(&self);

    async fn close(&self) -> Result<()>;
}

/// Creates underlying connections for peers
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, peer: &PeerAddress, events: RtcEventSender) -> Result<Arc<dyn RtcPeer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_states() {
        assert!(IceConnectionState::Failed.needs_offer());
        assert!(IceConnectionState::Disconnected.needs_offer());
        assert!(IceConnectionState::Closed.needs_offer());
        assert!(!IceConnectionState::Checking.needs_offer());
        assert!(!IceConnectionState::Connected.needs_offer());
        assert!(IceConnectionState::Completed.is_connected());
    }

    #[test]
    fn test_placeholder_tracks() {
        let audio = LocalTrack::opus("audio", "peermux");
        let video = LocalTrack::vp9("screen", "peermux");
        assert_eq!(audio.kind(), MediaKind::Audio);
        assert_eq!(video.kind(), MediaKind::Video);
        assert_eq!(video.id(), "screen");
    }
}
