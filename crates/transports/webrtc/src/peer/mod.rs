//! Peer connections
//!
//! - [`backend`]: traits the state machine drives, and the events it reacts to
//! - [`webrtc_backend`]: webrtc-rs implementation
//! - [`connection`]: per-peer negotiation state machine

pub mod backend;
pub mod connection;
pub mod webrtc_backend;

pub use backend::{
    DataChannelLink, IceConnectionState, LocalTrack, PeerConnectionFactory, RtcEvent,
    RtcEventSender, RtcPeer,
};
pub use connection::{ConnectionContext, NegotiationState, PeerConnection};
pub use webrtc_backend::WebRtcBackend;
