//! peermux peer negotiation
//!
//! Establishes and maintains one WebRTC connection per online peer of an
//! overlay network:
//!
//! - [`session`]: session identifiers and the offerer/answerer decision
//! - [`signaling`]: point-to-point signaling messages, the HTTP relay and endpoint
//! - [`peer`]: the per-peer negotiation state machine and its RTC backend
//! - [`channels`]: the control data channel (ping/pong, application state)
//! - [`dispatcher`]: the connection directory driven by presence and signaling
//! - [`status`]: user-visible connection state and latency
//! - [`mesh`]: a node facade combining negotiation with the media engine
//!
//! # Example
//!
//! ```no_run
//! use peermux_webrtc::{Mesh, MeshConfig, PresencePeer, PresenceUpdate};
//! use peermux_core::PeerAddress;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = MeshConfig {
//!     local_address: PeerAddress::new("100.64.0.1"),
//!     ..Default::default()
//! };
//! let mesh = Arc::new(Mesh::with_defaults(config)?);
//! tokio::spawn(mesh.signaling_server().serve());
//!
//! mesh.apply_presence(PresenceUpdate {
//!     peers: vec![PresencePeer::online("100.64.0.2")],
//! })
//! .await;
//! # Ok::<(), peermux_webrtc::Error>(())
//! # });
//! ```

pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mesh;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod status;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channels::{AppStateHandler, ControlMessage, NoAppState};
pub use config::{MeshConfig, TurnServerConfig};
pub use dispatcher::{Dispatcher, PresencePeer, PresenceTransitions, PresenceUpdate};
pub use error::{Error, Result};
pub use mesh::{Mesh, MeshComponents};
pub use peer::{
    IceConnectionState, LocalTrack, NegotiationState, PeerConnection, PeerConnectionFactory,
    WebRtcBackend,
};
pub use session::{decide_role, Role, SessionIdentifier};
pub use signaling::{
    HttpSignalingRelay, SignalHandler, SignalingMessage, SignalingRelay, SignalingServer,
};
pub use status::{PeerState, PeerStatus, StatusBoard, StatusEvent, LATENCY_UNREACHABLE};
