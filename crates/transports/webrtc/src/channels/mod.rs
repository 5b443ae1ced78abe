//! Control data channel
//!
//! One data channel per peer connection carries liveness pings and
//! application state. The offerer creates it; the answerer receives it.

pub mod messages;

pub use messages::{ControlMessage, MAX_MESSAGE_SIZE};

use peermux_core::PeerAddress;
use serde_json::Value;

/// Application collaborator for state carried over the control channel
pub trait AppStateHandler: Send + Sync {
    /// Snapshot sent to a peer as soon as its control channel opens
    fn snapshot(&self) -> Value;

    /// A peer sent its state snapshot
    fn on_sync_status(&self, peer: &PeerAddress, status: Value);

    /// A peer pushed settings for this node
    fn on_user_config(&self, peer: &PeerAddress, config: Value);
}

/// State handler with an empty snapshot that ignores inbound state
#[derive(Debug, Default)]
pub struct NoAppState;

impl AppStateHandler for NoAppState {
    fn snapshot(&self) -> Value {
        Value::Object(Default::default())
    }

    fn on_sync_status(&self, _peer: &PeerAddress, _status: Value) {}

    fn on_user_config(&self, _peer: &PeerAddress, _config: Value) {}
}
