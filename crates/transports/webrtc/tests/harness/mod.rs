//! Shared helpers for negotiation integration tests

#![allow(dead_code)]

use peermux_core::PeerAddress;
use peermux_webrtc::testing::{FakeRtcFactory, SignalingNetwork};
use peermux_webrtc::{
    Dispatcher, MeshConfig, NoAppState, PresencePeer, PresenceUpdate, SessionIdentifier,
    SignalHandler, StatusBoard,
};
use std::sync::{Arc, Weak};

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peermux_webrtc=debug")
        .try_init();
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// One dispatcher attached to an in-memory signaling network
pub struct Node {
    pub address: PeerAddress,
    pub dispatcher: Arc<Dispatcher>,
    pub rtc: Arc<FakeRtcFactory>,
}

impl Node {
    pub fn join(network: &Arc<SignalingNetwork>, address: &str, session_id: u128) -> Self {
        let address = PeerAddress::new(address);
        let rtc = Arc::new(FakeRtcFactory::new());
        let config = MeshConfig {
            local_address: address.clone(),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            Arc::new(config),
            SessionIdentifier::new(session_id),
            rtc.clone(),
            network.clone(),
            StatusBoard::default(),
            Arc::new(NoAppState),
        );

        let weak = Arc::downgrade(&dispatcher);
        let handler: Weak<dyn SignalHandler> = weak;
        network.register(address.clone(), handler);

        Self {
            address,
            dispatcher,
            rtc,
        }
    }

    /// Report `others` as the only online peers
    pub async fn sees_online(&self, others: &[&Node]) {
        self.dispatcher
            .apply_presence(PresenceUpdate {
                peers: others
                    .iter()
                    .map(|n| PresencePeer::online(n.address.clone()))
                    .collect(),
            })
            .await;
    }
}
