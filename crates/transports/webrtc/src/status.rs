//! Per-peer connection status for display
//!
//! Only two values are meant for users: the connection state and the
//! control-channel latency (`-1` when a ping timed out).

use crate::peer::IceConnectionState;
use crate::session::Role;
use dashmap::DashMap;
use peermux_core::PeerAddress;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Latency reported when a ping goes unanswered
pub const LATENCY_UNREACHABLE: i64 = -1;

/// Default event buffer for subscribers
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// User-visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Initializing,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<IceConnectionState> for PeerState {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New | IceConnectionState::Checking => PeerState::Initializing,
            IceConnectionState::Connected | IceConnectionState::Completed => PeerState::Connected,
            IceConnectionState::Disconnected => PeerState::Disconnected,
            IceConnectionState::Failed => PeerState::Failed,
            IceConnectionState::Closed => PeerState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub state: PeerState,
    pub latency_ms: i64,
    pub is_offerer: bool,
}

/// Change notification published by the [`StatusBoard`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    StateChanged { peer: PeerAddress, state: PeerState },
    LatencyUpdated { peer: PeerAddress, latency_ms: i64 },
    RoleDecided { peer: PeerAddress, role: Role },
    Removed { peer: PeerAddress },
}

/// Shared table of peer statuses with change notifications
#[derive(Clone)]
pub struct StatusBoard {
    peers: Arc<DashMap<PeerAddress, PeerStatus>>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl StatusBoard {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            peers: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Start tracking a peer once its role is known
    pub fn register(&self, peer: &PeerAddress, role: Role) {
        self.peers.insert(
            peer.clone(),
            PeerStatus {
                state: PeerState::Initializing,
                latency_ms: 0,
                is_offerer: role.is_offerer(),
            },
        );
        self.publish(StatusEvent::RoleDecided {
            peer: peer.clone(),
            role,
        });
    }

    /// Record an ICE state change; latency restarts from zero
    pub fn set_ice_state(&self, peer: &PeerAddress, ice: IceConnectionState) {
        self.set_state(peer, PeerState::from(ice));
        self.set_latency(peer, 0);
    }

    pub fn set_state(&self, peer: &PeerAddress, state: PeerState) {
        let changed = match self.peers.get_mut(peer) {
            Some(mut status) if status.state != state => {
                status.state = state;
                true
            }
            _ => false,
        };

        if changed {
            self.publish(StatusEvent::StateChanged {
                peer: peer.clone(),
                state,
            });
        }
    }

    pub fn set_latency(&self, peer: &PeerAddress, latency_ms: i64) {
        let updated = match self.peers.get_mut(peer) {
            Some(mut status) => {
                status.latency_ms = latency_ms;
                true
            }
            None => false,
        };

        if updated {
            self.publish(StatusEvent::LatencyUpdated {
                peer: peer.clone(),
                latency_ms,
            });
        }
    }

    pub fn remove(&self, peer: &PeerAddress) {
        if self.peers.remove(peer).is_some() {
            self.publish(StatusEvent::Removed { peer: peer.clone() });
        }
    }

    pub fn get(&self, peer: &PeerAddress) -> Option<PeerStatus> {
        self.peers.get(peer).map(|s| *s)
    }

    /// All tracked peers, sorted by address
    pub fn snapshot(&self) -> Vec<(PeerAddress, PeerStatus)> {
        let mut all: Vec<(PeerAddress, PeerStatus)> = self
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn clear(&self) {
        let peers: Vec<PeerAddress> = self.peers.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.remove(&peer);
        }
    }

    fn publish(&self, event: StatusEvent) {
        trace!("Status event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddress {
        PeerAddress::new("100.64.0.5")
    }

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(PeerState::from(IceConnectionState::Checking), PeerState::Initializing);
        assert_eq!(PeerState::from(IceConnectionState::Completed), PeerState::Connected);
        assert_eq!(PeerState::from(IceConnectionState::Disconnected), PeerState::Disconnected);
        assert_eq!(PeerState::from(IceConnectionState::Failed), PeerState::Failed);
        assert_eq!(PeerState::from(IceConnectionState::Closed), PeerState::Closed);
    }

    #[test]
    fn test_ice_change_resets_latency() {
        let board = StatusBoard::default();
        board.register(&peer(), Role::Answerer);
        board.set_latency(&peer(), 42);
        assert_eq!(board.get(&peer()).unwrap().latency_ms, 42);

        board.set_ice_state(&peer(), IceConnectionState::Connected);
        let status = board.get(&peer()).unwrap();
        assert_eq!(status.state, PeerState::Connected);
        assert_eq!(status.latency_ms, 0);
        assert!(!status.is_offerer);
    }

    #[test]
    fn test_events_published() {
        let board = StatusBoard::default();
        let mut events = board.subscribe();

        board.register(&peer(), Role::Offerer);
        board.set_state(&peer(), PeerState::Initializing);
        board.set_latency(&peer(), LATENCY_UNREACHABLE);
        board.remove(&peer());

        assert_eq!(
            events.try_recv().unwrap(),
            StatusEvent::RoleDecided {
                peer: peer(),
                role: Role::Offerer
            }
        );
        // Unchanged state publishes nothing
        assert_eq!(
            events.try_recv().unwrap(),
            StatusEvent::LatencyUpdated {
                peer: peer(),
                latency_ms: -1
            }
        );
        assert_eq!(events.try_recv().unwrap(), StatusEvent::Removed { peer: peer() });
        assert!(board.get(&peer()).is_none());
    }

    #[test]
    fn test_unknown_peer_ignored() {
        let board = StatusBoard::default();
        board.set_latency(&peer(), 10);
        board.set_state(&peer(), PeerState::Failed);
        assert!(board.snapshot().is_empty());
    }
}
