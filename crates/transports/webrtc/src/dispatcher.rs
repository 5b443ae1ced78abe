//! Connection directory
//!
//! Owns at most one [`PeerConnection`] per remote peer. Presence changes
//! start the session identifier exchange or tear connections down; inbound
//! signaling is routed to the sender's connection, or parked until that
//! connection exists.

use crate::channels::AppStateHandler;
use crate::config::MeshConfig;
use crate::peer::{ConnectionContext, PeerConnection, PeerConnectionFactory};
use crate::session::{decide_role, Role, SessionIdentifier};
use crate::signaling::{SenderInfo, SignalHandler, SignalingMessage, SignalingRelay};
use crate::status::StatusBoard;
use crate::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use peermux_core::PeerAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// One peer in a presence snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePeer {
    pub address: PeerAddress,
    pub online: bool,
}

impl PresencePeer {
    pub fn online(address: impl Into<PeerAddress>) -> Self {
        Self {
            address: address.into(),
            online: true,
        }
    }

    pub fn offline(address: impl Into<PeerAddress>) -> Self {
        Self {
            address: address.into(),
            online: false,
        }
    }
}

/// Full snapshot of known peers from the presence feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub peers: Vec<PresencePeer>,
}

/// Peers whose presence changed in one snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceTransitions {
    pub came_online: Vec<PeerAddress>,
    pub went_offline: Vec<PeerAddress>,
}

/// Directory of peer connections for this node
pub struct Dispatcher {
    session_id: SessionIdentifier,
    ctx: ConnectionContext,
    connections: DashMap<PeerAddress, Arc<PeerConnection>>,
    pending: DashMap<PeerAddress, SignalingMessage>,
    exchanges: DashMap<PeerAddress, JoinHandle<()>>,
    presence: Mutex<HashMap<PeerAddress, bool>>,
    /// Serialises "lookup or park" against "insert and take parked"
    routing: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<MeshConfig>,
        session_id: SessionIdentifier,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingRelay>,
        status: StatusBoard,
        app_state: Arc<dyn AppStateHandler>,
    ) -> Arc<Self> {
        let local = SenderInfo {
            ipv4: config.local_address.clone(),
            ipv6: config.local_ipv6.clone(),
        };
        info!(
            "Dispatcher for {} with session identifier {}",
            local.ipv4, session_id
        );

        Arc::new(Self {
            session_id,
            ctx: ConnectionContext {
                local,
                config,
                factory,
                signaling,
                status,
                app_state,
            },
            connections: DashMap::new(),
            pending: DashMap::new(),
            exchanges: DashMap::new(),
            presence: Mutex::new(HashMap::new()),
            routing: Mutex::new(()),
        })
    }

    pub fn session_id(&self) -> SessionIdentifier {
        self.session_id
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.ctx.local.ipv4
    }

    pub fn status(&self) -> &StatusBoard {
        &self.ctx.status
    }

    pub fn connection(&self, peer: &PeerAddress) -> Option<Arc<PeerConnection>> {
        self.connections.get(peer).map(|c| Arc::clone(c.value()))
    }

    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Message parked for a peer that has no connection yet
    pub fn pending_message(&self, peer: &PeerAddress) -> Option<SignalingMessage> {
        self.pending.get(peer).map(|m| m.value().clone())
    }

    pub fn is_exchanging(&self, peer: &PeerAddress) -> bool {
        self.exchanges.contains_key(peer)
    }

    /// Diff a presence snapshot against the last one and react to changes
    ///
    /// Peers missing from the snapshot count as offline.
    pub async fn apply_presence(self: &Arc<Self>, update: PresenceUpdate) -> PresenceTransitions {
        let transitions = {
            let mut known = self.presence.lock();
            let next: HashMap<PeerAddress, bool> = update
                .peers
                .into_iter()
                .filter(|p| p.address != self.ctx.local.ipv4)
                .map(|p| (p.address, p.online))
                .collect();

            let mut transitions = PresenceTransitions::default();
            for (peer, online) in &next {
                let was_online = known.get(peer).copied().unwrap_or(false);
                if *online && !was_online {
                    transitions.came_online.push(peer.clone());
                } else if !*online && was_online {
                    transitions.went_offline.push(peer.clone());
                }
            }
            for (peer, was_online) in known.iter() {
                if *was_online && !next.contains_key(peer) {
                    transitions.went_offline.push(peer.clone());
                }
            }

            *known = next;
            transitions.came_online.sort();
            transitions.went_offline.sort();
            transitions
        };

        for peer in &transitions.went_offline {
            self.peer_offline(peer).await;
        }
        for peer in &transitions.came_online {
            self.peer_online(peer.clone());
        }
        transitions
    }

    /// Start the identifier exchange unless one is running or a connection exists
    ///
    /// The first attempt goes out immediately, then one per
    /// `role_exchange_interval` until the peer replies.
    pub fn peer_online(self: &Arc<Self>, peer: PeerAddress) {
        if peer == self.ctx.local.ipv4 || self.connections.contains_key(&peer) {
            return;
        }

        let Entry::Vacant(slot) = self.exchanges.entry(peer.clone()) else {
            debug!("Identifier exchange with {} already running", peer);
            return;
        };

        info!("Peer {} online, exchanging session identifiers", peer);
        let weak = Arc::downgrade(self);
        let period = self.ctx.config.role_exchange_interval();
        slot.insert(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                match dispatcher.exchange_identifiers(&peer).await {
                    Ok(Some(role)) => {
                        dispatcher.create_connection(peer.clone(), role).await;
                        dispatcher.exchanges.remove(&peer);
                        break;
                    }
                    Ok(None) => debug!("No identifier from {} yet", peer),
                    Err(e) => debug!("Identifier exchange with {} failed: {}", peer, e),
                }
            }
        }));
    }

    async fn exchange_identifiers(&self, peer: &PeerAddress) -> Result<Option<Role>> {
        let request = SignalingMessage::Uuid {
            sender: self.ctx.local.clone(),
            uuid: self.session_id,
        };

        match self.ctx.signaling.send(peer, &request).await? {
            Some(SignalingMessage::Uuid { uuid, .. }) => {
                let role = decide_role(self.session_id, uuid, &self.ctx.local.ipv4, peer);
                info!(
                    "Session identifiers {} (local) / {} ({}): local is {}",
                    self.session_id, uuid, peer, role
                );
                Ok(Some(role))
            }
            Some(other) => {
                debug!("Unexpected {} reply to uuid from {}", other.kind(), peer);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Create the single connection for `peer`, start it and replay its parked message
    ///
    /// Returns the existing connection if there already is one; nothing is
    /// replayed in that case.
    #[instrument(skip(self), fields(peer = %peer))]
    pub async fn create_connection(
        self: &Arc<Self>,
        peer: PeerAddress,
        role: Role,
    ) -> Arc<PeerConnection> {
        let (conn, parked) = {
            let _routing = self.routing.lock();
            match self.connections.entry(peer.clone()) {
                Entry::Occupied(existing) => return Arc::clone(existing.get()),
                Entry::Vacant(slot) => {
                    let conn = PeerConnection::new(peer.clone(), role, self.ctx.clone());
                    slot.insert(Arc::clone(&conn));
                    (conn, self.pending.remove(&peer).map(|(_, m)| m))
                }
            }
        };

        self.ctx.status.register(&peer, role);
        if let Err(e) = conn.start().await {
            warn!("Failed to start {} flow with {}: {}", role, peer, e);
        }

        if let Some(message) = parked {
            self.replay(&conn, message).await;
        }
        conn
    }

    async fn replay(&self, conn: &Arc<PeerConnection>, message: SignalingMessage) {
        if let SignalingMessage::AskOffer { .. } = message {
            debug!("Dropping parked ask-offer from {}", conn.peer());
            return;
        }

        debug!("Replaying parked {} from {}", message.kind(), conn.peer());
        if let Err(e) = deliver(conn, message).await {
            warn!("Parked message for {} failed: {}", conn.peer(), e);
        }
    }

    /// Tear down everything held for `peer`
    #[instrument(skip(self), fields(peer = %peer))]
    pub async fn peer_offline(&self, peer: &PeerAddress) {
        if let Some((_, exchange)) = self.exchanges.remove(peer) {
            exchange.abort();
        }

        let conn = {
            let _routing = self.routing.lock();
            self.pending.remove(peer);
            self.connections.remove(peer).map(|(_, c)| c)
        };
        if let Some(conn) = conn {
            info!("Peer {} offline, closing connection", peer);
            conn.teardown().await;
        }

        self.ctx.status.remove(peer);
    }

    /// Stop every exchange and connection
    pub async fn shutdown(&self) {
        let peers: Vec<PeerAddress> = self
            .exchanges
            .iter()
            .map(|e| e.key().clone())
            .chain(self.connections.iter().map(|c| c.key().clone()))
            .collect();

        for peer in peers {
            self.peer_offline(&peer).await;
        }
        self.pending.clear();
        self.presence.lock().clear();
        info!("Dispatcher shut down");
    }
}

async fn deliver(conn: &Arc<PeerConnection>, message: SignalingMessage) -> Result<()> {
    match message {
        SignalingMessage::AskOffer { .. } => {
            if conn.role().is_offerer() {
                info!("{} asked for an offer, restarting", conn.peer());
                conn.start_offer().await
            } else {
                debug!("Ignoring ask-offer from {}; local side answers", conn.peer());
                Ok(())
            }
        }
        SignalingMessage::OfferWithCandidates {
            offer, candidates, ..
        } => conn.handle_offer(offer, candidates).await,
        SignalingMessage::AnswerWithCandidates {
            answer, candidates, ..
        } => conn.handle_answer(answer, candidates).await,
        SignalingMessage::Uuid { .. } => Ok(()),
    }
}

#[async_trait]
impl SignalHandler for Dispatcher {
    async fn handle_signal(&self, message: SignalingMessage) -> Result<Option<SignalingMessage>> {
        let sender = message.sender().ipv4.clone();

        if let SignalingMessage::Uuid { uuid, .. } = &message {
            debug!("Session identifier {} from {}", uuid, sender);
            return Ok(Some(SignalingMessage::Uuid {
                sender: self.ctx.local.clone(),
                uuid: self.session_id,
            }));
        }

        let conn = {
            let _routing = self.routing.lock();
            match self.connections.get(&sender) {
                Some(conn) => Some(Arc::clone(conn.value())),
                None => {
                    debug!("No connection to {} yet, parking {}", sender, message.kind());
                    self.pending.insert(sender.clone(), message.clone());
                    None
                }
            }
        };

        if let Some(conn) = conn {
            if let Err(e) = deliver(&conn, message).await {
                warn!("Signaling from {} not applied: {}", sender, e);
            }
        }
        Ok(None)
    }
}
