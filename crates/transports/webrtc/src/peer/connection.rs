//! Negotiation state machine for one remote peer
//!
//! The offerer builds a connection, gathers every candidate and sends a
//! single `offer-with-candidates`; the answerer mirrors it with one
//! `answer-with-candidates`. There is no trickle ICE. The answerer runs a
//! recovery timer that asks for a fresh offer while it has no working
//! connection.

use super::backend::{
    DataChannelLink, IceConnectionState, LocalTrack, PeerConnectionFactory, RtcEvent, RtcPeer,
};
use crate::channels::messages::message_type;
use crate::channels::{AppStateHandler, ControlMessage};
use crate::config::MeshConfig;
use crate::session::Role;
use crate::signaling::{
    IceCandidate, SenderInfo, SessionDescription, SignalingMessage, SignalingRelay,
};
use crate::status::{StatusBoard, LATENCY_UNREACHABLE};
use crate::{Error, Result};
use peermux_core::PeerAddress;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

/// Where a peer relationship is in its negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    RoleUnknown,
    /// Offerer building a connection and its offer
    Offering,
    /// Answerer with no connection yet
    WaitingForOffer,
    /// Description applied, gathering or checking candidates
    Negotiating,
    Connected,
    /// ICE dropped after having been up
    Reconnecting,
    Closed,
}

/// Collaborators shared by every connection of a node
#[derive(Clone)]
pub struct ConnectionContext {
    pub local: SenderInfo,
    pub config: Arc<MeshConfig>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub signaling: Arc<dyn SignalingRelay>,
    pub status: StatusBoard,
    pub app_state: Arc<dyn AppStateHandler>,
}

/// Mutable per-connection state, guarded by one lock
#[derive(Default)]
struct ConnectionRecord {
    /// Bumped on every reset; events and timers from older rounds are dropped
    generation: u64,
    rtc: Option<Arc<dyn RtcPeer>>,
    control: Option<Arc<dyn DataChannelLink>>,
    candidates: Vec<IceCandidate>,
    description_sent: bool,
    event_pump: Option<JoinHandle<()>>,
    ping_interval: Option<JoinHandle<()>>,
    ping_timeout: Option<JoinHandle<()>>,
    last_ping_sent: Option<Instant>,
    recovery_timer: Option<JoinHandle<()>>,
}

impl ConnectionRecord {
    fn timer_count(&self) -> usize {
        [
            &self.ping_interval,
            &self.ping_timeout,
            &self.recovery_timer,
        ]
        .iter()
        .filter(|t| t.is_some())
        .count()
    }
}

/// Connection to one remote peer
pub struct PeerConnection {
    peer: PeerAddress,
    connection_id: String,
    role: Role,
    ctx: ConnectionContext,
    state: watch::Sender<NegotiationState>,
    record: Mutex<ConnectionRecord>,
}

impl PeerConnection {
    pub fn new(peer: PeerAddress, role: Role, ctx: ConnectionContext) -> Arc<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "New connection {} to {} as {}",
            connection_id, peer, role
        );

        let (state, _) = watch::channel(NegotiationState::RoleUnknown);
        Arc::new(Self {
            peer,
            connection_id,
            role,
            ctx,
            state,
            record: Mutex::new(ConnectionRecord::default()),
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    /// Wait until the state machine reaches `target`
    pub async fn wait_for(&self, target: NegotiationState) {
        let mut rx = self.state.subscribe();
        // Sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|s| *s == target).await;
    }

    fn set_state(&self, next: NegotiationState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Peer {} negotiation: {:?} -> {:?}", self.peer, current, next);
            *current = next;
            true
        });
    }

    /// Begin the role's flow: offer now, or wait and watch for a stall
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.role.is_offerer() {
            return self.start_offer().await;
        }

        let mut record = self.record.lock().await;
        if record.recovery_timer.is_none() {
            record.recovery_timer = Some(self.spawn_recovery_timer());
        }
        drop(record);

        self.state.send_if_modified(|current| {
            if *current == NegotiationState::RoleUnknown {
                *current = NegotiationState::WaitingForOffer;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Offer flow; any earlier round is torn down first
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn start_offer(self: &Arc<Self>) -> Result<()> {
        let mut record = self.record.lock().await;
        self.reset(&mut record).await;
        self.set_state(NegotiationState::Offering);

        let rtc = self.create_rtc(&mut record).await?;
        let control = rtc
            .create_control_channel(
                &self.ctx.config.control_channel_label,
                self.ctx.config.control_channel_ordered,
            )
            .await?;
        record.control = Some(control);

        rtc.create_offer().await?;
        self.set_state(NegotiationState::Negotiating);
        info!("Offer created for {}, gathering candidates", self.peer);
        Ok(())
    }

    /// Answer flow for an inbound offer
    ///
    /// Replaces any current connection. The recovery timer keeps running so a
    /// lost answer is still recovered.
    #[instrument(skip(self, offer, candidates), fields(peer = %self.peer))]
    pub async fn handle_offer(
        self: &Arc<Self>,
        offer: SessionDescription,
        candidates: Vec<IceCandidate>,
    ) -> Result<()> {
        let mut record = self.record.lock().await;
        self.reset(&mut record).await;

        let rtc = self.create_rtc(&mut record).await?;
        rtc.accept_offer(&offer).await?;
        self.set_state(NegotiationState::Negotiating);
        info!(
            "Answer created for {}, applying {} remote candidates",
            self.peer,
            candidates.len()
        );

        self.apply_candidates(rtc.as_ref(), candidates).await;
        Ok(())
    }

    /// Apply the answer to our offer; ignored when no connection exists
    #[instrument(skip(self, answer, candidates), fields(peer = %self.peer))]
    pub async fn handle_answer(
        &self,
        answer: SessionDescription,
        candidates: Vec<IceCandidate>,
    ) -> Result<()> {
        let record = self.record.lock().await;
        let Some(rtc) = record.rtc.clone() else {
            debug!("No connection to {}, ignoring answer", self.peer);
            return Ok(());
        };

        rtc.apply_answer(&answer).await?;
        self.apply_candidates(rtc.as_ref(), candidates).await;
        Ok(())
    }

    async fn apply_candidates(&self, rtc: &dyn RtcPeer, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = rtc.add_ice_candidate(candidate).await {
                warn!("Failed to apply candidate from {}: {}", self.peer, e);
            }
        }
    }

    /// Swap an outbound track without renegotiating
    pub async fn replace_track(&self, track: LocalTrack) -> Result<()> {
        let rtc = self.record.lock().await.rtc.clone().ok_or_else(|| {
            Error::PeerConnectionError(format!("No connection to {}", self.peer))
        })?;
        rtc.replace_track(track).await
    }

    /// Push settings to the peer over the control channel
    pub async fn send_user_config(&self, config: serde_json::Value) -> Result<()> {
        let record = self.record.lock().await;
        self.send_control(&record, &ControlMessage::UserConfig { config })
            .await
    }

    /// Release everything: callbacks, control channel, timers and the connection
    ///
    /// Safe to call repeatedly.
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn teardown(&self) {
        let mut record = self.record.lock().await;
        if let Some(timer) = record.recovery_timer.take() {
            timer.abort();
        }
        self.reset(&mut record).await;
        self.set_state(NegotiationState::Closed);
    }

    pub async fn has_underlying_connection(&self) -> bool {
        self.record.lock().await.rtc.is_some()
    }

    /// Ping interval, ping timeout and recovery timers still scheduled
    pub async fn active_timers(&self) -> usize {
        self.record.lock().await.timer_count()
    }

    /// ICE state of the current connection, if there is one
    pub async fn ice_connection_state(&self) -> Option<IceConnectionState> {
        self.record
            .lock()
            .await
            .rtc
            .as_ref()
            .map(|rtc| rtc.ice_connection_state())
    }

    async fn reset(&self, record: &mut ConnectionRecord) {
        if let Some(rtc) = &record.rtc {
            rtc.detach();
        }
        if let Some(pump) = record.event_pump.take() {
            pump.abort();
        }
        if let Some(control) = record.control.take() {
            if let Err(e) = control.close().await {
                debug!("Closing control channel to {}: {}", self.peer, e);
            }
        }
        if let Some(interval) = record.ping_interval.take() {
            interval.abort();
        }
        if let Some(timeout) = record.ping_timeout.take() {
            timeout.abort();
        }
        record.last_ping_sent = None;
        if let Some(rtc) = record.rtc.take() {
            if let Err(e) = rtc.close().await {
                warn!("Failed to close connection to {}: {}", self.peer, e);
            }
        }
        record.candidates.clear();
        record.description_sent = false;
        record.generation += 1;
    }

    async fn create_rtc(self: &Arc<Self>, record: &mut ConnectionRecord) -> Result<Arc<dyn RtcPeer>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rtc = match self.ctx.factory.create(&self.peer, tx).await {
            Ok(rtc) => rtc,
            Err(e) => {
                warn!("Cannot create connection to {}: {}", self.peer, e);
                self.ctx
                    .status
                    .set_state(&self.peer, crate::status::PeerState::Failed);
                return Err(e);
            }
        };

        record.rtc = Some(Arc::clone(&rtc));
        record.event_pump = Some(self.spawn_event_pump(record.generation, rx));
        Ok(rtc)
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<RtcEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                conn.handle_rtc_event(generation, event).await;
            }
        })
    }

    async fn handle_rtc_event(self: &Arc<Self>, generation: u64, event: RtcEvent) {
        trace!("Event from {}: {:?}", self.peer, event);

        match event {
            RtcEvent::IceCandidate(candidate) => {
                let mut record = self.record.lock().await;
                if record.generation != generation {
                    return;
                }
                if record.description_sent {
                    debug!("Dropping candidate gathered after description was sent");
                } else {
                    record.candidates.push(candidate);
                }
            }
            RtcEvent::GatheringComplete => self.send_description(generation).await,
            RtcEvent::IceConnectionState(ice) => {
                if self.record.lock().await.generation != generation {
                    return;
                }
                info!("ICE connection to {} is {}", self.peer, ice);
                self.ctx.status.set_ice_state(&self.peer, ice);
                if ice.is_connected() {
                    self.set_state(NegotiationState::Connected);
                } else if ice.needs_offer() {
                    self.set_state(NegotiationState::Reconnecting);
                }
            }
            RtcEvent::DataChannel(link) => {
                let mut record = self.record.lock().await;
                if record.generation != generation {
                    return;
                }
                debug!("Control channel '{}' from {}", link.label(), self.peer);
                record.control = Some(link);
            }
            RtcEvent::ChannelOpen => self.on_control_open(generation).await,
            RtcEvent::ChannelMessage(text) => self.on_control_message(generation, &text).await,
            RtcEvent::ChannelClosed => {
                let mut record = self.record.lock().await;
                if record.generation != generation {
                    return;
                }
                debug!("Control channel to {} closed", self.peer);
                if let Some(interval) = record.ping_interval.take() {
                    interval.abort();
                }
                if let Some(timeout) = record.ping_timeout.take() {
                    timeout.abort();
                }
                record.last_ping_sent = None;
            }
        }
    }

    /// Send the local description with every buffered candidate, once per round
    async fn send_description(&self, generation: u64) {
        let message = {
            let mut record = self.record.lock().await;
            if record.generation != generation || record.description_sent {
                return;
            }
            let Some(rtc) = record.rtc.clone() else {
                return;
            };
            let Some(description) = rtc.local_description().await else {
                warn!("Gathering completed without a local description");
                return;
            };

            record.description_sent = true;
            let candidates = std::mem::take(&mut record.candidates);
            let sender = self.ctx.local.clone();
            match self.role {
                Role::Offerer => SignalingMessage::OfferWithCandidates {
                    sender,
                    offer: description,
                    candidates,
                },
                Role::Answerer => SignalingMessage::AnswerWithCandidates {
                    sender,
                    answer: description,
                    candidates,
                },
            }
        };

        info!("Sending {} to {}", message.kind(), self.peer);
        if let Err(e) = self.ctx.signaling.send(&self.peer, &message).await {
            warn!("Failed to send {} to {}: {}", message.kind(), self.peer, e);
        }
    }

    async fn on_control_open(self: &Arc<Self>, generation: u64) {
        let mut record = self.record.lock().await;
        if record.generation != generation {
            return;
        }
        info!("Control channel to {} open", self.peer);

        let snapshot = ControlMessage::SyncStatus {
            status: self.ctx.app_state.snapshot(),
        };
        if let Err(e) = self.send_control(&record, &snapshot).await {
            warn!("Failed to send state snapshot to {}: {}", self.peer, e);
        }

        if let Some(previous) = record.ping_interval.take() {
            previous.abort();
        }
        record.ping_interval = Some(self.spawn_ping_interval(generation));
    }

    async fn on_control_message(&self, generation: u64, text: &str) {
        let message = match ControlMessage::from_text(text) {
            Ok(message) => message,
            Err(e) => {
                match message_type(text) {
                    Some(kind) => warn!("Ignoring unknown control message '{}' from {}", kind, self.peer),
                    None => warn!("Ignoring malformed control message from {}: {}", self.peer, e),
                }
                return;
            }
        };

        match message {
            ControlMessage::Ping { timestamp } => {
                let record = self.record.lock().await;
                if record.generation != generation {
                    return;
                }
                if let Err(e) = self
                    .send_control(&record, &ControlMessage::Pong { timestamp })
                    .await
                {
                    debug!("Failed to answer ping from {}: {}", self.peer, e);
                }
            }
            ControlMessage::Pong { .. } => {
                let mut record = self.record.lock().await;
                if record.generation != generation {
                    return;
                }
                let Some(sent_at) = record.last_ping_sent.take() else {
                    debug!("Unsolicited pong from {}", self.peer);
                    return;
                };
                if let Some(timeout) = record.ping_timeout.take() {
                    timeout.abort();
                }
                let latency = sent_at.elapsed().as_millis() as i64;
                trace!("Latency to {}: {}ms", self.peer, latency);
                self.ctx.status.set_latency(&self.peer, latency);
            }
            ControlMessage::UserConfig { config } => {
                self.ctx.app_state.on_user_config(&self.peer, config);
            }
            ControlMessage::SyncStatus { status } => {
                self.ctx.app_state.on_sync_status(&self.peer, status);
            }
        }
    }

    async fn send_control(&self, record: &ConnectionRecord, message: &ControlMessage) -> Result<()> {
        let control = record.control.as_ref().ok_or_else(|| {
            Error::DataChannelError(format!("No control channel to {}", self.peer))
        })?;
        if !control.is_open() {
            return Err(Error::DataChannelError(format!(
                "Control channel to {} is not open",
                self.peer
            )));
        }
        control.send_text(message.to_text()?).await
    }

    fn spawn_ping_interval(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.ctx.config.ping_interval();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                conn.send_ping(generation).await;
            }
        })
    }

    /// One outstanding ping at a time
    async fn send_ping(self: &Arc<Self>, generation: u64) {
        let mut record = self.record.lock().await;
        if record.generation != generation || record.ping_timeout.is_some() {
            return;
        }

        if let Err(e) = self.send_control(&record, &ControlMessage::ping_now()).await {
            debug!("Ping to {} not sent: {}", self.peer, e);
            return;
        }

        record.last_ping_sent = Some(Instant::now());
        record.ping_timeout = Some(spawn_ping_timeout(
            Arc::downgrade(self),
            generation,
            self.ctx.config.ping_timeout(),
        ));
    }

    async fn on_ping_timeout(&self, generation: u64) {
        let mut record = self.record.lock().await;
        if record.generation != generation {
            return;
        }
        // Own handle; dropping it does not cancel this task
        record.ping_timeout.take();
        record.last_ping_sent = None;
        drop(record);

        warn!("Ping to {} timed out", self.peer);
        self.ctx.status.set_latency(&self.peer, LATENCY_UNREACHABLE);
    }

    fn spawn_recovery_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.ctx.config.ask_offer_interval();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                conn.recover_if_stalled().await;
            }
        })
    }

    /// Ask the offerer for a new offer while we have no working connection
    async fn recover_if_stalled(&self) {
        let stalled = match self.record.lock().await.rtc.as_ref() {
            None => true,
            Some(rtc) => rtc.ice_connection_state().needs_offer(),
        };
        if !stalled {
            return;
        }

        debug!("Connection to {} stalled, asking for an offer", self.peer);
        let message = SignalingMessage::AskOffer {
            sender: self.ctx.local.clone(),
        };
        if let Err(e) = self.ctx.signaling.send(&self.peer, &message).await {
            debug!("ask-offer to {} not delivered: {}", self.peer, e);
        }
    }
}

fn spawn_ping_timeout(
    conn: Weak<PeerConnection>,
    generation: u64,
    timeout: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(timeout).await;
        if let Some(conn) = conn.upgrade() {
            conn.on_ping_timeout(generation).await;
        }
    })
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}
