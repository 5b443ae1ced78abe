//! In-memory collaborators for negotiation tests
//!
//! A scriptable RTC backend, a recording signaling relay, an in-memory
//! signaling network that wires several dispatchers together, and an
//! application state handler that records what it receives.

use crate::channels::messages::message_type;
use crate::channels::AppStateHandler;
use crate::peer::{
    DataChannelLink, IceConnectionState, LocalTrack, PeerConnectionFactory, RtcEvent,
    RtcEventSender, RtcPeer,
};
use crate::signaling::{
    IceCandidate, SessionDescription, SignalHandler, SignalingMessage, SignalingRelay,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use peermux_core::{MediaKind, PeerAddress};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Shared event queue of one fake connection
#[derive(Clone, Default)]
struct FakeSink {
    tx: Arc<Mutex<Option<RtcEventSender>>>,
}

impl FakeSink {
    fn emit(&self, event: RtcEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Data channel that records outbound text
pub struct FakeDataChannel {
    label: String,
    ordered: bool,
    sink: FakeSink,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    closed: bool,
    sent: Vec<String>,
}

impl FakeDataChannel {
    fn new(label: &str, ordered: bool, sink: FakeSink) -> Self {
        Self {
            label: label.to_string(),
            ordered,
            sink,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Transition to open and notify the connection
    pub fn open(&self) {
        self.state.lock().open = true;
        self.sink.emit(RtcEvent::ChannelOpen);
    }

    /// Deliver a text frame from the remote side
    pub fn receive(&self, text: &str) {
        self.sink.emit(RtcEvent::ChannelMessage(text.to_string()));
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Sent frames whose `type` tag equals `kind`
    pub fn sent_of_type(&self, kind: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|text| message_type(text).as_deref() == Some(kind))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl DataChannelLink for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::DataChannelError("channel not open".to_string()));
        }
        state.sent.push(text);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        state.closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct RtcState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    control: Option<Arc<FakeDataChannel>>,
    remote_channel: Option<Arc<FakeDataChannel>>,
    senders: Vec<MediaKind>,
    replaced: Vec<String>,
    ice: Option<IceConnectionState>,
    detached: bool,
    closes: usize,
}

/// Scriptable RTC connection
pub struct FakeRtcPeer {
    peer: PeerAddress,
    sink: FakeSink,
    state: Mutex<RtcState>,
}

impl FakeRtcPeer {
    fn new(peer: PeerAddress, events: RtcEventSender) -> Self {
        Self {
            peer,
            sink: FakeSink {
                tx: Arc::new(Mutex::new(Some(events))),
            },
            state: Mutex::new(RtcState {
                senders: vec![MediaKind::Audio, MediaKind::Video],
                ..Default::default()
            }),
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Report a gathered local candidate
    pub fn gather(&self, candidate: &str) {
        self.sink
            .emit(RtcEvent::IceCandidate(IceCandidate::new(candidate)));
    }

    pub fn complete_gathering(&self) {
        self.sink.emit(RtcEvent::GatheringComplete);
    }

    pub fn set_ice_state(&self, state: IceConnectionState) {
        self.state.lock().ice = Some(state);
        self.sink.emit(RtcEvent::IceConnectionState(state));
    }

    /// Simulate the remote side opening a data channel
    pub fn announce_channel(&self, label: &str) {
        let channel = Arc::new(FakeDataChannel::new(label, false, self.sink.clone()));
        self.state.lock().remote_channel = Some(Arc::clone(&channel));
        self.sink.emit(RtcEvent::DataChannel(channel));
    }

    /// Channel created locally with `create_control_channel`
    pub fn control(&self) -> Option<Arc<FakeDataChannel>> {
        self.state.lock().control.clone()
    }

    pub fn remote_channel(&self) -> Option<Arc<FakeDataChannel>> {
        self.state.lock().remote_channel.clone()
    }

    /// (label, ordered) of every locally created channel
    pub fn control_channels(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .control
            .iter()
            .map(|c| (c.label.clone(), c.ordered))
            .collect()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    /// Ids of tracks swapped in with `replace_track`
    pub fn replaced(&self) -> Vec<String> {
        self.state.lock().replaced.clone()
    }

    pub fn remove_sender(&self, kind: MediaKind) {
        self.state.lock().senders.retain(|k| *k != kind);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closes > 0
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }
}

#[async_trait]
impl RtcPeer for FakeRtcPeer {
    async fn create_control_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannelLink>> {
        let channel = Arc::new(FakeDataChannel::new(label, ordered, self.sink.clone()));
        self.state.lock().control = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer(format!("v=0\r\ns=offer-to-{}\r\n", self.peer));
        self.state.lock().local = Some(offer.clone());
        Ok(offer)
    }

    async fn accept_offer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        let answer = SessionDescription::answer(format!("v=0\r\ns=answer-to-{}\r\n", self.peer));
        let mut state = self.state.lock();
        state.remote = Some(offer.clone());
        state.local = Some(answer.clone());
        Ok(answer)
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        self.state.lock().remote = Some(answer.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::IceCandidateError(format!(
                "unparsable candidate {}",
                candidate.candidate
            )));
        }
        self.state.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice.unwrap_or(IceConnectionState::New)
    }

    async fn replace_track(&self, track: LocalTrack) -> Result<()> {
        let mut state = self.state.lock();
        if !state.senders.contains(&track.kind()) {
            return Err(Error::NoMatchingSender(format!("{:?}", track.kind())));
        }
        state.replaced.push(track.id().to_string());
        Ok(())
    }

    fn detach(&self) {
        self.sink.tx.lock().take();
        self.state.lock().detached = true;
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closes += 1;
        state.ice = Some(IceConnectionState::Closed);
        Ok(())
    }
}

/// Factory handing out [`FakeRtcPeer`]s
#[derive(Default)]
pub struct FakeRtcFactory {
    created: Mutex<Vec<Arc<FakeRtcPeer>>>,
    fail: Mutex<bool>,
}

impl FakeRtcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creation fail, as when connection handles are exhausted
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn created(&self) -> Vec<Arc<FakeRtcPeer>> {
        self.created.lock().clone()
    }

    /// Most recently created connection
    pub fn last(&self) -> Option<Arc<FakeRtcPeer>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeRtcFactory {
    async fn create(&self, peer: &PeerAddress, events: RtcEventSender) -> Result<Arc<dyn RtcPeer>> {
        if *self.fail.lock() {
            return Err(Error::PeerConnectionError(
                "connection handles exhausted".to_string(),
            ));
        }
        let rtc = Arc::new(FakeRtcPeer::new(peer.clone(), events));
        self.created.lock().push(Arc::clone(&rtc));
        Ok(rtc)
    }
}

/// Relay that records outbound messages and answers `uuid` with a fixed reply
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<(PeerAddress, SignalingMessage)>>,
    uuid_reply: Mutex<Option<SignalingMessage>>,
    unreachable: Mutex<bool>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_uuid_reply(&self, reply: Option<SignalingMessage>) {
        *self.uuid_reply.lock() = reply;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    pub fn sent(&self) -> Vec<(PeerAddress, SignalingMessage)> {
        self.sent.lock().clone()
    }

    pub fn sent_of_kind(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|(_, m)| m.kind() == kind).count()
    }
}

#[async_trait]
impl SignalingRelay for RecordingSignaling {
    async fn send(
        &self,
        to: &PeerAddress,
        message: &SignalingMessage,
    ) -> Result<Option<SignalingMessage>> {
        self.sent.lock().push((to.clone(), message.clone()));
        if *self.unreachable.lock() {
            return Err(Error::SignalingDeliveryFailure(format!("{} unreachable", to)));
        }
        Ok(match message {
            SignalingMessage::Uuid { .. } => self.uuid_reply.lock().clone(),
            _ => None,
        })
    }
}

/// Routes signaling between handlers registered by address
#[derive(Default)]
pub struct SignalingNetwork {
    handlers: Mutex<HashMap<PeerAddress, Weak<dyn SignalHandler>>>,
    log: Mutex<Vec<(PeerAddress, PeerAddress, SignalingMessage)>>,
}

impl SignalingNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handler receiving messages addressed to `address`
    pub fn register(&self, address: PeerAddress, handler: Weak<dyn SignalHandler>) {
        self.handlers.lock().insert(address, handler);
    }

    pub fn unregister(&self, address: &PeerAddress) {
        self.handlers.lock().remove(address);
    }

    /// Every delivery attempt as (from, to, message)
    pub fn log(&self) -> Vec<(PeerAddress, PeerAddress, SignalingMessage)> {
        self.log.lock().clone()
    }

    pub fn count(&self, from: &PeerAddress, to: &PeerAddress, kind: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(f, t, m)| f == from && t == to && m.kind() == kind)
            .count()
    }
}

#[async_trait]
impl SignalingRelay for SignalingNetwork {
    async fn send(
        &self,
        to: &PeerAddress,
        message: &SignalingMessage,
    ) -> Result<Option<SignalingMessage>> {
        self.log
            .lock()
            .push((message.sender().ipv4.clone(), to.clone(), message.clone()));

        let handler = self.handlers.lock().get(to).and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.handle_signal(message.clone()).await,
            None => Err(Error::SignalingDeliveryFailure(format!(
                "no route to {}",
                to
            ))),
        }
    }
}

/// State handler returning a fixed snapshot and recording inbound state
pub struct StaticAppState {
    snapshot: Value,
    statuses: Mutex<Vec<Value>>,
    configs: Mutex<Vec<Value>>,
}

impl StaticAppState {
    pub fn new(snapshot: Value) -> Self {
        Self {
            snapshot,
            statuses: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        }
    }

    pub fn statuses(&self) -> Vec<Value> {
        self.statuses.lock().clone()
    }

    pub fn configs(&self) -> Vec<Value> {
        self.configs.lock().clone()
    }
}

impl AppStateHandler for StaticAppState {
    fn snapshot(&self) -> Value {
        self.snapshot.clone()
    }

    fn on_sync_status(&self, _peer: &PeerAddress, status: Value) {
        self.statuses.lock().push(status);
    }

    fn on_user_config(&self, _peer: &PeerAddress, config: Value) {
        self.configs.lock().push(config);
    }
}
