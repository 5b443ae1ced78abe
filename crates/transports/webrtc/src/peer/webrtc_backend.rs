//! webrtc-rs implementation of the RTC backend

use super::backend::{
    DataChannelLink, IceConnectionState, LocalTrack, PeerConnectionFactory, RtcEvent,
    RtcEventSender, RtcPeer,
};
use crate::config::MeshConfig;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use peermux_core::{MediaKind, PeerAddress};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

/// Stream id shared by the placeholder tracks
const STREAM_ID: &str = "peermux";

/// Forwards stack callbacks into the connection's event queue until detached
#[derive(Clone)]
struct EventSink {
    tx: Arc<Mutex<Option<RtcEventSender>>>,
}

impl EventSink {
    fn new(tx: RtcEventSender) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    fn emit(&self, event: RtcEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // Receiver gone means the connection was reset
            let _ = tx.send(event);
        }
    }

    fn detach(&self) {
        self.tx.lock().take();
    }
}

/// Builds `RTCPeerConnection`s with default codecs and interceptors
pub struct WebRtcBackend {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcBackend {
    pub fn new(config: &MeshConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        Self { ice_servers }
    }

    fn build_api() -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcBackend {
    #[instrument(skip(self, events), fields(peer = %peer))]
    async fn create(&self, peer: &PeerAddress, events: RtcEventSender) -> Result<Arc<dyn RtcPeer>> {
        let api = Self::build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let sink = EventSink::new(events);
        register_callbacks(&pc, &sink, peer);

        for placeholder in [
            LocalTrack::opus("audio", STREAM_ID),
            LocalTrack::vp9("video", STREAM_ID),
        ] {
            pc.add_track(placeholder.track()).await.map_err(|e| {
                Error::PeerConnectionError(format!(
                    "Failed to add placeholder {:?} track: {}",
                    placeholder.kind(),
                    e
                ))
            })?;
        }

        info!("Created peer connection for {}", peer);

        Ok(Arc::new(WebRtcPeer {
            peer: peer.clone(),
            pc,
            sink,
        }))
    }
}

fn register_callbacks(pc: &RTCPeerConnection, sink: &EventSink, peer: &PeerAddress) {
    let sink_clone = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink_clone.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(RtcEvent::IceCandidate(init.into())),
                Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
            }
        })
    }));

    let sink_clone = sink.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let sink = sink_clone.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete {
                sink.emit(RtcEvent::GatheringComplete);
            }
        })
    }));

    let sink_clone = sink.clone();
    let peer_clone = peer.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = sink_clone.clone();
        let peer = peer_clone.clone();
        Box::pin(async move {
            debug!("ICE connection state for {}: {}", peer, state);
            if let Some(state) = map_ice_state(state) {
                sink.emit(RtcEvent::IceConnectionState(state));
            }
        })
    }));

    let sink_clone = sink.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let sink = sink_clone.clone();
        Box::pin(async move {
            debug!("Remote data channel '{}' announced", channel.label());
            let link = Arc::new(WebRtcDataChannel { channel });
            sink.emit(RtcEvent::DataChannel(link.clone()));
            link.register(&sink);
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

/// `RTCDataChannel` wrapper emitting open/message/close events
struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    fn register(&self, sink: &EventSink) {
        let sink_clone = sink.clone();
        let label = self.channel.label().to_string();
        self.channel.on_open(Box::new(move || {
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                sink_clone.emit(RtcEvent::ChannelOpen);
            })
        }));

        let sink_clone = sink.clone();
        self.channel
            .on_message(Box::new(move |message: DataChannelMessage| {
                let sink = sink_clone.clone();
                Box::pin(async move {
                    if !message.is_string {
                        debug!("Ignoring {} byte binary control message", message.data.len());
                        return;
                    }
                    match String::from_utf8(message.data.to_vec()) {
                        Ok(text) => sink.emit(RtcEvent::ChannelMessage(text)),
                        Err(e) => warn!("Control message is not UTF-8: {}", e),
                    }
                })
            }));

        let sink_clone = sink.clone();
        let label = self.channel.label().to_string();
        self.channel.on_close(Box::new(move || {
            let sink = sink_clone.clone();
            let label = label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                sink.emit(RtcEvent::ChannelClosed);
            })
        }));

        let label = self.channel.label().to_string();
        self.channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
            })
        }));
    }
}

#[async_trait]
impl DataChannelLink for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.channel
            .send_text(text)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send message: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))
    }
}

/// One `RTCPeerConnection` and its event sink
struct WebRtcPeer {
    peer: PeerAddress,
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
}

impl WebRtcPeer {
    async fn current_local_description(&self, what: &str) -> Result<SessionDescription> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError(format!("No local description after setting {}", what)))?;
        SessionDescription::from_rtc(&desc)
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_control_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannelLink>> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };

        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        let link = WebRtcDataChannel { channel };
        link.register(&self.sink);
        Ok(Arc::new(link))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP offer for peer {}", self.peer);
        self.current_local_description("offer").await
    }

    async fn accept_offer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(Error::SdpError(format!(
                "Expected an offer, got {:?}",
                offer.kind
            )));
        }

        self.pc
            .set_remote_description(offer.to_rtc()?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP answer for peer {}", self.peer);
        self.current_local_description("answer").await
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(answer.to_rtc()?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        SessionDescription::from_rtc(&desc).ok()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state()).unwrap_or(IceConnectionState::New)
    }

    async fn replace_track(&self, track: LocalTrack) -> Result<()> {
        let wanted = codec_type(track.kind());

        for sender in self.pc.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() != wanted {
                continue;
            }

            sender
                .replace_track(Some(track.track()))
                .await
                .map_err(|e| {
                    Error::PeerConnectionError(format!("Failed to replace track: {}", e))
                })?;
            debug!("Replaced {:?} track for peer {}", track.kind(), self.peer);
            return Ok(());
        }

        Err(Error::NoMatchingSender(format!(
            "{:?} sender on connection to {}",
            track.kind(),
            self.peer
        )))
    }

    fn detach(&self) {
        self.sink.detach();
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer);
        self.pc.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn backend() -> WebRtcBackend {
        WebRtcBackend::new(&MeshConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_offer_carries_placeholder_tracks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let rtc = backend()
            .create(&PeerAddress::new("100.64.0.2"), tx)
            .await
            .unwrap();

        let channel = rtc.create_control_channel("data", false).await.unwrap();
        assert_eq!(channel.label(), "data");
        assert!(!channel.is_open());

        let offer = rtc.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));
        assert_eq!(rtc.local_description().await.unwrap().sdp, offer.sdp);

        rtc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_placeholder_track() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let rtc = backend()
            .create(&PeerAddress::new("100.64.0.3"), tx)
            .await
            .unwrap();

        rtc.replace_track(LocalTrack::opus("microphone", "live"))
            .await
            .unwrap();
        rtc.replace_track(LocalTrack::vp9("screen", "live"))
            .await
            .unwrap();

        rtc.detach();
        rtc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_rejects_non_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let rtc = backend()
            .create(&PeerAddress::new("100.64.0.4"), tx)
            .await
            .unwrap();

        let err = rtc
            .accept_offer(&SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();
        assert!(err.is_peer_error());
        rtc.close().await.unwrap();
    }
}
