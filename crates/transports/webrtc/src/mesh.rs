//! Node-level facade tying negotiation to the media engine
//!
//! A [`Mesh`] owns the connection directory, the inbound decoder registry and
//! the outbound track pipelines of one node. Presence changes flow into the
//! directory and, for peers that leave, into the registry as well.

use crate::channels::{AppStateHandler, NoAppState};
use crate::config::MeshConfig;
use crate::dispatcher::{Dispatcher, PresenceTransitions, PresenceUpdate};
use crate::peer::{LocalTrack, PeerConnectionFactory, WebRtcBackend};
use crate::session::SessionIdentifier;
use crate::signaling::{HttpSignalingRelay, SignalHandler, SignalingRelay, SignalingServer};
use crate::status::StatusBoard;
use crate::{Error, Result};
use bytes::Bytes;
use futures::future::join_all;
use peermux_core::media::{DecoderFactory, EncoderFactory, OpusCodecs};
use peermux_core::registry::NullPlayback;
use peermux_core::{
    ChannelRelay, ChunkOutcome, DecoderRegistry, InboundRouter, MediaRelay, MediaSource,
    PeerAddress, PlaybackSink, RegistryConfig, TrackId, TransmitManager,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Collaborators a [`Mesh`] is built from
pub struct MeshComponents {
    pub rtc: Arc<dyn PeerConnectionFactory>,
    pub signaling: Arc<dyn SignalingRelay>,
    pub app_state: Arc<dyn AppStateHandler>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub playback: Arc<dyn PlaybackSink>,
}

/// One node of the peer mesh
pub struct Mesh {
    config: Arc<MeshConfig>,
    dispatcher: Arc<Dispatcher>,
    router: InboundRouter,
    transmit: TransmitManager,
}

impl Mesh {
    /// Build a node with a freshly generated session identifier
    pub fn new(config: MeshConfig, components: MeshComponents) -> Result<Self> {
        Self::with_session_id(config, SessionIdentifier::generate(), components)
    }

    pub fn with_session_id(
        config: MeshConfig,
        session_id: SessionIdentifier,
        components: MeshComponents,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            session_id,
            components.rtc,
            components.signaling,
            StatusBoard::default(),
            components.app_state,
        );
        // Peers of one overlay share a transmit configuration, so remote
        // microphone audio arrives in the tiers this node sends
        let registry_config = RegistryConfig {
            audio_bitrate_tiers: config.transmit.audio_bitrate_tiers.clone(),
            ..config.registry.clone()
        };
        let registry = DecoderRegistry::new(
            registry_config,
            components.decoders,
            components.playback,
        );
        let transmit = TransmitManager::new(config.transmit.clone(), components.encoders)?;

        info!("Mesh node {} ready", config.local_address);
        Ok(Self {
            config,
            dispatcher,
            router: InboundRouter::new(registry),
            transmit,
        })
    }

    /// Build a node on webrtc-rs, HTTP signaling and the Opus codecs
    pub fn with_defaults(config: MeshConfig) -> Result<Self> {
        let rtc = Arc::new(WebRtcBackend::new(&config));
        let signaling = Arc::new(HttpSignalingRelay::new(
            config.signaling_port,
            config.request_timeout(),
        )?);
        let codecs = Arc::new(OpusCodecs::new(config.registry.clone()));

        Self::new(
            config,
            MeshComponents {
                rtc,
                signaling,
                app_state: Arc::new(NoAppState),
                encoders: codecs.clone(),
                decoders: codecs,
                playback: Arc::new(NullPlayback),
            },
        )
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> &StatusBoard {
        self.dispatcher.status()
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        self.router.registry()
    }

    pub fn transmit(&self) -> &TransmitManager {
        &self.transmit
    }

    /// Handler to mount on whatever endpoint receives signaling for this node
    pub fn signal_handler(&self) -> Arc<dyn SignalHandler> {
        self.dispatcher.clone()
    }

    /// HTTP endpoint on `signaling_bind_host:signaling_port`
    pub fn signaling_server(&self) -> SignalingServer {
        SignalingServer::new(
            format!(
                "{}:{}",
                self.config.signaling_bind_host, self.config.signaling_port
            ),
            self.signal_handler(),
        )
    }

    /// Apply a presence snapshot; decoders of peers that left are dropped
    pub async fn apply_presence(&self, update: PresenceUpdate) -> PresenceTransitions {
        let transitions = self.dispatcher.apply_presence(update).await;
        for peer in &transitions.went_offline {
            self.decoders().remove_peer_decoders(peer).await;
        }
        transitions
    }

    pub async fn peer_offline(&self, peer: &PeerAddress) {
        self.dispatcher.peer_offline(peer).await;
        self.decoders().remove_peer_decoders(peer).await;
    }

    /// Feed presence snapshots from a channel until it closes
    pub fn spawn_presence_listener(
        self: &Arc<Self>,
        mut updates: mpsc::Receiver<PresenceUpdate>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let Some(mesh) = weak.upgrade() else {
                    break;
                };
                let transitions = mesh.apply_presence(update).await;
                if !transitions.came_online.is_empty() || !transitions.went_offline.is_empty() {
                    info!(
                        "Presence: {} online, {} offline",
                        transitions.came_online.len(),
                        transitions.went_offline.len()
                    );
                }
            }
            info!("Presence listener stopped");
        })
    }

    /// Route one relay message into the decoder registry
    pub async fn handle_media(&self, bytes: &[u8]) -> Result<ChunkOutcome> {
        Ok(self.router.handle(bytes).await?)
    }

    /// Drain a transport queue of relay messages until it closes
    pub async fn run_media(&self, inbound: mpsc::Receiver<Bytes>) {
        self.router.run(inbound).await;
    }

    /// Outbound relay queue for one local track, sized by the transmit config
    pub fn channel_relay(&self) -> (ChannelRelay, mpsc::Receiver<Bytes>) {
        self.transmit.channel_relay()
    }

    /// Start transmitting a local track; `false` if it is already running
    pub async fn start_track(
        &self,
        track_id: TrackId,
        source: Box<dyn MediaSource>,
        relay: Arc<dyn MediaRelay>,
    ) -> Result<bool> {
        Ok(self.transmit.start(track_id, source, relay).await?)
    }

    /// Stop a local track, returning the failure that ended it early
    pub async fn stop_track(&self, track_id: TrackId) -> Option<Error> {
        self.transmit.stop(track_id).await.map(Error::from)
    }

    /// Swap the outgoing track on every connection
    ///
    /// Returns the peers the swap failed for; the others keep the new track.
    pub async fn replace_track(&self, track: LocalTrack) -> Vec<(PeerAddress, Error)> {
        let connections = self.dispatcher.connections();
        let results = join_all(connections.iter().map(|conn| {
            let track = track.clone();
            async move { conn.replace_track(track).await }
        }))
        .await;

        connections
            .iter()
            .zip(results)
            .filter_map(|(conn, result)| {
                result.err().map(|e| {
                    warn!("Track replacement for {} failed: {}", conn.peer(), e);
                    (conn.peer().clone(), e)
                })
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down mesh node {}", self.config.local_address);
        self.transmit.stop_all().await;
        self.dispatcher.shutdown().await;
        self.decoders().clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::PresencePeer;
    use crate::testing::{FakeRtcFactory, RecordingSignaling};
    use peermux_core::testing::{
        audio_frame, video_frame, ChannelSource, FakeDecoderFactory, FakeEncoderFactory,
        RecordingPlayback,
    };
    use peermux_core::frame::HEADER_LEN;
    use peermux_core::relay::PEER_PREFIX_LEN;
    use peermux_core::{EncodedChunk, InboundFrame};

    const LOCAL: &str = "100.64.0.1";
    const REMOTE: &str = "100.64.0.2";

    struct Fixture {
        mesh: Arc<Mesh>,
        playback: Arc<RecordingPlayback>,
        encoders: FakeEncoderFactory,
        decoders: FakeDecoderFactory,
    }

    fn fixture() -> Fixture {
        fixture_with(MeshConfig {
            local_address: PeerAddress::new(LOCAL),
            ..Default::default()
        })
    }

    fn fixture_with(config: MeshConfig) -> Fixture {
        let playback = Arc::new(RecordingPlayback::default());
        let encoders = FakeEncoderFactory::new();
        let decoders = FakeDecoderFactory::new();
        let mesh = Mesh::with_session_id(
            config,
            SessionIdentifier::new(100),
            MeshComponents {
                rtc: Arc::new(FakeRtcFactory::new()),
                signaling: Arc::new(RecordingSignaling::new()),
                app_state: Arc::new(NoAppState),
                encoders: Arc::new(encoders.clone()),
                decoders: Arc::new(decoders.clone()),
                playback: playback.clone(),
            },
        )
        .unwrap();
        Fixture {
            mesh: Arc::new(mesh),
            playback,
            encoders,
            decoders,
        }
    }

    /// Run local tracks into one relay queue and return the frames as a peer receives them
    async fn transmit(f: &Fixture, microphone: usize, screen: usize) -> Vec<Bytes> {
        let (relay, mut wire) = f.mesh.channel_relay();
        let relay: Arc<dyn MediaRelay> = Arc::new(relay);
        let (mic_tx, mic) = ChannelSource::new(8);
        let (screen_tx, screen_source) = ChannelSource::new(8);
        f.mesh
            .start_track(TrackId::MICROPHONE_AUDIO, Box::new(mic), Arc::clone(&relay))
            .await
            .unwrap();
        f.mesh
            .start_track(TrackId::SCREEN_VIDEO, Box::new(screen_source), relay)
            .await
            .unwrap();

        for _ in 0..microphone {
            mic_tx.send(audio_frame(960, 48000, 1)).await.unwrap();
        }
        for _ in 0..screen {
            screen_tx.send(video_frame(16, 16)).await.unwrap();
        }
        let tiers = f.mesh.config().transmit.audio_bitrate_tiers.len();
        while f.encoders.encoded() < microphone * tiers + screen {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        f.mesh.shutdown().await;

        let ip = PeerAddress::new(LOCAL).to_ipv4_bytes().unwrap();
        let mut received = Vec::new();
        while let Ok(frame) = wire.try_recv() {
            let mut prefixed = vec![frame[0]];
            prefixed.extend_from_slice(&ip);
            prefixed.extend_from_slice(&frame[1..]);
            received.push(Bytes::from(prefixed));
        }
        received
    }

    fn microphone_frame(from: &str) -> Vec<u8> {
        InboundFrame {
            peer: PeerAddress::new(from),
            chunk: EncodedChunk::new(TrackId::MICROPHONE_AUDIO, 20_000, vec![0xFC, 0x01])
                .with_bitrate_tag(64_000),
        }
        .encode(true)
        .unwrap()
        .to_vec()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MeshConfig {
            control_channel_label: String::new(),
            ..Default::default()
        };
        let result = Mesh::new(
            config,
            MeshComponents {
                rtc: Arc::new(FakeRtcFactory::new()),
                signaling: Arc::new(RecordingSignaling::new()),
                app_state: Arc::new(NoAppState),
                encoders: Arc::new(FakeEncoderFactory::new()),
                decoders: Arc::new(FakeDecoderFactory::new()),
                playback: Arc::new(NullPlayback),
            },
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_media_creates_decoder() {
        let f = fixture();
        let outcome = f.mesh.handle_media(&microphone_frame(REMOTE)).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Decoded);
        assert_eq!(f.mesh.decoders().decoder_count().await, 1);
        assert_eq!(
            f.playback.added(),
            vec![(PeerAddress::new(REMOTE), TrackId::MICROPHONE_AUDIO)]
        );
    }

    #[tokio::test]
    async fn test_own_output_decodes_at_default_peer() {
        let sender = fixture();
        let received = transmit(&sender, 3, 2).await;
        assert_eq!(received.len(), 3 * 3 + 2);

        let receiver = fixture_with(MeshConfig {
            local_address: PeerAddress::new(REMOTE),
            ..Default::default()
        });
        for bytes in &received {
            let outcome = receiver.mesh.handle_media(bytes).await.unwrap();
            assert!(matches!(outcome, ChunkOutcome::Decoded | ChunkOutcome::OtherTier));
        }

        let local = PeerAddress::new(LOCAL);
        assert_eq!(receiver.decoders.decoded(&local, TrackId::MICROPHONE_AUDIO), 3);
        assert_eq!(receiver.decoders.decoded(&local, TrackId::SCREEN_VIDEO), 2);
    }

    #[tokio::test]
    async fn test_single_tier_nodes_exchange_untagged_audio() {
        let single_tier = |address: &str| {
            let mut config = MeshConfig {
                local_address: PeerAddress::new(address),
                ..Default::default()
            };
            config.transmit.audio_bitrate_tiers = vec![48_000];
            config
        };
        let sender = fixture_with(single_tier(LOCAL));
        let received = transmit(&sender, 2, 0).await;
        assert_eq!(received.len(), 2);
        assert!(received
            .iter()
            .all(|bytes| bytes.len() == PEER_PREFIX_LEN + HEADER_LEN + 8));

        let receiver = fixture_with(single_tier(REMOTE));
        for bytes in &received {
            let outcome = receiver.mesh.handle_media(bytes).await.unwrap();
            assert_eq!(outcome, ChunkOutcome::Decoded);
        }
        let local = PeerAddress::new(LOCAL);
        assert_eq!(receiver.decoders.decoded(&local, TrackId::MICROPHONE_AUDIO), 2);
    }

    #[tokio::test]
    async fn test_run_media_drains_queue() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from(microphone_frame(REMOTE))).await.unwrap();
        tx.send(Bytes::from_static(&[0xFF])).await.unwrap();
        drop(tx);

        f.mesh.run_media(rx).await;
        assert_eq!(f.mesh.decoders().decoder_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_media_is_an_error() {
        let f = fixture();
        assert!(f.mesh.handle_media(&[0x00, 0x01]).await.is_err());
        assert_eq!(f.mesh.decoders().decoder_count().await, 0);
    }

    #[tokio::test]
    async fn test_peer_leaving_drops_its_decoders() {
        let f = fixture();
        f.mesh
            .apply_presence(PresenceUpdate {
                peers: vec![PresencePeer::online(REMOTE)],
            })
            .await;
        f.mesh.handle_media(&microphone_frame(REMOTE)).await.unwrap();
        f.mesh.handle_media(&microphone_frame("100.64.0.3")).await.unwrap();
        assert_eq!(f.mesh.decoders().decoder_count().await, 2);

        let transitions = f
            .mesh
            .apply_presence(PresenceUpdate {
                peers: vec![PresencePeer::offline(REMOTE)],
            })
            .await;

        assert_eq!(transitions.went_offline, vec![PeerAddress::new(REMOTE)]);
        assert_eq!(f.mesh.decoders().decoder_count().await, 1);
        assert_eq!(
            f.playback.removed(),
            vec![(PeerAddress::new(REMOTE), TrackId::MICROPHONE_AUDIO)]
        );
        assert!(!f.mesh.dispatcher().is_exchanging(&PeerAddress::new(REMOTE)));
    }

    #[tokio::test]
    async fn test_presence_listener_applies_updates() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(4);
        let listener = f.mesh.spawn_presence_listener(rx);

        tx.send(PresenceUpdate {
            peers: vec![PresencePeer::online(REMOTE)],
        })
        .await
        .unwrap();
        drop(tx);
        listener.await.unwrap();

        assert!(f.mesh.dispatcher().is_exchanging(&PeerAddress::new(REMOTE)));
        f.mesh.shutdown().await;
        assert!(!f.mesh.dispatcher().is_exchanging(&PeerAddress::new(REMOTE)));
    }

    #[tokio::test]
    async fn test_replace_track_without_connections() {
        let f = fixture();
        let track = LocalTrack::opus("mic", "local");
        assert!(f.mesh.replace_track(track).await.is_empty());
    }

    #[tokio::test]
    async fn test_signaling_server_binds_configured_port() {
        let f = fixture();
        let server = f.mesh.signaling_server();
        assert_eq!(server.bind_address(), "0.0.0.0:8848");
    }
}
