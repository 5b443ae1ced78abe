//! Decoder registry for inbound tracks
//!
//! One decoder instance per (peer, track) pair, created lazily on the first
//! chunk for that pair. Each instance owns a live [`OutputTrack`] that is
//! handed to the playback collaborator; the registry keeps the authority to
//! stop it.
//!
//! Video instances start out waiting for a key frame and fall back to that
//! state after a decode failure. An asynchronous codec fault restarts only
//! the faulted instance: it is torn down after a short delay and recreated by
//! the next chunk that arrives for the pair.

use crate::config::RegistryConfig;
use crate::frame::EncodedChunk;
use crate::media::{CodecState, DecodedFrame, Decoder, DecoderEvent, DecoderFactory};
use crate::track::{MediaKind, PeerAddress, TrackId};
use crate::{Error, Result};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Composite registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoderKey {
    pub peer: PeerAddress,
    pub track_id: TrackId,
}

impl DecoderKey {
    pub fn new(peer: PeerAddress, track_id: TrackId) -> Self {
        Self { peer, track_id }
    }
}

impl std::fmt::Display for DecoderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.peer, self.track_id)
    }
}

/// Live, continuously written track exposed to the presentation layer
///
/// Readers subscribe to receive decoded frames. Once stopped every
/// subscription ends and further writes are discarded.
pub struct OutputTrack {
    key: DecoderKey,
    sender: SyncMutex<Option<broadcast::Sender<DecodedFrame>>>,
    frames_written: AtomicU64,
}

impl OutputTrack {
    fn new(key: DecoderKey, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            key,
            sender: SyncMutex::new(Some(sender)),
            frames_written: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.key.peer
    }

    pub fn track_id(&self) -> TrackId {
        self.key.track_id
    }

    pub fn kind(&self) -> MediaKind {
        self.key.track_id.kind()
    }

    /// Subscribe to decoded frames; `None` once the track is stopped
    pub fn subscribe(&self) -> Option<broadcast::Receiver<DecodedFrame>> {
        self.sender.lock().as_ref().map(|s| s.subscribe())
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    fn write(&self, frame: DecodedFrame) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // No subscribers is fine, the frame is simply not observed
            let _ = sender.send(frame);
            self.frames_written.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stop(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Stopped output track {}", self.key);
        }
    }
}

impl std::fmt::Debug for OutputTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputTrack")
            .field("key", &self.key)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Presentation collaborator that plays output tracks
pub trait PlaybackSink: Send + Sync {
    fn track_added(&self, peer: &PeerAddress, track_id: TrackId, track: Arc<OutputTrack>);

    fn track_removed(&self, peer: &PeerAddress, track_id: TrackId);
}

/// Playback sink that ignores registrations
#[derive(Debug, Default)]
pub struct NullPlayback;

impl PlaybackSink for NullPlayback {
    fn track_added(&self, _peer: &PeerAddress, _track_id: TrackId, _track: Arc<OutputTrack>) {}

    fn track_removed(&self, _peer: &PeerAddress, _track_id: TrackId) {}
}

/// What happened to a chunk handed to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Fed to the decoder
    Decoded,
    /// Dropped while the video instance waits for a key frame
    AwaitingKeyFrame,
    /// Dropped because the decoder cannot take input right now
    DecoderNotReady,
    /// Decoder rejected the chunk
    DecodeFailed,
    /// Dropped before decoding: a bitrate tier this receiver does not play
    OtherTier,
}

struct DecoderState {
    decoder: Box<dyn Decoder>,
    waiting_for_key_frame: bool,
    chunks_decoded: u64,
}

/// One registered decoder instance
pub struct DecoderInstance {
    key: DecoderKey,
    generation: u64,
    created_at: Instant,
    output: Arc<OutputTrack>,
    state: Mutex<DecoderState>,
    pump: SyncMutex<Option<JoinHandle<()>>>,
}

impl DecoderInstance {
    pub fn key(&self) -> &DecoderKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn output_track(&self) -> Arc<OutputTrack> {
        Arc::clone(&self.output)
    }

    pub async fn is_waiting_for_key_frame(&self) -> bool {
        self.state.lock().await.waiting_for_key_frame
    }

    pub async fn chunks_decoded(&self) -> u64 {
        self.state.lock().await.chunks_decoded
    }
}

/// Snapshot of one active decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderInfo {
    pub peer: PeerAddress,
    pub track_id: TrackId,
    pub kind: MediaKind,
    pub waiting_for_key_frame: bool,
    pub chunks_decoded: u64,
    pub age_secs: u64,
}

struct RegistryInner {
    config: RegistryConfig,
    factory: Arc<dyn DecoderFactory>,
    playback: Arc<dyn PlaybackSink>,
    decoders: RwLock<HashMap<DecoderKey, Arc<DecoderInstance>>>,
    next_generation: AtomicU64,
}

/// Registry of inbound decoders keyed by (peer, track)
#[derive(Clone)]
pub struct DecoderRegistry {
    inner: Arc<RegistryInner>,
}

impl DecoderRegistry {
    pub fn new(
        config: RegistryConfig,
        factory: Arc<dyn DecoderFactory>,
        playback: Arc<dyn PlaybackSink>,
    ) -> Self {
        info!("Creating DecoderRegistry");
        Self {
            inner: Arc::new(RegistryInner {
                config,
                factory,
                playback,
                decoders: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Look up the instance for a pair, creating it on first use
    ///
    /// # Errors
    ///
    /// Whatever the decoder factory reports; nothing is registered in that case
    /// and the next chunk retries creation.
    pub async fn get_or_create(
        &self,
        peer: &PeerAddress,
        track_id: TrackId,
    ) -> Result<Arc<DecoderInstance>> {
        let key = DecoderKey::new(peer.clone(), track_id);

        if let Some(instance) = self.inner.decoders.read().await.get(&key) {
            return Ok(Arc::clone(instance));
        }

        let instance = {
            let mut decoders = self.inner.decoders.write().await;

            // Another caller may have won the race between the two locks
            if let Some(instance) = decoders.get(&key) {
                return Ok(Arc::clone(instance));
            }

            let instance = self.inner.create_instance(key.clone())?;
            decoders.insert(key.clone(), Arc::clone(&instance));

            info!(
                "Created decoder for {} (generation {}, total: {})",
                key,
                instance.generation,
                decoders.len()
            );
            instance
        };

        self.inner
            .playback
            .track_added(peer, track_id, instance.output_track());

        Ok(instance)
    }

    /// Route one inbound chunk to its decoder
    pub async fn process_chunk(
        &self,
        peer: &PeerAddress,
        chunk: &EncodedChunk,
    ) -> Result<ChunkOutcome> {
        let instance = self.get_or_create(peer, chunk.track_id).await?;
        let is_video = chunk.track_id.is_video();
        let mut state = instance.state.lock().await;

        if is_video {
            if state.waiting_for_key_frame && !chunk.is_key_frame() {
                debug!("Dropping delta frame for {} while waiting for key frame", instance.key);
                return Ok(ChunkOutcome::AwaitingKeyFrame);
            }
            if chunk.is_key_frame() {
                state.waiting_for_key_frame = false;
            }
        }

        if state.decoder.state() != CodecState::Configured {
            debug!(
                "Decoder for {} not ready ({:?}), skipping chunk",
                instance.key,
                state.decoder.state()
            );
            return Ok(ChunkOutcome::DecoderNotReady);
        }

        match state.decoder.decode(chunk) {
            Ok(()) => {
                state.chunks_decoded += 1;
                Ok(ChunkOutcome::Decoded)
            }
            Err(e) => {
                warn!("Decode failed for {}: {}", instance.key, e);
                if is_video {
                    state.waiting_for_key_frame = true;
                }
                Ok(ChunkOutcome::DecodeFailed)
            }
        }
    }

    /// Tear down one instance; no-op if it does not exist
    pub async fn remove_decoder(&self, peer: &PeerAddress, track_id: TrackId) {
        let key = DecoderKey::new(peer.clone(), track_id);
        let removed = self.inner.decoders.write().await.remove(&key);

        if let Some(instance) = removed {
            self.inner.shutdown_instance(instance).await;
        }
    }

    /// Tear down every instance of a peer
    pub async fn remove_peer_decoders(&self, peer: &PeerAddress) {
        let removed: Vec<Arc<DecoderInstance>> = {
            let mut decoders = self.inner.decoders.write().await;
            let keys: Vec<DecoderKey> = decoders
                .keys()
                .filter(|key| &key.peer == peer)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| decoders.remove(key)).collect()
        };

        if !removed.is_empty() {
            info!("Removing {} decoders for peer {}", removed.len(), peer);
        }

        for instance in removed {
            self.inner.shutdown_instance(instance).await;
        }
    }

    /// Tear down everything
    pub async fn clear(&self) {
        let removed: Vec<Arc<DecoderInstance>> = {
            let mut decoders = self.inner.decoders.write().await;
            decoders.drain().map(|(_, instance)| instance).collect()
        };

        for instance in removed {
            self.inner.shutdown_instance(instance).await;
        }
    }

    pub async fn get(&self, peer: &PeerAddress, track_id: TrackId) -> Option<Arc<DecoderInstance>> {
        let key = DecoderKey::new(peer.clone(), track_id);
        self.inner.decoders.read().await.get(&key).cloned()
    }

    pub async fn output_track(
        &self,
        peer: &PeerAddress,
        track_id: TrackId,
    ) -> Option<Arc<OutputTrack>> {
        self.get(peer, track_id).await.map(|i| i.output_track())
    }

    pub async fn decoder_count(&self) -> usize {
        self.inner.decoders.read().await.len()
    }

    /// Output tracks of one peer
    pub async fn peer_tracks(&self, peer: &PeerAddress) -> Vec<Arc<OutputTrack>> {
        self.inner
            .decoders
            .read()
            .await
            .values()
            .filter(|i| &i.key.peer == peer)
            .map(|i| i.output_track())
            .collect()
    }

    pub async fn active_decoders(&self) -> Vec<DecoderInfo> {
        let instances: Vec<Arc<DecoderInstance>> =
            self.inner.decoders.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(instances.len());
        for instance in instances {
            let state = instance.state.lock().await;
            infos.push(DecoderInfo {
                peer: instance.key.peer.clone(),
                track_id: instance.key.track_id,
                kind: instance.key.track_id.kind(),
                waiting_for_key_frame: state.waiting_for_key_frame,
                chunks_decoded: state.chunks_decoded,
                age_secs: instance.created_at.elapsed().as_secs(),
            });
        }
        infos.sort_by(|a, b| (&a.peer, a.track_id).cmp(&(&b.peer, b.track_id)));
        infos
    }
}

impl RegistryInner {
    fn create_instance(self: &Arc<Self>, key: DecoderKey) -> Result<Arc<DecoderInstance>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let decoder = self
            .factory
            .create_decoder(&key.peer, key.track_id, tx)
            .map_err(|e| {
                warn!("Failed to create decoder for {}: {}", key, e);
                e
            })?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let output = Arc::new(OutputTrack::new(
            key.clone(),
            self.config.output_buffer_frames,
        ));

        let instance = Arc::new(DecoderInstance {
            key: key.clone(),
            generation,
            created_at: Instant::now(),
            output: Arc::clone(&output),
            state: Mutex::new(DecoderState {
                decoder,
                waiting_for_key_frame: key.track_id.is_video(),
                chunks_decoded: 0,
            }),
            pump: SyncMutex::new(None),
        });

        let pump = tokio::spawn(pump_decoder_output(
            Arc::downgrade(self),
            key,
            generation,
            output,
            rx,
        ));
        *instance.pump.lock() = Some(pump);

        Ok(instance)
    }

    /// Remove the instance only if it is still the given generation
    async fn restart(&self, key: &DecoderKey, generation: u64) {
        let removed = {
            let mut decoders = self.decoders.write().await;
            match decoders.get(key) {
                Some(current) if current.generation == generation => decoders.remove(key),
                _ => None,
            }
        };

        match removed {
            Some(instance) => {
                info!("Restarting decoder for {} after fault", key);
                self.shutdown_instance(instance).await;
            }
            None => debug!("Decoder for {} already replaced, skipping restart", key),
        }
    }

    async fn shutdown_instance(&self, instance: Arc<DecoderInstance>) {
        {
            let mut state = instance.state.lock().await;
            if state.decoder.state() == CodecState::Configured {
                match tokio::time::timeout(self.config.flush_timeout(), state.decoder.flush()).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Flush failed for {}: {}", instance.key, e),
                    Err(_) => warn!("Flush timed out for {}, forcing close", instance.key),
                }
            }
            state.decoder.close();
        }

        instance.output.stop();
        if let Some(pump) = instance.pump.lock().take() {
            pump.abort();
        }

        self.playback
            .track_removed(&instance.key.peer, instance.key.track_id);

        info!("Removed decoder for {}", instance.key);
    }
}

async fn pump_decoder_output(
    registry: Weak<RegistryInner>,
    key: DecoderKey,
    generation: u64,
    output: Arc<OutputTrack>,
    mut events: mpsc::UnboundedReceiver<DecoderEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DecoderEvent::Frame(frame) => output.write(frame),
            DecoderEvent::Error(message) => {
                let fault = Error::DecoderFault(message);
                warn!("{} on {}, scheduling restart", fault, key);

                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let delay = registry.config.restart_delay();
                // The teardown aborts this pump, so it runs on its own task
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    registry.restart(&key, generation).await;
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDecoderFactory, RecordingPlayback, VP9_DELTA, VP9_KEY};
    use std::time::Duration;

    fn registry(factory: &FakeDecoderFactory, playback: &Arc<RecordingPlayback>) -> DecoderRegistry {
        DecoderRegistry::new(
            RegistryConfig::default(),
            Arc::new(factory.clone()),
            Arc::clone(playback) as Arc<dyn PlaybackSink>,
        )
    }

    fn video(payload: &[u8]) -> EncodedChunk {
        EncodedChunk::new(TrackId::SCREEN_VIDEO, 33_333, payload.to_vec())
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");

        let first = registry.get_or_create(&peer, TrackId::MICROPHONE_AUDIO).await.unwrap();
        let second = registry.get_or_create(&peer, TrackId::MICROPHONE_AUDIO).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.decoder_count().await, 1);
        assert_eq!(factory.created(), 1);
        assert_eq!(playback.added().len(), 1);
    }

    #[tokio::test]
    async fn test_tracks_of_one_peer_do_not_share_decoders() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");

        let mic = registry.get_or_create(&peer, TrackId::MICROPHONE_AUDIO).await.unwrap();
        let secondary = registry.get_or_create(&peer, TrackId::SECONDARY_AUDIO).await.unwrap();

        assert!(!Arc::ptr_eq(&mic, &secondary));
        assert_eq!(registry.decoder_count().await, 2);
    }

    #[tokio::test]
    async fn test_key_frame_gating() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");

        let outcomes = [
            registry.process_chunk(&peer, &video(&VP9_DELTA)).await.unwrap(),
            registry.process_chunk(&peer, &video(&VP9_DELTA)).await.unwrap(),
            registry.process_chunk(&peer, &video(&VP9_KEY)).await.unwrap(),
            registry.process_chunk(&peer, &video(&VP9_DELTA)).await.unwrap(),
        ];

        assert_eq!(
            outcomes,
            [
                ChunkOutcome::AwaitingKeyFrame,
                ChunkOutcome::AwaitingKeyFrame,
                ChunkOutcome::Decoded,
                ChunkOutcome::Decoded,
            ]
        );
        assert_eq!(factory.decoded(&peer, TrackId::SCREEN_VIDEO), 2);
    }

    #[tokio::test]
    async fn test_decode_failure_resyncs_on_key_frame() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");

        registry.process_chunk(&peer, &video(&VP9_KEY)).await.unwrap();
        factory.fail_next_decode(&peer, TrackId::SCREEN_VIDEO);
        assert_eq!(
            registry.process_chunk(&peer, &video(&VP9_DELTA)).await.unwrap(),
            ChunkOutcome::DecodeFailed
        );
        assert_eq!(
            registry.process_chunk(&peer, &video(&VP9_DELTA)).await.unwrap(),
            ChunkOutcome::AwaitingKeyFrame
        );
        assert_eq!(
            registry.process_chunk(&peer, &video(&VP9_KEY)).await.unwrap(),
            ChunkOutcome::Decoded
        );
    }

    #[tokio::test]
    async fn test_audio_decode_failure_just_drops() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");
        let chunk = EncodedChunk::new(TrackId::MICROPHONE_AUDIO, 20_000, vec![1, 2, 3]);

        registry.get_or_create(&peer, TrackId::MICROPHONE_AUDIO).await.unwrap();
        factory.fail_next_decode(&peer, TrackId::MICROPHONE_AUDIO);
        assert_eq!(
            registry.process_chunk(&peer, &chunk).await.unwrap(),
            ChunkOutcome::DecodeFailed
        );
        assert_eq!(
            registry.process_chunk(&peer, &chunk).await.unwrap(),
            ChunkOutcome::Decoded
        );
    }

    #[tokio::test]
    async fn test_not_ready_decoder_is_skipped() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");
        let chunk = EncodedChunk::new(TrackId::MICROPHONE_AUDIO, 20_000, vec![1]);

        factory.start_unconfigured(true);
        assert_eq!(
            registry.process_chunk(&peer, &chunk).await.unwrap(),
            ChunkOutcome::DecoderNotReady
        );
        assert_eq!(factory.decoded(&peer, TrackId::MICROPHONE_AUDIO), 0);
    }

    #[tokio::test]
    async fn test_decoded_frames_reach_output_track() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");

        let track = registry
            .get_or_create(&peer, TrackId::MICROPHONE_AUDIO)
            .await
            .unwrap()
            .output_track();
        let mut frames = track.subscribe().unwrap();

        let chunk = EncodedChunk::new(TrackId::MICROPHONE_AUDIO, 20_000, vec![1]);
        registry.process_chunk(&peer, &chunk).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, DecodedFrame::Audio(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_restarts_only_the_faulted_instance() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let p = PeerAddress::new("10.0.0.2");
        let q = PeerAddress::new("10.0.0.3");

        let faulted = registry.get_or_create(&p, TrackId::MICROPHONE_AUDIO).await.unwrap();
        let same_peer = registry.get_or_create(&p, TrackId::SECONDARY_AUDIO).await.unwrap();
        let same_track = registry.get_or_create(&q, TrackId::MICROPHONE_AUDIO).await.unwrap();

        factory.inject_fault(&p, TrackId::MICROPHONE_AUDIO, "hardware reset");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(registry.get(&p, TrackId::MICROPHONE_AUDIO).await.is_none());
        assert!(faulted.output_track().is_stopped());
        assert!(Arc::ptr_eq(
            &registry.get(&p, TrackId::SECONDARY_AUDIO).await.unwrap(),
            &same_peer
        ));
        assert!(Arc::ptr_eq(
            &registry.get(&q, TrackId::MICROPHONE_AUDIO).await.unwrap(),
            &same_track
        ));

        // The next chunk recreates the instance
        let chunk = EncodedChunk::new(TrackId::MICROPHONE_AUDIO, 20_000, vec![1]);
        registry.process_chunk(&p, &chunk).await.unwrap();
        let recreated = registry.get(&p, TrackId::MICROPHONE_AUDIO).await.unwrap();
        assert!(recreated.generation() > faulted.generation());
    }

    #[tokio::test]
    async fn test_remove_decoder() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let peer = PeerAddress::new("10.0.0.2");

        // removing a missing instance is a no-op
        registry.remove_decoder(&peer, TrackId::MICROPHONE_AUDIO).await;

        let instance = registry.get_or_create(&peer, TrackId::MICROPHONE_AUDIO).await.unwrap();
        let track = instance.output_track();
        let mut frames = track.subscribe().unwrap();

        registry.remove_decoder(&peer, TrackId::MICROPHONE_AUDIO).await;

        assert!(track.is_stopped());
        assert!(track.subscribe().is_none());
        assert!(matches!(
            frames.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(factory.flushed(&peer, TrackId::MICROPHONE_AUDIO), 1);
        assert_eq!(
            playback.removed(),
            vec![(peer.clone(), TrackId::MICROPHONE_AUDIO)]
        );
        assert_eq!(registry.decoder_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_peer_decoders() {
        let factory = FakeDecoderFactory::new();
        let playback = Arc::new(RecordingPlayback::default());
        let registry = registry(&factory, &playback);
        let p = PeerAddress::new("10.0.0.2");
        let q = PeerAddress::new("10.0.0.3");

        for track in TrackId::KNOWN {
            registry.get_or_create(&p, track).await.unwrap();
        }
        registry.get_or_create(&q, TrackId::MICROPHONE_AUDIO).await.unwrap();

        registry.remove_peer_decoders(&p).await;

        let active = registry.active_decoders().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].peer, q);
        assert!(registry.peer_tracks(&p).await.is_empty());
    }
}
