//! In-memory sources, codecs, relays and playback sinks for tests

use crate::frame::EncodedChunk;
use crate::media::{
    AudioFrame, CodecState, Decoder, DecoderEvent, DecoderFactory, DecoderOutput, Encoder,
    EncoderEvent, EncoderFactory, EncoderOutput, EncoderSettings, RawFrame, VideoFrame,
};
use crate::pipeline::MediaSource;
use crate::registry::{DecoderKey, OutputTrack, PlaybackSink};
use crate::relay::MediaRelay;
use crate::track::{PeerAddress, TrackId};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Smallest VP9 key frame header
pub const VP9_KEY: [u8; 4] = [0x82, 0x49, 0x83, 0x42];

/// VP9 inter frame header
pub const VP9_DELTA: [u8; 2] = [0x86, 0x00];

pub fn audio_frame(samples_per_channel: usize, sample_rate: u32, channels: u16) -> RawFrame {
    RawFrame::Audio(AudioFrame {
        samples: vec![0.1; samples_per_channel * usize::from(channels)],
        sample_rate,
        channels,
        timestamp_micros: 0,
    })
}

pub fn video_frame(width: u32, height: u32) -> RawFrame {
    let len = (width * height * 3 / 2) as usize;
    RawFrame::Video(VideoFrame {
        width,
        height,
        data: Bytes::from(vec![16u8; len]),
        timestamp_micros: 0,
    })
}

/// Source fed through an mpsc channel
pub struct ChannelSource {
    frames: mpsc::Receiver<RawFrame>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<RawFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { frames: rx })
    }
}

#[async_trait]
impl MediaSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<RawFrame> {
        self.frames.recv().await
    }
}

/// Relay that keeps everything it is handed
pub struct RecordingRelay {
    open: AtomicBool,
    frames: Mutex<Vec<Bytes>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }
}

impl Default for RecordingRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaRelay for RecordingRelay {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, _track_id: TrackId, frame: Bytes) -> Result<()> {
        self.frames.lock().push(frame);
        Ok(())
    }
}

#[derive(Default)]
struct EncoderShared {
    created: Mutex<Vec<EncoderSettings>>,
    outputs: Mutex<Vec<EncoderOutput>>,
    unavailable: AtomicBool,
    reject_configuration: AtomicBool,
    encoded: AtomicUsize,
    flushes: AtomicUsize,
    closes: AtomicUsize,
}

/// Encoder factory whose encoders hold each chunk back by one frame, like
/// real video encoders, so stop has something to flush.
#[derive(Clone, Default)]
pub struct FakeEncoderFactory {
    shared: Arc<EncoderShared>,
}

impl FakeEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn reject_configuration(&self, reject: bool) {
        self.shared.reject_configuration.store(reject, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<EncoderSettings> {
        self.shared.created.lock().clone()
    }

    /// Encode calls across every encoder
    pub fn encoded(&self) -> usize {
        self.shared.encoded.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.shared.flushes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Report an asynchronous fault from every live encoder
    pub fn inject_fault(&self, message: &str) {
        for output in self.shared.outputs.lock().iter() {
            let _ = output.send(EncoderEvent::Error(message.to_string()));
        }
    }
}

impl EncoderFactory for FakeEncoderFactory {
    fn create_encoder(
        &self,
        settings: EncoderSettings,
        output: EncoderOutput,
    ) -> Result<Box<dyn Encoder>> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(Error::EncoderUnavailable(format!(
                "no encoder for {}",
                settings.track_id
            )));
        }

        self.shared.created.lock().push(settings.clone());
        self.shared.outputs.lock().push(output.clone());
        Ok(Box::new(FakeEncoder {
            settings,
            shared: Arc::clone(&self.shared),
            output: Some(output),
            held: None,
            state: CodecState::Unconfigured,
        }))
    }
}

struct FakeEncoder {
    settings: EncoderSettings,
    shared: Arc<EncoderShared>,
    output: Option<EncoderOutput>,
    held: Option<EncodedChunk>,
    state: CodecState,
}

impl FakeEncoder {
    fn release_held(&mut self) {
        if let (Some(chunk), Some(output)) = (self.held.take(), &self.output) {
            let _ = output.send(EncoderEvent::Chunk(chunk));
        }
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    fn configure(&mut self, _first: &RawFrame) -> Result<()> {
        if self.shared.reject_configuration.load(Ordering::SeqCst) {
            return Err(Error::ConfigurationUnsupported(
                "fake encoder rejects everything".to_string(),
            ));
        }
        self.state = CodecState::Configured;
        Ok(())
    }

    fn encode(&mut self, frame: &RawFrame, force_key_frame: bool) -> Result<()> {
        let index = self.shared.encoded.fetch_add(1, Ordering::SeqCst);
        let chunk = match frame {
            RawFrame::Audio(audio) => EncodedChunk::new(
                self.settings.track_id,
                audio.frames() as u64 * 1_000_000 / u64::from(audio.sample_rate.max(1)),
                vec![index as u8; 8],
            )
            .with_bitrate_tag(self.settings.bitrate),
            RawFrame::Video(_) => {
                let payload = if force_key_frame {
                    VP9_KEY.to_vec()
                } else {
                    VP9_DELTA.to_vec()
                };
                EncodedChunk::new(
                    self.settings.track_id,
                    1_000_000 / u64::from(self.settings.framerate.max(1)),
                    payload,
                )
            }
        };

        self.release_held();
        self.held = Some(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.shared.flushes.fetch_add(1, Ordering::SeqCst);
        self.release_held();
        Ok(())
    }

    fn close(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.held = None;
        if let Some(output) = self.output.take() {
            self.shared
                .outputs
                .lock()
                .retain(|other| !other.same_channel(&output));
        }
        self.state = CodecState::Closed;
    }

    fn state(&self) -> CodecState {
        self.state
    }
}

#[derive(Default)]
struct DecoderRecord {
    decoded: usize,
    flushed: usize,
    fail_next: bool,
    output: Option<DecoderOutput>,
}

#[derive(Default)]
struct DecoderShared {
    created: AtomicUsize,
    unconfigured: AtomicBool,
    records: Mutex<HashMap<DecoderKey, DecoderRecord>>,
}

/// Decoder factory recording what reaches each (peer, track) decoder
#[derive(Clone, Default)]
pub struct FakeDecoderFactory {
    shared: Arc<DecoderShared>,
}

impl FakeDecoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// New decoders report `Unconfigured` and refuse input
    pub fn start_unconfigured(&self, unconfigured: bool) {
        self.shared.unconfigured.store(unconfigured, Ordering::SeqCst);
    }

    /// Chunks that reached decoders of the pair, across restarts
    pub fn decoded(&self, peer: &PeerAddress, track_id: TrackId) -> usize {
        let key = DecoderKey::new(peer.clone(), track_id);
        self.shared.records.lock().get(&key).map_or(0, |r| r.decoded)
    }

    pub fn flushed(&self, peer: &PeerAddress, track_id: TrackId) -> usize {
        let key = DecoderKey::new(peer.clone(), track_id);
        self.shared.records.lock().get(&key).map_or(0, |r| r.flushed)
    }

    pub fn fail_next_decode(&self, peer: &PeerAddress, track_id: TrackId) {
        let key = DecoderKey::new(peer.clone(), track_id);
        self.shared.records.lock().entry(key).or_default().fail_next = true;
    }

    /// Report an asynchronous codec fault from the pair's live decoder
    pub fn inject_fault(&self, peer: &PeerAddress, track_id: TrackId, message: &str) {
        let key = DecoderKey::new(peer.clone(), track_id);
        if let Some(output) = self
            .shared
            .records
            .lock()
            .get(&key)
            .and_then(|r| r.output.as_ref())
        {
            let _ = output.send(DecoderEvent::Error(message.to_string()));
        }
    }
}

impl DecoderFactory for FakeDecoderFactory {
    fn create_decoder(
        &self,
        peer: &PeerAddress,
        track_id: TrackId,
        output: DecoderOutput,
    ) -> Result<Box<dyn Decoder>> {
        let key = DecoderKey::new(peer.clone(), track_id);
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        self.shared
            .records
            .lock()
            .entry(key.clone())
            .or_default()
            .output = Some(output.clone());

        let state = if self.shared.unconfigured.load(Ordering::SeqCst) {
            CodecState::Unconfigured
        } else {
            CodecState::Configured
        };

        Ok(Box::new(FakeDecoder {
            key,
            shared: Arc::clone(&self.shared),
            output: Some(output),
            state,
        }))
    }
}

struct FakeDecoder {
    key: DecoderKey,
    shared: Arc<DecoderShared>,
    output: Option<DecoderOutput>,
    state: CodecState,
}

#[async_trait]
impl Decoder for FakeDecoder {
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<()> {
        {
            let mut records = self.shared.records.lock();
            let record = records.entry(self.key.clone()).or_default();
            if record.fail_next {
                record.fail_next = false;
                return Err(Error::DecodeFailure("fake decoder told to fail".to_string()));
            }
            record.decoded += 1;
        }

        let frame = if chunk.track_id.is_video() {
            RawFrame::Video(VideoFrame {
                width: 2,
                height: 2,
                data: chunk.payload.clone(),
                timestamp_micros: 0,
            })
        } else {
            RawFrame::Audio(AudioFrame {
                samples: vec![0.0; 960],
                sample_rate: 48000,
                channels: 1,
                timestamp_micros: 0,
            })
        };
        if let Some(output) = &self.output {
            let _ = output.send(DecoderEvent::Frame(frame));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.shared
            .records
            .lock()
            .entry(self.key.clone())
            .or_default()
            .flushed += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.output = None;
        if let Some(record) = self.shared.records.lock().get_mut(&self.key) {
            record.output = None;
        }
        self.state = CodecState::Closed;
    }

    fn state(&self) -> CodecState {
        self.state
    }
}

/// Playback sink that records registrations
#[derive(Default)]
pub struct RecordingPlayback {
    added: Mutex<Vec<(PeerAddress, TrackId)>>,
    removed: Mutex<Vec<(PeerAddress, TrackId)>>,
    tracks: Mutex<HashMap<(PeerAddress, TrackId), Arc<OutputTrack>>>,
}

impl RecordingPlayback {
    pub fn added(&self) -> Vec<(PeerAddress, TrackId)> {
        self.added.lock().clone()
    }

    pub fn removed(&self) -> Vec<(PeerAddress, TrackId)> {
        self.removed.lock().clone()
    }

    /// Tracks currently registered
    pub fn track(&self, peer: &PeerAddress, track_id: TrackId) -> Option<Arc<OutputTrack>> {
        self.tracks.lock().get(&(peer.clone(), track_id)).cloned()
    }
}

impl PlaybackSink for RecordingPlayback {
    fn track_added(&self, peer: &PeerAddress, track_id: TrackId, track: Arc<OutputTrack>) {
        self.added.lock().push((peer.clone(), track_id));
        self.tracks.lock().insert((peer.clone(), track_id), track);
    }

    fn track_removed(&self, peer: &PeerAddress, track_id: TrackId) {
        self.removed.lock().push((peer.clone(), track_id));
        self.tracks.lock().remove(&(peer.clone(), track_id));
    }
}
