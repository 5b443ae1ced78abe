//! Track transmission pipelines
//!
//! A pipeline pulls raw frames from a live source, hands each frame to every
//! encoder of the track and ships the framed output over the track's media
//! relay. Encoders are configured lazily from the first frame because sample
//! rate, channel count and picture size are only known once media flows.
//!
//! ```text
//! Idle -> Initializing -> Running -> Stopping -> Stopped
//!              \__________________________________/
//!                    configuration rejected
//! ```

use crate::config::TransmitConfig;
use crate::frame;
use crate::media::{Encoder, EncoderEvent, EncoderFactory, EncoderSettings, RawFrame};
use crate::relay::{ChannelRelay, MediaRelay};
use crate::track::TrackId;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Live capture source for one track
#[async_trait]
pub trait MediaSource: Send {
    /// Wait for the next frame; `None` once the source has ended
    async fn next_frame(&mut self) -> Option<RawFrame>;
}

/// Pipeline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        self == PipelineState::Stopped
    }
}

struct ActiveEncoder {
    bitrate: u32,
    encoder: Box<dyn Encoder>,
    forwarder: JoinHandle<()>,
}

/// Handle to one running track pipeline
pub struct TrackPipeline {
    track_id: TrackId,
    state: watch::Receiver<PipelineState>,
    stop: watch::Sender<bool>,
    failure: Arc<SyncMutex<Option<Error>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrackPipeline {
    /// Start pulling from `source`; encoders come up with the first frame
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation; no task is started.
    pub fn spawn(
        track_id: TrackId,
        source: Box<dyn MediaSource>,
        factory: Arc<dyn EncoderFactory>,
        relay: Arc<dyn MediaRelay>,
        config: TransmitConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        let (stop_tx, stop_rx) = watch::channel(false);
        let failure = Arc::new(SyncMutex::new(None));

        let runner = PipelineRunner {
            track_id,
            factory,
            relay,
            config,
            state: state_tx,
            failure: Arc::clone(&failure),
        };
        let task = tokio::spawn(runner.run(source, stop_rx));

        info!("Started transmission pipeline for {}", track_id);

        Ok(Self {
            track_id,
            state: state_rx,
            stop: stop_tx,
            failure,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    /// Wait until the pipeline reaches `target` or stops
    pub async fn wait_for(&self, target: PipelineState) -> PipelineState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s);
        result.unwrap_or(PipelineState::Stopped)
    }

    /// Condition that ended the pipeline early, if any
    pub fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    pub fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Stop reading, flush encoders and wait until `Stopped`
    pub async fn stop(&self) {
        let _ = self.stop.send(true);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Pipeline task for {} panicked: {}", self.track_id, e);
            }
        }
    }
}

struct PipelineRunner {
    track_id: TrackId,
    factory: Arc<dyn EncoderFactory>,
    relay: Arc<dyn MediaRelay>,
    config: TransmitConfig,
    state: watch::Sender<PipelineState>,
    failure: Arc<SyncMutex<Option<Error>>>,
}

impl PipelineRunner {
    fn set_state(&self, next: PipelineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Pipeline {} state: {:?} -> {:?}", self.track_id, previous, next);
        }
    }

    fn bitrates(&self) -> Vec<u32> {
        if self.track_id == TrackId::MICROPHONE_AUDIO {
            self.config.audio_bitrate_tiers.clone()
        } else if self.track_id.is_video() {
            vec![self.config.video_bitrate]
        } else {
            vec![self.config.audio_bitrate]
        }
    }

    async fn run(self, mut source: Box<dyn MediaSource>, mut stop: watch::Receiver<bool>) {
        let (fault_tx, mut faults) = mpsc::unbounded_channel::<String>();
        let mut encoders: Vec<ActiveEncoder> = Vec::new();
        let mut frames_sent: u64 = 0;

        loop {
            let frame = tokio::select! {
                biased;
                _ = stop.wait_for(|stop| *stop) => break,
                Some(message) = faults.recv() => {
                    error!("Encoder fault on {}: {}", self.track_id, message);
                    *self.failure.lock() = Some(Error::EncodingError(message));
                    break;
                }
                frame = source.next_frame() => frame,
            };

            let Some(frame) = frame else {
                info!("Source for {} ended", self.track_id);
                break;
            };

            if encoders.is_empty() {
                self.set_state(PipelineState::Initializing);
                match self.start_encoders(&frame, &fault_tx) {
                    Ok(started) => {
                        encoders = started;
                        self.set_state(PipelineState::Running);
                    }
                    Err(e) => {
                        error!("Cannot start encoders for {}: {}", self.track_id, e);
                        *self.failure.lock() = Some(e);
                        self.set_state(PipelineState::Stopped);
                        return;
                    }
                }
            }

            let force_key_frame = self.track_id.is_video()
                && frames_sent % u64::from(self.config.keyframe_interval) == 0;

            for active in encoders.iter_mut() {
                if let Err(e) = active.encoder.encode(&frame, force_key_frame) {
                    warn!(
                        "Encoding failed on {} at {} bps: {}",
                        self.track_id, active.bitrate, e
                    );
                }
            }
            frames_sent += 1;

            // Release the captured buffer before waiting for the next one
            drop(frame);
        }

        drop(fault_tx);
        self.shutdown(encoders).await;
    }

    fn start_encoders(
        &self,
        first: &RawFrame,
        faults: &mpsc::UnboundedSender<String>,
    ) -> Result<Vec<ActiveEncoder>> {
        let bitrates = self.bitrates();
        let tagged = self.config.carries_bitrate_tag(self.track_id);
        let mut started: Vec<ActiveEncoder> = Vec::with_capacity(bitrates.len());

        for bitrate in bitrates {
            let (tx, rx) = mpsc::unbounded_channel();
            let settings = EncoderSettings {
                track_id: self.track_id,
                bitrate,
                complexity: self.config.audio_complexity,
                framerate: self.config.video_framerate,
            };

            let configured = self
                .factory
                .create_encoder(settings, tx)
                .and_then(|mut encoder| encoder.configure(first).map(|()| encoder));

            let encoder = match configured {
                Ok(encoder) => encoder,
                Err(e) => {
                    for mut active in started {
                        active.encoder.close();
                        active.forwarder.abort();
                    }
                    return Err(e);
                }
            };

            let forwarder = tokio::spawn(forward_chunks(
                self.track_id,
                rx,
                Arc::clone(&self.relay),
                tagged,
                faults.clone(),
            ));

            started.push(ActiveEncoder {
                bitrate,
                encoder,
                forwarder,
            });
        }

        info!(
            "Encoders running for {} ({} instance{})",
            self.track_id,
            started.len(),
            if started.len() > 1 { "s" } else { "" }
        );
        Ok(started)
    }

    async fn shutdown(&self, mut encoders: Vec<ActiveEncoder>) {
        if encoders.is_empty() {
            self.set_state(PipelineState::Stopped);
            return;
        }

        self.set_state(PipelineState::Stopping);

        let timeout = self.config.flush_timeout();
        let flushes = join_all(encoders.iter_mut().map(|a| a.encoder.flush()));
        match tokio::time::timeout(timeout, flushes).await {
            Ok(results) => {
                for result in results.into_iter().filter_map(|r| r.err()) {
                    warn!("Flush failed for {}: {}", self.track_id, result);
                }
            }
            Err(_) => warn!(
                "Flush for {} did not finish within {:?}, closing anyway",
                self.track_id, timeout
            ),
        }

        let mut forwarders = Vec::with_capacity(encoders.len());
        for mut active in encoders {
            active.encoder.close();
            forwarders.push(active.forwarder);
        }

        // Closing drops each encoder's output, letting forwarders drain and exit
        if tokio::time::timeout(timeout, join_all(forwarders)).await.is_err() {
            warn!("Forwarders for {} did not drain in time", self.track_id);
        }

        self.set_state(PipelineState::Stopped);
        info!("Transmission pipeline for {} stopped", self.track_id);
    }
}

async fn forward_chunks(
    track_id: TrackId,
    mut events: mpsc::UnboundedReceiver<EncoderEvent>,
    relay: Arc<dyn MediaRelay>,
    include_bitrate_tag: bool,
    faults: mpsc::UnboundedSender<String>,
) {
    while let Some(event) = events.recv().await {
        match event {
            EncoderEvent::Chunk(chunk) => {
                if !relay.is_open() {
                    continue;
                }
                let bytes = frame::encode(&chunk, include_bitrate_tag);
                if let Err(e) = relay.send(track_id, bytes) {
                    debug!("Relay send failed for {}: {}", track_id, e);
                }
            }
            EncoderEvent::Error(message) => {
                let _ = faults.send(message);
            }
        }
    }
}

/// At most one pipeline per track, started on demand
pub struct TransmitManager {
    config: TransmitConfig,
    factory: Arc<dyn EncoderFactory>,
    pipelines: Mutex<HashMap<TrackId, TrackPipeline>>,
}

impl TransmitManager {
    pub fn new(config: TransmitConfig, factory: Arc<dyn EncoderFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Outbound queue for one track, bounded by `outbound_queue_capacity`
    ///
    /// The receiver end is drained by the transport that carries the track.
    pub fn channel_relay(&self) -> (ChannelRelay, mpsc::Receiver<Bytes>) {
        ChannelRelay::new(self.config.outbound_queue_capacity)
    }

    /// Start transmitting a track
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - A new pipeline was started
    /// * `Ok(false)` - A live pipeline already exists for this track
    pub async fn start(
        &self,
        track_id: TrackId,
        source: Box<dyn MediaSource>,
        relay: Arc<dyn MediaRelay>,
    ) -> Result<bool> {
        let mut pipelines = self.pipelines.lock().await;

        if let Some(existing) = pipelines.get(&track_id) {
            if !existing.state().is_terminal() {
                debug!("Pipeline for {} already running", track_id);
                return Ok(false);
            }
        }

        let pipeline = TrackPipeline::spawn(
            track_id,
            source,
            Arc::clone(&self.factory),
            relay,
            self.config.clone(),
        )?;
        pipelines.insert(track_id, pipeline);
        Ok(true)
    }

    /// Stop one track; returns the failure that ended it early, if any
    pub async fn stop(&self, track_id: TrackId) -> Option<Error> {
        let pipeline = self.pipelines.lock().await.remove(&track_id)?;
        pipeline.stop().await;
        pipeline.take_failure()
    }

    pub async fn stop_all(&self) {
        let pipelines: Vec<TrackPipeline> =
            self.pipelines.lock().await.drain().map(|(_, p)| p).collect();
        for pipeline in pipelines {
            pipeline.stop().await;
        }
    }

    pub async fn state(&self, track_id: TrackId) -> Option<PipelineState> {
        self.pipelines.lock().await.get(&track_id).map(|p| p.state())
    }

    /// Tracks with a pipeline that has not stopped
    pub async fn active_tracks(&self) -> Vec<TrackId> {
        let mut tracks: Vec<TrackId> = self
            .pipelines
            .lock()
            .await
            .iter()
            .filter(|(_, p)| !p.state().is_terminal())
            .map(|(track, _)| *track)
            .collect();
        tracks.sort();
        tracks
    }
}
