//! Codec seams
//!
//! Encoders and decoders report their output on a channel handed to them at
//! construction time. The owning pipeline or registry drains that channel,
//! so nothing outside the codec captures its mutable state.

use crate::frame::EncodedChunk;
use crate::track::{MediaKind, PeerAddress, TrackId};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Raw interleaved PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved samples in the range -1.0 to 1.0
    pub samples: Vec<f32>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of interleaved channels
    pub channels: u16,

    /// Presentation timestamp in microseconds
    pub timestamp_micros: u64,
}

impl AudioFrame {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }
}

/// Raw I420 video picture
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,

    /// Planar I420 pixel data
    pub data: Bytes,

    /// Presentation timestamp in microseconds
    pub timestamp_micros: u64,
}

/// A frame pulled from a live capture source
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl RawFrame {
    pub fn kind(&self) -> MediaKind {
        match self {
            RawFrame::Audio(_) => MediaKind::Audio,
            RawFrame::Video(_) => MediaKind::Video,
        }
    }

    pub fn timestamp_micros(&self) -> u64 {
        match self {
            RawFrame::Audio(f) => f.timestamp_micros,
            RawFrame::Video(f) => f.timestamp_micros,
        }
    }
}

/// A frame produced by a decoder, written to an output track
pub type DecodedFrame = RawFrame;

/// Lifecycle of an encoder or decoder handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    /// Created but not yet configured
    Unconfigured,
    /// Ready to accept input
    Configured,
    /// Closed, no further input accepted
    Closed,
}

/// Output of an encoder instance
#[derive(Debug)]
pub enum EncoderEvent {
    Chunk(EncodedChunk),
    /// Asynchronous internal fault
    Error(String),
}

/// Output of a decoder instance
#[derive(Debug)]
pub enum DecoderEvent {
    Frame(DecodedFrame),
    /// Asynchronous internal fault
    Error(String),
}

pub type EncoderOutput = mpsc::UnboundedSender<EncoderEvent>;
pub type DecoderOutput = mpsc::UnboundedSender<DecoderEvent>;

/// Parameters for one encoder instance
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    /// Track the encoder produces chunks for
    pub track_id: TrackId,

    /// Target bitrate in bits per second
    pub bitrate: u32,

    /// Opus complexity (audio only)
    pub complexity: u32,

    /// Frames per second (video only)
    pub framerate: u32,
}

/// Encoder instance owned by a transmission pipeline
#[async_trait]
pub trait Encoder: Send {
    /// Configure from the first real frame, whose metadata is only known once media flows
    ///
    /// # Errors
    ///
    /// `ConfigurationUnsupported` if the frame parameters cannot be encoded.
    fn configure(&mut self, first: &RawFrame) -> Result<()>;

    /// Encode one frame; chunks are emitted on the output channel
    fn encode(&mut self, frame: &RawFrame, force_key_frame: bool) -> Result<()>;

    /// Emit everything still buffered
    async fn flush(&mut self) -> Result<()>;

    /// Release the codec and its output channel
    fn close(&mut self);

    fn state(&self) -> CodecState;
}

/// Decoder instance owned by the decoder registry
#[async_trait]
pub trait Decoder: Send {
    /// Feed one chunk; frames are emitted on the output channel
    ///
    /// # Errors
    ///
    /// `DecodeFailure` if the codec rejects the chunk.
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Release the codec and its output channel
    fn close(&mut self);

    fn state(&self) -> CodecState;
}

/// Creates encoders for outbound tracks
pub trait EncoderFactory: Send + Sync {
    /// # Errors
    ///
    /// `EncoderUnavailable` if this runtime cannot encode the track's media kind.
    fn create_encoder(
        &self,
        settings: EncoderSettings,
        output: EncoderOutput,
    ) -> Result<Box<dyn Encoder>>;
}

/// Creates decoders for inbound (peer, track) pairs
pub trait DecoderFactory: Send + Sync {
    fn create_decoder(
        &self,
        peer: &PeerAddress,
        track_id: TrackId,
        output: DecoderOutput,
    ) -> Result<Box<dyn Decoder>>;
}
