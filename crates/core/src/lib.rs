//! peermux media engine
//!
//! Multiplexes several logical media tracks (microphone audio, secondary
//! audio, screen video) over message-oriented relay channels and
//! demultiplexes them again on the receiving side.
//!
//! - [`frame`]: the binary frame codec every encoded chunk travels in
//! - [`pipeline`]: per-track transmission pipelines with multi-bitrate audio
//! - [`registry`]: per-(peer, track) decoders with key-frame gating and fault restart
//! - [`relay`]: outbound relay channels and the inbound demultiplexer
//!
//! # Example
//!
//! ```
//! use peermux_core::frame::{self, EncodedChunk};
//! use peermux_core::TrackId;
//!
//! let chunk = EncodedChunk::new(TrackId::MICROPHONE_AUDIO, 20_000, vec![0xFC, 0x01]);
//! let bytes = frame::encode(&chunk, false);
//! assert_eq!(frame::decode(&bytes, false).unwrap(), chunk);
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod media;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod track;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{RegistryConfig, TransmitConfig};
pub use error::{Error, Result};
pub use frame::EncodedChunk;
pub use pipeline::{MediaSource, PipelineState, TrackPipeline, TransmitManager};
pub use registry::{ChunkOutcome, DecoderInfo, DecoderRegistry, OutputTrack, PlaybackSink};
pub use relay::{ChannelRelay, InboundFrame, InboundRouter, MediaRelay};
pub use track::{MediaKind, PeerAddress, TrackId};
