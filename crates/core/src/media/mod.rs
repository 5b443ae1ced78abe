//! Codec seams and the codecs that ship with the engine

pub mod audio;
pub mod bitrate;
pub mod codec;

pub use bitrate::{select_tier, TierFilter};
pub use codec::{
    AudioFrame, CodecState, DecodedFrame, Decoder, DecoderEvent, DecoderFactory, DecoderOutput,
    Encoder, EncoderEvent, EncoderFactory, EncoderOutput, EncoderSettings, RawFrame, VideoFrame,
};
pub use audio::{OpusCodecs, OpusDecoder, OpusEncoder};
