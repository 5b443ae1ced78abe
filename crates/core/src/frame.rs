//! Binary frame codec
//!
//! Every encoded chunk travels as one discrete message on a message-oriented
//! channel, laid out as:
//!
//! ```text
//! [track id: u8][duration µs: u64 LE][bitrate tag: u32 LE, multi-rate only][payload ..]
//! ```
//!
//! There is no length prefix; the payload is the rest of the message.
//! The key-frame flag is not carried on the wire. Receivers derive it from
//! the payload (see [`probe_key_frame`]).

use crate::track::TrackId;
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Header size without a bitrate tag
pub const HEADER_LEN: usize = 9;

/// Header size with a bitrate tag
pub const TAGGED_HEADER_LEN: usize = HEADER_LEN + 4;

/// One encoded media chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Logical track the chunk belongs to
    pub track_id: TrackId,

    /// Chunk duration in microseconds
    pub duration_micros: u64,

    /// Target bitrate of the encoder that produced it (multi-rate streams only)
    pub bitrate_tag: Option<u32>,

    /// Raw encoded payload
    pub payload: Bytes,
}

impl EncodedChunk {
    pub fn new(track_id: TrackId, duration_micros: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            track_id,
            duration_micros,
            bitrate_tag: None,
            payload: payload.into(),
        }
    }

    /// Whether the decoder can start from this chunk, read from the payload
    pub fn is_key_frame(&self) -> bool {
        probe_key_frame(self.track_id, &self.payload)
    }

    pub fn with_bitrate_tag(mut self, bitrate: u32) -> Self {
        self.bitrate_tag = Some(bitrate);
        self
    }

    /// Encoded size on the wire
    pub fn wire_len(&self, include_bitrate_tag: bool) -> usize {
        header_len(include_bitrate_tag) + self.payload.len()
    }
}

fn header_len(with_bitrate_tag: bool) -> usize {
    if with_bitrate_tag {
        TAGGED_HEADER_LEN
    } else {
        HEADER_LEN
    }
}

/// Whether frames of `track_id` carry a bitrate tag.
///
/// Only microphone audio is encoded at several bitrates, and only when more
/// than one tier is configured. Sender and receiver evaluate this with the
/// same tier list.
pub fn carries_bitrate_tag(track_id: TrackId, microphone_tiers: &[u32]) -> bool {
    track_id == TrackId::MICROPHONE_AUDIO && microphone_tiers.len() > 1
}

/// Frame a chunk for the media relay.
///
/// Only the track id, duration, bitrate tag and payload are written; the
/// key-frame flag is re-derived from the payload by [`decode`]. With
/// `include_bitrate_tag` a chunk without a tag is written with tag 0 and
/// decodes as `Some(0)`. Whether a track is tagged is decided per track by
/// [`carries_bitrate_tag`].
pub fn encode(chunk: &EncodedChunk, include_bitrate_tag: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(chunk.wire_len(include_bitrate_tag));
    buf.put_u8(chunk.track_id.as_u8());
    buf.put_u64_le(chunk.duration_micros);
    if include_bitrate_tag {
        buf.put_u32_le(chunk.bitrate_tag.unwrap_or(0));
    }
    buf.put_slice(&chunk.payload);
    buf.freeze()
}

/// Parse one framed chunk
pub fn decode(bytes: &[u8], with_bitrate_tag: bool) -> Result<EncodedChunk> {
    let min = header_len(with_bitrate_tag);
    if bytes.len() < min {
        return Err(Error::MalformedFrame(format!(
            "frame is {} bytes, header needs {}",
            bytes.len(),
            min
        )));
    }
    decode_body(TrackId(bytes[0]), &bytes[1..], with_bitrate_tag)
}

/// Parse everything after the track id byte
pub(crate) fn decode_body(
    track_id: TrackId,
    body: &[u8],
    with_bitrate_tag: bool,
) -> Result<EncodedChunk> {
    let min = header_len(with_bitrate_tag) - 1;
    if body.len() < min {
        return Err(Error::MalformedFrame(format!(
            "frame body is {} bytes, header needs {}",
            body.len(),
            min
        )));
    }

    let mut duration = [0u8; 8];
    duration.copy_from_slice(&body[..8]);
    let bitrate_tag = if with_bitrate_tag {
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&body[8..12]);
        Some(u32::from_le_bytes(tag))
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(&body[min..]);

    Ok(EncodedChunk {
        track_id,
        duration_micros: u64::from_le_bytes(duration),
        bitrate_tag,
        payload,
    })
}

/// Audio chunks are independently decodable; video chunks are probed.
pub fn probe_key_frame(track_id: TrackId, payload: &[u8]) -> bool {
    if track_id.is_video() {
        vp9_is_key_frame(payload)
    } else {
        true
    }
}

/// Read the VP9 uncompressed header to tell key frames from inter frames.
pub fn vp9_is_key_frame(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };

    // frame_marker must be 0b10
    if first >> 6 != 0b10 {
        return false;
    }

    let profile_low = (first >> 5) & 1;
    let profile_high = (first >> 4) & 1;
    let profile = (profile_high << 1) | profile_low;

    // profile 3 carries an extra reserved bit before show_existing_frame
    let shift = if profile == 3 { 2 } else { 3 };
    let show_existing_frame = (first >> shift) & 1;
    let frame_type = (first >> (shift - 1)) & 1;

    show_existing_frame == 0 && frame_type == 0
}
