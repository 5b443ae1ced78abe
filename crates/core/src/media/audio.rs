//! Audio codec support (Opus)

use super::codec::{
    AudioFrame, CodecState, Decoder, DecoderEvent, DecoderFactory, DecoderOutput, Encoder,
    EncoderEvent, EncoderFactory, EncoderOutput, EncoderSettings, RawFrame,
};
use crate::config::RegistryConfig;
use crate::frame::EncodedChunk;
use crate::track::{MediaKind, PeerAddress, TrackId};
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

/// Audio frame duration in milliseconds (Opus standard)
pub const FRAME_DURATION_MS: u32 = 20;

/// Max Opus packet size in bytes
const MAX_PACKET_SIZE: usize = 4000;

/// Max frame size for Opus is 120ms @ 48kHz = 5760 samples per channel
const MAX_FRAME_SIZE: usize = 5760;

/// Sample rates accepted by libopus
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

fn opus_channels(channels: u16) -> Result<opus::Channels> {
    match channels {
        1 => Ok(opus::Channels::Mono),
        2 => Ok(opus::Channels::Stereo),
        n => Err(Error::ConfigurationUnsupported(format!(
            "Opus supports 1 (mono) or 2 (stereo) channels, got {}",
            n
        ))),
    }
}

fn check_sample_rate(sample_rate: u32) -> Result<()> {
    if SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        Ok(())
    } else {
        Err(Error::ConfigurationUnsupported(format!(
            "Opus sample rate must be one of {:?} Hz, got {}",
            SUPPORTED_SAMPLE_RATES, sample_rate
        )))
    }
}

/// Opus encoder for one bitrate tier of one track
///
/// Input of any length is cut into 20 ms frames; the remainder waits for the
/// next call and is zero-padded on flush.
pub struct OpusEncoder {
    settings: EncoderSettings,
    encoder: Option<opus::Encoder>,
    output: Option<EncoderOutput>,
    pending: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    closed: bool,
}

// SAFETY: each encoder instance is independent and only ever touched by the
// pipeline task that owns it.
unsafe impl Send for OpusEncoder {}

impl OpusEncoder {
    pub fn new(settings: EncoderSettings, output: EncoderOutput) -> Self {
        Self {
            settings,
            encoder: None,
            output: Some(output),
            pending: Vec::new(),
            sample_rate: 0,
            channels: 0,
            closed: false,
        }
    }

    /// Interleaved samples per 20 ms frame
    fn frame_len(&self) -> usize {
        (self.sample_rate / (1000 / FRAME_DURATION_MS)) as usize * usize::from(self.channels)
    }

    fn emit_frames(&mut self) -> Result<()> {
        let frame_len = self.frame_len();
        if frame_len == 0 {
            return Ok(());
        }

        while self.pending.len() >= frame_len {
            let samples: Vec<f32> = self.pending.drain(..frame_len).collect();
            self.emit(&samples)?;
        }
        Ok(())
    }

    fn emit(&mut self, samples: &[f32]) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::EncodingError("Opus encoder is not configured".to_string()))?;

        let mut packet = vec![0u8; MAX_PACKET_SIZE];
        let len = encoder
            .encode_float(samples, &mut packet)
            .map_err(|e| Error::EncodingError(format!("Opus encoding failed: {}", e)))?;
        packet.truncate(len);

        let chunk = EncodedChunk::new(
            self.settings.track_id,
            u64::from(FRAME_DURATION_MS) * 1000,
            packet,
        )
        .with_bitrate_tag(self.settings.bitrate);

        if let Some(output) = &self.output {
            if output.send(EncoderEvent::Chunk(chunk)).is_err() {
                debug!("Opus output for {} dropped, receiver gone", self.settings.track_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Encoder for OpusEncoder {
    fn configure(&mut self, first: &RawFrame) -> Result<()> {
        let RawFrame::Audio(frame) = first else {
            return Err(Error::ConfigurationUnsupported(
                "Opus encoder needs audio frames".to_string(),
            ));
        };

        check_sample_rate(frame.sample_rate)?;
        let channels = opus_channels(frame.channels)?;

        if self.settings.complexity > 10 {
            return Err(Error::ConfigurationUnsupported(
                "Opus complexity must be 0-10".to_string(),
            ));
        }

        let application = if self.settings.track_id == TrackId::MICROPHONE_AUDIO {
            opus::Application::Voip
        } else {
            opus::Application::Audio
        };

        let mut encoder = opus::Encoder::new(frame.sample_rate, channels, application)
            .map_err(|e| {
                Error::ConfigurationUnsupported(format!("Failed to create Opus encoder: {:?}", e))
            })?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(self.settings.bitrate as i32))
            .map_err(|e| Error::ConfigurationUnsupported(format!("Failed to set bitrate: {:?}", e)))?;

        debug!(
            "Configured Opus encoder for {}: {} Hz, {} ch, {} bps",
            self.settings.track_id, frame.sample_rate, frame.channels, self.settings.bitrate
        );

        self.sample_rate = frame.sample_rate;
        self.channels = frame.channels;
        self.encoder = Some(encoder);
        Ok(())
    }

    fn encode(&mut self, frame: &RawFrame, _force_key_frame: bool) -> Result<()> {
        let RawFrame::Audio(AudioFrame {
            samples,
            sample_rate,
            channels,
            ..
        }) = frame
        else {
            return Err(Error::EncodingError("Opus encoder got a video frame".to_string()));
        };

        if *sample_rate != self.sample_rate || *channels != self.channels {
            return Err(Error::EncodingError(format!(
                "Audio format changed mid-stream: {} Hz {} ch, expected {} Hz {} ch",
                sample_rate, channels, self.sample_rate, self.channels
            )));
        }

        self.pending.extend_from_slice(samples);
        self.emit_frames()
    }

    async fn flush(&mut self) -> Result<()> {
        if self.encoder.is_none() || self.pending.is_empty() {
            return Ok(());
        }

        let frame_len = self.frame_len();
        let mut samples = std::mem::take(&mut self.pending);
        samples.resize(frame_len, 0.0);
        self.emit(&samples)
    }

    fn close(&mut self) {
        self.encoder = None;
        self.output = None;
        self.pending.clear();
        self.closed = true;
    }

    fn state(&self) -> CodecState {
        match (&self.encoder, self.closed) {
            (_, true) => CodecState::Closed,
            (Some(_), false) => CodecState::Configured,
            (None, false) => CodecState::Unconfigured,
        }
    }
}

/// Opus decoder for one (peer, track) pair
pub struct OpusDecoder {
    decoder: Option<opus::Decoder>,
    output: Option<DecoderOutput>,
    sample_rate: u32,
    channels: u16,
    position_micros: u64,
}

// SAFETY: each decoder instance is independent and guarded by its registry entry lock.
unsafe impl Send for OpusDecoder {}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16, output: DecoderOutput) -> Result<Self> {
        check_sample_rate(sample_rate)?;
        let opus_channels = opus_channels(channels)?;

        let decoder = opus::Decoder::new(sample_rate, opus_channels).map_err(|e| {
            Error::ConfigurationUnsupported(format!("Failed to create Opus decoder: {:?}", e))
        })?;

        Ok(Self {
            decoder: Some(decoder),
            output: Some(output),
            sample_rate,
            channels,
            position_micros: 0,
        })
    }
}

#[async_trait]
impl Decoder for OpusDecoder {
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<()> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::DecodeFailure("Opus decoder is closed".to_string()))?;

        let mut samples = vec![0f32; MAX_FRAME_SIZE * usize::from(self.channels)];
        let len = decoder
            .decode_float(&chunk.payload, &mut samples, false)
            .map_err(|e| Error::DecodeFailure(format!("Opus decoding failed: {:?}", e)))?;
        samples.truncate(len * usize::from(self.channels));

        let frame = AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp_micros: self.position_micros,
        };
        self.position_micros += chunk.duration_micros;

        if let Some(output) = &self.output {
            let _ = output.send(DecoderEvent::Frame(RawFrame::Audio(frame)));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.decoder = None;
        self.output = None;
    }

    fn state(&self) -> CodecState {
        if self.decoder.is_some() {
            CodecState::Configured
        } else {
            CodecState::Closed
        }
    }
}

/// Codec set available without platform video codecs: Opus for audio tracks.
///
/// Video tracks report `EncoderUnavailable`; applications with a VP9 codec
/// plug in their own factories.
#[derive(Debug, Clone, Default)]
pub struct OpusCodecs {
    decode_config: RegistryConfig,
}

impl OpusCodecs {
    pub fn new(decode_config: RegistryConfig) -> Self {
        Self { decode_config }
    }
}

impl EncoderFactory for OpusCodecs {
    fn create_encoder(
        &self,
        settings: EncoderSettings,
        output: EncoderOutput,
    ) -> Result<Box<dyn Encoder>> {
        match settings.track_id.kind() {
            MediaKind::Audio => Ok(Box::new(OpusEncoder::new(settings, output))),
            MediaKind::Video => Err(Error::EncoderUnavailable(format!(
                "No video encoder available for {}",
                settings.track_id
            ))),
        }
    }
}

impl DecoderFactory for OpusCodecs {
    fn create_decoder(
        &self,
        _peer: &PeerAddress,
        track_id: TrackId,
        output: DecoderOutput,
    ) -> Result<Box<dyn Decoder>> {
        match track_id.kind() {
            MediaKind::Audio => Ok(Box::new(OpusDecoder::new(
                self.decode_config.audio_sample_rate,
                self.decode_config.audio_channels,
                output,
            )?)),
            MediaKind::Video => Err(Error::EncoderUnavailable(format!(
                "No video decoder available for {}",
                track_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn settings(bitrate: u32) -> EncoderSettings {
        EncoderSettings {
            track_id: TrackId::MICROPHONE_AUDIO,
            bitrate,
            complexity: 10,
            framerate: 30,
        }
    }

    fn tone(samples_per_channel: usize, channels: u16) -> RawFrame {
        let samples = (0..samples_per_channel * usize::from(channels))
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        RawFrame::Audio(AudioFrame {
            samples,
            sample_rate: 48000,
            channels,
            timestamp_micros: 0,
        })
    }

    #[test]
    fn test_encoder_rejects_unsupported_rate() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut encoder = OpusEncoder::new(settings(64_000), tx);
        let frame = RawFrame::Audio(AudioFrame {
            samples: vec![0.0; 441],
            sample_rate: 44100,
            channels: 1,
            timestamp_micros: 0,
        });

        let err = encoder.configure(&frame).unwrap_err();
        assert!(matches!(err, Error::ConfigurationUnsupported(_)));
        assert_eq!(encoder.state(), CodecState::Unconfigured);
    }

    #[tokio::test]
    async fn test_encoder_buffers_partial_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut encoder = OpusEncoder::new(settings(32_000), tx);
        let first = tone(480, 1);
        encoder.configure(&first).unwrap();

        // 10 ms is half an Opus frame
        encoder.encode(&first, false).unwrap();
        assert!(rx.try_recv().is_err());

        encoder.encode(&first, false).unwrap();
        match rx.try_recv().unwrap() {
            EncoderEvent::Chunk(chunk) => {
                assert_eq!(chunk.duration_micros, 20_000);
                assert_eq!(chunk.bitrate_tag, Some(32_000));
                assert!(chunk.is_key_frame());
            }
            other => panic!("unexpected event {:?}", other),
        }

        // flush pads the trailing 10 ms
        encoder.encode(&first, false).unwrap();
        encoder.flush().await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), EncoderEvent::Chunk(_)));

        encoder.close();
        assert_eq!(encoder.state(), CodecState::Closed);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_decode_roundtrip_through_codec() {
        let (etx, mut erx) = mpsc::unbounded_channel();
        let mut encoder = OpusEncoder::new(settings(64_000), etx);
        let frame = tone(960, 2);
        encoder.configure(&frame).unwrap();
        encoder.encode(&frame, false).unwrap();
        let EncoderEvent::Chunk(chunk) = erx.try_recv().unwrap() else {
            panic!("expected chunk");
        };

        let (dtx, mut drx) = mpsc::unbounded_channel();
        let mut decoder = OpusDecoder::new(48000, 2, dtx).unwrap();
        decoder.decode(&chunk).unwrap();
        match drx.try_recv().unwrap() {
            DecoderEvent::Frame(RawFrame::Audio(decoded)) => {
                assert_eq!(decoded.channels, 2);
                assert_eq!(decoded.frames(), 960);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_video_unavailable() {
        let codecs = OpusCodecs::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = codecs.create_encoder(
            EncoderSettings {
                track_id: TrackId::SCREEN_VIDEO,
                ..settings(2_000_000)
            },
            tx,
        );
        assert!(matches!(result, Err(Error::EncoderUnavailable(_))));
    }
}
