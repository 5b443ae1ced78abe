//! Media relay channel
//!
//! Encoded media travels outside the peer connection's native tracks, one
//! message-oriented channel per track direction. Outbound messages are bare
//! codec frames. Inbound messages arrive through the relay, which prefixes
//! the sender:
//!
//! ```text
//! [track id: u8][sender IPv4: 4 bytes][duration µs: u64 LE][bitrate tag?][payload ..]
//! ```

use crate::frame::{self, EncodedChunk};
use crate::media::TierFilter;
use crate::registry::{ChunkOutcome, DecoderRegistry};
use crate::track::{PeerAddress, TrackId};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Length of the sender prefix
pub const PEER_PREFIX_LEN: usize = 4;

/// Outbound side of a media relay channel
///
/// `send` never blocks. Implementations shed load instead of queueing
/// without bound.
pub trait MediaRelay: Send + Sync {
    /// Frames are only handed over while the channel is open
    fn is_open(&self) -> bool;

    fn send(&self, track_id: TrackId, frame: Bytes) -> Result<()>;
}

/// Media relay backed by a bounded queue drained by the transport
pub struct ChannelRelay {
    sender: mpsc::Sender<Bytes>,
    open: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelRelay {
    /// Create a relay and the receiving end the transport drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                open: AtomicBool::new(true),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames shed because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MediaRelay for ChannelRelay {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    fn send(&self, track_id: TrackId, frame: Bytes) -> Result<()> {
        match self.sender.try_send(frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Media relay for {} is backed up, {} frames dropped", track_id, dropped);
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::Release);
                Err(Error::ChannelClosed(format!("media relay for {}", track_id)))
            }
        }
    }
}

/// One inbound relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Sender of the media
    pub peer: PeerAddress,

    pub chunk: EncodedChunk,
}

impl InboundFrame {
    /// Parse `[track][ipv4][codec body]`
    pub fn parse(bytes: &[u8], with_bitrate_tag: bool) -> Result<Self> {
        if bytes.len() < 1 + PEER_PREFIX_LEN {
            return Err(Error::MalformedFrame(format!(
                "relay frame is {} bytes, prefix needs {}",
                bytes.len(),
                1 + PEER_PREFIX_LEN
            )));
        }

        let track_id = TrackId(bytes[0]);
        let mut ip = [0u8; PEER_PREFIX_LEN];
        ip.copy_from_slice(&bytes[1..=PEER_PREFIX_LEN]);
        let chunk = frame::decode_body(track_id, &bytes[1 + PEER_PREFIX_LEN..], with_bitrate_tag)?;

        Ok(Self {
            peer: PeerAddress::from_ipv4_bytes(ip),
            chunk,
        })
    }

    /// Build the relay form of a chunk, as the relay does when forwarding
    pub fn encode(&self, with_bitrate_tag: bool) -> Result<Bytes> {
        let ip = self.peer.to_ipv4_bytes()?;
        let body = frame::encode(&self.chunk, with_bitrate_tag);

        let mut buf = BytesMut::with_capacity(body.len() + PEER_PREFIX_LEN);
        buf.put_u8(body[0]);
        buf.put_slice(&ip);
        buf.put_slice(&body[1..]);
        Ok(buf.freeze())
    }
}

/// Demultiplexes inbound relay messages into the decoder registry
///
/// Whether a message carries a bitrate tag is decided per track from the
/// registry's tier list. Of a multi-rate microphone stream only the tier
/// selected by `audio_bitrate_target` reaches the decoder.
pub struct InboundRouter {
    registry: DecoderRegistry,
    tiers: TierFilter,
    malformed: AtomicU64,
}

impl InboundRouter {
    pub fn new(registry: DecoderRegistry) -> Self {
        let config = registry.config();
        let tiers = TierFilter::new(config.audio_bitrate_target, &config.audio_bitrate_tiers);
        debug!("Inbound microphone tier: {:?}", tiers.selected());
        Self {
            registry,
            tiers,
            malformed: AtomicU64::new(0),
        }
    }

    /// Route one message; malformed input is counted and dropped
    pub async fn handle(&self, bytes: &[u8]) -> Result<ChunkOutcome> {
        let tagged = bytes
            .first()
            .is_some_and(|&id| self.registry.config().carries_bitrate_tag(TrackId(id)));
        let frame = InboundFrame::parse(bytes, tagged).map_err(|e| {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping inbound frame: {}", e);
            e
        })?;

        if !self.tiers.accepts(&frame.chunk) {
            return Ok(ChunkOutcome::OtherTier);
        }

        trace!(
            "Inbound {} chunk from {}, {} bytes",
            frame.chunk.track_id,
            frame.peer,
            frame.chunk.payload.len()
        );
        self.registry.process_chunk(&frame.peer, &frame.chunk).await
    }

    /// Drain a transport queue until it closes
    pub async fn run(&self, mut inbound: mpsc::Receiver<Bytes>) {
        info!("Inbound media router started");
        while let Some(bytes) = inbound.recv().await {
            if let Err(e) = self.handle(&bytes).await {
                if !e.is_recoverable() {
                    warn!("Inbound frame not routed: {}", e);
                }
            }
        }
        info!("Inbound media router stopped");
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }
}
