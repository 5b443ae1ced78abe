//! Bitrate tier selection for multi-rate audio
//!
//! Microphone audio is encoded once per tier and every frame carries the tier
//! in its bitrate tag. The inbound router keeps only the frames of the best
//! tier that fits the receiver's target.

use crate::frame::EncodedChunk;

/// Largest tier not above `target`; the lowest tier when none fits
pub fn select_tier(target: u32, tiers: &[u32]) -> Option<u32> {
    let lowest = tiers.iter().copied().min()?;
    Some(
        tiers
            .iter()
            .copied()
            .filter(|&tier| tier <= target)
            .max()
            .unwrap_or(lowest),
    )
}

/// Keeps the frames of one tier of a multi-rate stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierFilter {
    selected: Option<u32>,
}

impl TierFilter {
    pub fn new(target: u32, tiers: &[u32]) -> Self {
        Self {
            selected: select_tier(target, tiers),
        }
    }

    pub fn selected(&self) -> Option<u32> {
        self.selected
    }

    /// Untagged chunks come from single-rate tracks and always pass.
    pub fn accepts(&self, chunk: &EncodedChunk) -> bool {
        match (chunk.bitrate_tag, self.selected) {
            (None, _) => true,
            (Some(tag), Some(selected)) => tag == selected,
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_AUDIO_BITRATE_TIERS;
    use crate::track::TrackId;

    #[test]
    fn test_select_tier() {
        let tiers = DEFAULT_AUDIO_BITRATE_TIERS;
        assert_eq!(select_tier(128_000, &tiers), Some(128_000));
        assert_eq!(select_tier(100_000, &tiers), Some(64_000));
        assert_eq!(select_tier(64_000, &tiers), Some(64_000));
        assert_eq!(select_tier(8_000, &tiers), Some(32_000));
        assert_eq!(select_tier(64_000, &[]), None);
    }

    #[test]
    fn test_filter_keeps_selected_tier() {
        let filter = TierFilter::new(70_000, &DEFAULT_AUDIO_BITRATE_TIERS);
        let chunk = |tier| EncodedChunk::new(TrackId::MICROPHONE_AUDIO, 20_000, vec![1]).with_bitrate_tag(tier);

        assert!(filter.accepts(&chunk(64_000)));
        assert!(!filter.accepts(&chunk(32_000)));
        assert!(!filter.accepts(&chunk(128_000)));
        assert!(filter.accepts(&EncodedChunk::new(TrackId::SECONDARY_AUDIO, 20_000, vec![1])));
    }
}
