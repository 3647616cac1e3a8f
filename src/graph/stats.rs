use serde::Serialize;

use super::channel::Channel;

/// Halves with at least 200 000 sat of estimated liquidity count as liquid;
/// the same bound applies to htlc_maximum.
pub const LIQUID_THRESHOLD_MSAT: u64 = 200_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub channels: usize,
    pub active_channels: usize,
    pub liquid_channels: usize,
    pub max_htlc_channels: usize,
}

impl GraphStats {
    pub fn collect<'a>(nodes: usize, channels: impl Iterator<Item = &'a Channel>) -> Self {
        let mut stats = GraphStats {
            nodes,
            ..Default::default()
        };
        for ch in channels {
            stats.channels += 1;
            if ch.active {
                stats.active_channels += 1;
            }
            if ch.liquidity_msat >= LIQUID_THRESHOLD_MSAT {
                stats.liquid_channels += 1;
            }
            if ch.htlc_maximum_msat >= LIQUID_THRESHOLD_MSAT {
                stats.max_htlc_channels += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::channel::ChannelId;

    fn half(active: bool, liquidity_msat: u64, htlc_max: u64) -> Channel {
        Channel {
            id: ChannelId::new("1x1x1", 0),
            source: "02aa".to_string(),
            destination: "02bb".to_string(),
            capacity_msat: 1_000_000_000,
            base_fee_msat: 0,
            fee_ppm: 0,
            delay: 6,
            htlc_minimum_msat: 0,
            htlc_maximum_msat: htlc_max,
            active,
            liquidity_msat,
            liquidity_updated_at: 0,
        }
    }

    #[test]
    fn test_collect_thresholds() {
        let halves = vec![
            half(true, LIQUID_THRESHOLD_MSAT, LIQUID_THRESHOLD_MSAT),
            half(true, LIQUID_THRESHOLD_MSAT - 1, LIQUID_THRESHOLD_MSAT - 1),
            half(false, 0, 990_000_000),
        ];
        let stats = GraphStats::collect(2, halves.iter());
        assert_eq!(
            stats,
            GraphStats {
                nodes: 2,
                channels: 3,
                active_channels: 2,
                liquid_channels: 1,
                max_htlc_channels: 2,
            }
        );
        assert!(stats.channels >= stats.active_channels);
    }
}
