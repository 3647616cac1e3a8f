use serde::Serialize;

use super::channel::{Channel, ChannelId};
use crate::client::SendPayHop;

/// CLTV delta required by the final hop (the local node itself).
pub const FINAL_CLTV: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hop {
    pub channel: ChannelId,
    pub source: String,
    pub destination: String,
    /// Amount this hop delivers to `destination`.
    pub amount_msat: u64,
    pub delay: u32,
}

/// A route that leaves the local node and comes back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub hops: Vec<Hop>,
    /// Amount delivered back to the local node.
    pub amount_msat: u64,
}

impl Route {
    /// Assemble a route over `halves`, working back from the last hop, which
    /// carries exactly `amount_msat`. Each hop's forwarding node charges the
    /// fee of the half it forwards over, so the first hop carries the total.
    pub fn build(halves: &[&Channel], amount_msat: u64) -> Self {
        let mut hops = Vec::with_capacity(halves.len());
        let mut amount = amount_msat;
        let mut delay = FINAL_CLTV;

        for (i, half) in halves.iter().enumerate().rev() {
            hops.push(Hop {
                channel: half.id.clone(),
                source: half.source.clone(),
                destination: half.destination.clone(),
                amount_msat: amount,
                delay,
            });
            // The sender charges nothing for the first hop.
            if i > 0 {
                amount = amount.saturating_add(half.fee_for(amount));
                delay = delay.saturating_add(half.delay);
            }
        }
        hops.reverse();

        Self { hops, amount_msat }
    }

    pub fn fee_msat(&self) -> u64 {
        self.hops
            .first()
            .map(|h| h.amount_msat.saturating_sub(self.amount_msat))
            .unwrap_or(0)
    }

    pub fn fee_ppm(&self) -> u64 {
        if self.amount_msat == 0 {
            return 0;
        }
        (self.fee_msat() as u128 * 1_000_000 / self.amount_msat as u128) as u64
    }

    /// `fee * 1e6 <= max_ppm * amount`, exact in integers.
    pub fn within_ppm(&self, max_ppm: u64) -> bool {
        self.fee_msat() as u128 * 1_000_000 <= max_ppm as u128 * self.amount_msat as u128
    }

    pub fn out_scid(&self) -> Option<&str> {
        self.hops.first().map(|h| h.channel.scid.as_str())
    }

    pub fn in_scid(&self) -> Option<&str> {
        self.hops.last().map(|h| h.channel.scid.as_str())
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.hops.iter().map(|h| h.channel.clone()).collect()
    }

    pub fn to_sendpay(&self) -> Vec<SendPayHop> {
        self.hops
            .iter()
            .map(|h| SendPayHop {
                id: h.destination.clone(),
                channel: h.channel.scid.clone(),
                direction: h.channel.direction,
                amount_msat: h.amount_msat,
                delay: h.delay,
            })
            .collect()
    }

    /// Compact `scid/dir,scid/dir` form stored with attempt records.
    pub fn describe(&self) -> String {
        self.hops
            .iter()
            .map(|h| h.channel.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
