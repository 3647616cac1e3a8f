use serde::Serialize;
use std::fmt;

use crate::client::{ChannelUpdate, GossipChannel};

/// Gossip direction of a half: 0 when `source` sorts before `destination`.
pub fn direction_of(source: &str, destination: &str) -> u8 {
    if source < destination {
        0
    } else {
        1
    }
}

/// Fee a half charges to forward `amount_msat`, rounded down.
pub fn fee_for(base_fee_msat: u64, fee_ppm: u64, amount_msat: u64) -> u64 {
    let proportional = amount_msat as u128 * fee_ppm as u128 / 1_000_000;
    base_fee_msat.saturating_add(proportional.min(u64::MAX as u128) as u64)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId {
    pub scid: String,
    pub direction: u8,
}

impl ChannelId {
    pub fn new(scid: &str, direction: u8) -> Self {
        Self {
            scid: scid.to_string(),
            direction,
        }
    }

    pub fn opposite(&self) -> Self {
        Self {
            scid: self.scid.clone(),
            direction: self.direction ^ 1,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scid, self.direction)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub alias: String,
    pub connected: bool,
}

impl Node {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            alias: String::new(),
            connected: false,
        }
    }
}

/// One directed half of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub source: String,
    pub destination: String,
    pub capacity_msat: u64,
    pub base_fee_msat: u64,
    pub fee_ppm: u64,
    pub delay: u32,
    pub htlc_minimum_msat: u64,
    pub htlc_maximum_msat: u64,
    pub active: bool,
    /// Estimated amount that can be sent from `source` to `destination`.
    pub liquidity_msat: u64,
    /// Unix seconds at which `liquidity_msat` was last set.
    pub liquidity_updated_at: i64,
}

impl Channel {
    pub fn from_gossip(g: &GossipChannel, now: i64) -> Self {
        Self {
            id: ChannelId::new(&g.short_channel_id, direction_of(&g.source, &g.destination)),
            source: g.source.clone(),
            destination: g.destination.clone(),
            capacity_msat: g.amount_msat,
            base_fee_msat: g.base_fee_millisatoshi,
            fee_ppm: g.fee_per_millionth,
            delay: g.delay,
            htlc_minimum_msat: g.htlc_minimum_msat,
            htlc_maximum_msat: g.htlc_maximum_msat.unwrap_or(g.amount_msat),
            active: g.active,
            liquidity_msat: g.amount_msat / 2,
            liquidity_updated_at: now,
        }
    }

    /// Half of an own channel the gossip view does not (yet) carry.
    pub fn from_peer_update(
        scid: &str,
        source: &str,
        destination: &str,
        capacity_msat: u64,
        update: Option<&ChannelUpdate>,
        now: i64,
    ) -> Self {
        let update = update.cloned().unwrap_or_default();
        let htlc_maximum_msat = if update.htlc_maximum_msat == 0 {
            capacity_msat
        } else {
            update.htlc_maximum_msat
        };
        Self {
            id: ChannelId::new(scid, direction_of(source, destination)),
            source: source.to_string(),
            destination: destination.to_string(),
            capacity_msat,
            base_fee_msat: update.fee_base_msat,
            fee_ppm: update.fee_proportional_millionths,
            delay: update.cltv_expiry_delta,
            htlc_minimum_msat: update.htlc_minimum_msat,
            htlc_maximum_msat,
            active: false,
            liquidity_msat: 0,
            liquidity_updated_at: now,
        }
    }

    /// Replace the gossip-sourced fields, keeping the liquidity estimate.
    pub fn update_from_gossip(&mut self, g: &GossipChannel) {
        self.capacity_msat = g.amount_msat;
        self.base_fee_msat = g.base_fee_millisatoshi;
        self.fee_ppm = g.fee_per_millionth;
        self.delay = g.delay;
        self.htlc_minimum_msat = g.htlc_minimum_msat;
        self.htlc_maximum_msat = g.htlc_maximum_msat.unwrap_or(g.amount_msat);
        self.active = g.active;
        self.liquidity_msat = self.liquidity_msat.min(self.capacity_msat);
    }

    pub fn set_liquidity(&mut self, liquidity_msat: u64, now: i64) {
        self.liquidity_msat = liquidity_msat;
        self.liquidity_updated_at = now;
    }

    pub fn fee_for(&self, amount_msat: u64) -> u64 {
        fee_for(self.base_fee_msat, self.fee_ppm, amount_msat)
    }

    /// Whether this half can forward `amount_msat` in a single HTLC.
    pub fn can_carry(&self, amount_msat: u64) -> bool {
        self.active
            && self.liquidity_msat >= amount_msat
            && self.htlc_minimum_msat <= amount_msat
            && amount_msat <= self.htlc_maximum_msat
    }
}
