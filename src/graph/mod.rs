pub mod channel;
pub mod pathfinder;
pub mod route;
pub mod stats;
pub mod store;

pub use channel::{Channel, ChannelId, Node};
pub use route::Route;
pub use stats::GraphStats;

use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::client::{GossipChannel, GossipNode, NodeClient, PeerChannel};
use crate::error::{RebalanceError, RebalanceResult};
use channel::direction_of;

/// Liquidity assumed on a failing half is the attempted amount minus this.
const FAILURE_LIQUIDITY_MARGIN_MSAT: u64 = 1_000_000;

/// Best-known view of the network: gossip halves, the local node's own
/// channels, and per-half liquidity estimates.
pub struct ChannelGraph {
    self_id: String,
    nodes: HashMap<String, Node>,
    channels: HashMap<ChannelId, Channel>,
    /// Halves keyed by destination, for backward search.
    inbound: HashMap<String, Vec<ChannelId>>,
    /// Own channels keyed by scid.
    peers: HashMap<String, PeerChannel>,
}

impl ChannelGraph {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            nodes: HashMap::new(),
            channels: HashMap::new(),
            inbound: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn channel(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Halves whose destination is `node`.
    pub fn incoming<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a Channel> + 'a {
        self.inbound
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.channels.get(id))
    }

    pub fn peer_channel(&self, scid: &str) -> Option<&PeerChannel> {
        self.peers.get(scid)
    }

    pub fn peer_channels(&self) -> impl Iterator<Item = &PeerChannel> {
        self.peers.values()
    }

    pub fn is_own(&self, scid: &str) -> bool {
        self.peers.contains_key(scid)
    }

    /// Half of an own channel leading from the local node to the peer.
    pub fn out_half(&self, scid: &str) -> Option<&Channel> {
        let peer = self.peers.get(scid)?;
        self.channels.get(&ChannelId::new(
            scid,
            direction_of(&self.self_id, &peer.peer_id),
        ))
    }

    /// Half of an own channel leading from the peer to the local node.
    pub fn in_half(&self, scid: &str) -> Option<&Channel> {
        let peer = self.peers.get(scid)?;
        self.channels.get(&ChannelId::new(
            scid,
            direction_of(&peer.peer_id, &self.self_id),
        ))
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats::collect(self.nodes.len(), self.channels.values())
    }

    /// Seed an empty graph from a saved snapshot. Halves already present
    /// are kept as they are.
    pub fn restore(&mut self, halves: Vec<Channel>, nodes: Vec<(String, String)>) {
        for (id, alias) in nodes {
            self.ensure_node(&id);
            if let Some(node) = self.nodes.get_mut(&id) {
                node.alias = alias;
            }
        }
        for ch in halves {
            if !self.channels.contains_key(&ch.id) {
                self.insert_half(ch);
            }
        }
        self.recompute_connectivity();
    }

    fn insert_half(&mut self, ch: Channel) {
        self.ensure_node(&ch.source);
        self.ensure_node(&ch.destination);
        self.inbound
            .entry(ch.destination.clone())
            .or_default()
            .push(ch.id.clone());
        self.channels.insert(ch.id.clone(), ch);
    }

    fn ensure_node(&mut self, id: &str) {
        if !self.nodes.contains_key(id) {
            self.nodes.insert(id.to_string(), Node::new(id));
        }
    }

    /// Merge a full gossip snapshot.
    ///
    /// Third-party halves missing from the snapshot are marked inactive and
    /// estimates older than `liquidity_reset_secs` fall back to 50/50. Own
    /// halves take their state from the peer records instead.
    pub fn apply_gossip(
        &mut self,
        gossip: Vec<GossipChannel>,
        nodes: Vec<GossipNode>,
        now: i64,
        liquidity_reset_secs: u64,
    ) {
        let mut seen = HashSet::with_capacity(gossip.len());
        for g in &gossip {
            let id = ChannelId::new(&g.short_channel_id, direction_of(&g.source, &g.destination));
            seen.insert(id.clone());
            match self.channels.get_mut(&id) {
                Some(ch) => ch.update_from_gossip(g),
                None => self.insert_half(Channel::from_gossip(g, now)),
            }
        }

        for n in nodes {
            self.ensure_node(&n.nodeid);
            if let (Some(node), Some(alias)) = (self.nodes.get_mut(&n.nodeid), n.alias) {
                node.alias = alias;
            }
        }

        let peers = &self.peers;
        for (id, ch) in self.channels.iter_mut() {
            if peers.contains_key(&id.scid) {
                continue;
            }
            if !seen.contains(id) {
                ch.active = false;
                continue;
            }
            let age = now.saturating_sub(ch.liquidity_updated_at).max(0) as u64;
            if age >= liquidity_reset_secs {
                ch.set_liquidity(ch.capacity_msat / 2, now);
            }
        }

        self.sync_own_halves(now);
        self.recompute_connectivity();
    }

    /// Replace the own-channel records and derive the own halves from them.
    pub fn apply_peer_channels(&mut self, peers: Vec<PeerChannel>, now: i64) {
        self.peers = peers
            .into_iter()
            .filter_map(|p| p.short_channel_id.clone().map(|scid| (scid, p)))
            .collect();

        let missing: Vec<Channel> = self
            .peers
            .iter()
            .flat_map(|(scid, p)| {
                let updates = p.updates.as_ref();
                let out = Channel::from_peer_update(
                    scid,
                    &self.self_id,
                    &p.peer_id,
                    p.total_msat,
                    updates.and_then(|u| u.local.as_ref()),
                    now,
                );
                let inn = Channel::from_peer_update(
                    scid,
                    &p.peer_id,
                    &self.self_id,
                    p.total_msat,
                    updates.and_then(|u| u.remote.as_ref()),
                    now,
                );
                [out, inn]
            })
            .filter(|ch| !self.channels.contains_key(&ch.id))
            .collect();
        for ch in missing {
            debug!("Graph: adding unannounced own half {}", ch.id);
            self.insert_half(ch);
        }

        self.sync_own_halves(now);
        self.recompute_connectivity();
    }

    fn sync_own_halves(&mut self, now: i64) {
        for (scid, p) in &self.peers {
            let usable = p.peer_connected && p.is_normal();
            let out_id = ChannelId::new(scid, direction_of(&self.self_id, &p.peer_id));
            if let Some(out) = self.channels.get_mut(&out_id) {
                out.active = usable;
                out.set_liquidity(p.spendable_msat, now);
            }
            if let Some(inn) = self.channels.get_mut(&out_id.opposite()) {
                inn.active = usable;
                inn.set_liquidity(p.receivable_msat, now);
            }
        }
    }

    fn recompute_connectivity(&mut self) {
        let mut reachable: HashSet<&str> = HashSet::new();
        for ch in self.channels.values().filter(|c| c.active) {
            reachable.insert(ch.source.as_str());
            reachable.insert(ch.destination.as_str());
        }
        let mut peer_connected: HashMap<&str, bool> = HashMap::new();
        for p in self.peers.values() {
            *peer_connected.entry(p.peer_id.as_str()).or_default() |= p.peer_connected;
        }

        let reachable: HashSet<String> = reachable.into_iter().map(str::to_string).collect();
        let peer_connected: HashMap<String, bool> = peer_connected
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        for node in self.nodes.values_mut() {
            node.connected = if node.id == self.self_id {
                true
            } else if let Some(connected) = peer_connected.get(&node.id) {
                *connected
            } else {
                reachable.contains(&node.id)
            };
        }
    }

    /// Move `amount_msat` from the first hop's channel to the last hop's.
    pub fn apply_payment_result(&mut self, route: &Route, amount_msat: u64, now: i64) {
        if let Some(out) = route.out_scid().and_then(|s| self.peers.get_mut(s)) {
            out.to_us_msat = out.to_us_msat.saturating_sub(amount_msat);
            out.spendable_msat = out.spendable_msat.saturating_sub(amount_msat);
            out.receivable_msat = out.receivable_msat.saturating_add(amount_msat);
        }
        if let Some(inn) = route.in_scid().and_then(|s| self.peers.get_mut(s)) {
            inn.to_us_msat = inn.to_us_msat.saturating_add(amount_msat);
            inn.spendable_msat = inn.spendable_msat.saturating_add(amount_msat);
            inn.receivable_msat = inn.receivable_msat.saturating_sub(amount_msat);
        }
        self.sync_own_halves(now);
    }

    /// Lower the estimate of a third-party half that refused `amount_msat`.
    /// Returns whether anything was learned.
    pub fn apply_payment_failure(
        &mut self,
        scid: &str,
        direction: u8,
        amount_msat: u64,
        now: i64,
    ) -> bool {
        if self.peers.contains_key(scid) {
            return false;
        }
        let id = ChannelId::new(scid, direction);
        let capacity = match self.channels.get_mut(&id) {
            Some(ch) => {
                let liquidity = amount_msat - amount_msat.min(FAILURE_LIQUIDITY_MARGIN_MSAT);
                ch.set_liquidity(liquidity.min(ch.capacity_msat), now);
                ch.capacity_msat
            }
            None => return false,
        };
        let learned = self.channels.get(&id).map(|c| c.liquidity_msat).unwrap_or(0);
        if let Some(opposite) = self.channels.get_mut(&id.opposite()) {
            opposite.set_liquidity(capacity - learned, now);
        }
        debug!(
            "Graph: learned {} can carry at most {} msat",
            id, learned
        );
        true
    }
}

/// Handle to the single graph, shared by the scheduler, the executor and
/// the stats view.
#[derive(Clone)]
pub struct SharedGraph {
    inner: Arc<RwLock<ChannelGraph>>,
    liquidity_reset_secs: u64,
}

impl SharedGraph {
    pub fn new(graph: ChannelGraph, liquidity_reset_secs: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(graph)),
            liquidity_reset_secs,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ChannelGraph> {
        self.inner.read().await
    }

    /// Fetch gossip and peer state, then apply both under one write lock.
    pub async fn refresh_full(&self, client: &impl NodeClient) -> RebalanceResult<GraphStats> {
        let gossip = client
            .list_channels()
            .await
            .map_err(RebalanceError::refresh)?;
        let nodes = client.list_nodes().await.map_err(RebalanceError::refresh)?;
        let peers = client
            .list_peer_channels()
            .await
            .map_err(RebalanceError::refresh)?;
        let now = chrono::Utc::now().timestamp();

        let mut graph = self.inner.write().await;
        graph.apply_peer_channels(peers, now);
        graph.apply_gossip(gossip, nodes, now, self.liquidity_reset_secs);
        let stats = graph.stats();
        debug!(
            "Graph: full refresh applied ({} nodes, {} channels, {} active)",
            stats.nodes, stats.channels, stats.active_channels
        );
        Ok(stats)
    }

    pub async fn refresh_peer_liquidity(&self, client: &impl NodeClient) -> RebalanceResult<()> {
        let peers = client
            .list_peer_channels()
            .await
            .map_err(RebalanceError::refresh)?;
        let count = peers.len();
        let now = chrono::Utc::now().timestamp();

        self.inner.write().await.apply_peer_channels(peers, now);
        debug!("Graph: peer refresh applied ({} own channels)", count);
        Ok(())
    }

    pub async fn apply_payment_result(&self, route: &Route, amount_msat: u64, fee_msat: u64) {
        let now = chrono::Utc::now().timestamp();
        self.inner
            .write()
            .await
            .apply_payment_result(route, amount_msat, now);
        debug!(
            "Graph: moved {} msat from {} to {} (fee {} msat)",
            amount_msat,
            route.out_scid().unwrap_or("?"),
            route.in_scid().unwrap_or("?"),
            fee_msat
        );
    }

    pub async fn apply_payment_failure(&self, scid: &str, direction: u8, amount_msat: u64) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.inner
            .write()
            .await
            .apply_payment_failure(scid, direction, amount_msat, now)
    }

    pub async fn stats(&self) -> GraphStats {
        self.inner.read().await.stats()
    }
}
