//! Route search for rebalances. Every function here is pure over a graph
//! snapshot; the caller holds the read lock for the duration of a lookup.

use log::debug;

use crate::error::{RebalanceError, RebalanceResult};
use crate::graph::pathfinder::find_path;
use crate::graph::{Channel, ChannelGraph, Route};

/// A routable exit (pull) or entry (push) for a rebalance.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub scid: String,
    /// Our own outgoing fee rate on the candidate channel, for the chunk.
    pub channel_ppm: u64,
    pub route: Route,
}

/// Exit filter for `circular-pull`.
#[derive(Debug, Clone)]
pub struct PullFilter<'a> {
    pub max_out_ppm: u64,
    pub out_list: Option<&'a [String]>,
    pub deplete_percent: u64,
    pub deplete_amount_msat: u64,
}

/// Entry filter for `circular-push`.
#[derive(Debug, Clone)]
pub struct PushFilter<'a> {
    pub min_out_ppm: u64,
    pub in_list: Option<&'a [String]>,
    pub fill_percent: u64,
    pub fill_amount_msat: u64,
}

fn channel_ppm(half: &Channel, amount_msat: u64) -> u64 {
    if amount_msat == 0 {
        return 0;
    }
    (half.fee_for(amount_msat) as u128 * 1_000_000 / amount_msat as u128) as u64
}

fn percent_of(total_msat: u64, percent: u64) -> u64 {
    (total_msat as u128 * percent as u128 / 100) as u64
}

fn own_out_half<'a>(graph: &'a ChannelGraph, scid: &str) -> RebalanceResult<&'a Channel> {
    if !graph.is_own(scid) {
        return Err(RebalanceError::InvalidRequest(format!(
            "{} is not one of our channels",
            scid
        )));
    }
    graph.out_half(scid).ok_or_else(|| {
        RebalanceError::InvalidRequest(format!("no outgoing half known for {}", scid))
    })
}

fn own_in_half<'a>(graph: &'a ChannelGraph, scid: &str) -> RebalanceResult<&'a Channel> {
    if !graph.is_own(scid) {
        return Err(RebalanceError::InvalidRequest(format!(
            "{} is not one of our channels",
            scid
        )));
    }
    graph.in_half(scid).ok_or_else(|| {
        RebalanceError::InvalidRequest(format!("no incoming half known for {}", scid))
    })
}

/// Cheapest route leaving through `out_scid` and returning through `in_scid`.
pub fn circular_route(
    graph: &ChannelGraph,
    out_scid: &str,
    in_scid: &str,
    amount_msat: u64,
    max_hops: usize,
) -> RebalanceResult<Route> {
    if out_scid == in_scid {
        return Err(RebalanceError::InvalidRequest(
            "outscid and inscid must differ".to_string(),
        ));
    }
    let out = own_out_half(graph, out_scid)?;
    let inn = own_in_half(graph, in_scid)?;

    if !out.active {
        return Err(RebalanceError::ChannelInactive(out_scid.to_string()));
    }
    if !inn.active {
        return Err(RebalanceError::ChannelInactive(in_scid.to_string()));
    }
    if !out.can_carry(amount_msat) {
        return Err(RebalanceError::NoRouteFound(format!(
            "outgoing channel {} cannot send {} msat (spendable {}, max_htlc {})",
            out_scid, amount_msat, out.liquidity_msat, out.htlc_maximum_msat
        )));
    }
    if !inn.can_carry(amount_msat) {
        return Err(RebalanceError::NoRouteFound(format!(
            "incoming channel {} cannot receive {} msat (receivable {}, max_htlc {})",
            in_scid, amount_msat, inn.liquidity_msat, inn.htlc_maximum_msat
        )));
    }

    let max_edges = max_hops.saturating_sub(2);
    let at_in_peer = amount_msat.saturating_add(inn.fee_for(amount_msat));
    let path = find_path(
        graph,
        out.destination.as_str(),
        inn.source.as_str(),
        at_in_peer,
        max_edges,
    )
    .ok_or_else(|| {
        RebalanceError::NoRouteFound(format!(
            "no path of at most {} hops from {} back through {}",
            max_hops, out_scid, in_scid
        ))
    })?;

    let mut halves = Vec::with_capacity(path.len() + 2);
    halves.push(out);
    halves.extend(path);
    halves.push(inn);
    let route = Route::build(&halves, amount_msat);

    let first_hop = route.hops.first().map(|h| h.amount_msat).unwrap_or(amount_msat);
    if !out.can_carry(first_hop) {
        return Err(RebalanceError::NoRouteFound(format!(
            "outgoing channel {} cannot cover {} msat including fees",
            out_scid, first_hop
        )));
    }
    Ok(route)
}

fn in_list(list: Option<&[String]>, scid: &str) -> bool {
    list.map_or(true, |l| l.iter().any(|s| s == scid))
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        (a.route.fee_msat(), a.channel_ppm, a.route.hops.len()).cmp(&(
            b.route.fee_msat(),
            b.channel_ppm,
            b.route.hops.len(),
        ))
    });
}

/// Routes into `in_scid` from every eligible exit, cheapest first.
pub fn pull_candidates(
    graph: &ChannelGraph,
    in_scid: &str,
    amount_msat: u64,
    max_hops: usize,
    filter: &PullFilter<'_>,
) -> RebalanceResult<Vec<Candidate>> {
    let inn = own_in_half(graph, in_scid)?;
    if !inn.active {
        return Err(RebalanceError::ChannelInactive(in_scid.to_string()));
    }

    let mut candidates = Vec::new();
    for peer in graph.peer_channels() {
        let scid = match peer.short_channel_id.as_deref() {
            Some(s) if s != in_scid => s,
            _ => continue,
        };
        if !in_list(filter.out_list, scid) {
            continue;
        }
        let out = match graph.out_half(scid) {
            Some(h) if h.active => h,
            _ => continue,
        };
        let ppm = channel_ppm(out, amount_msat);
        if filter.out_list.is_none() && ppm > filter.max_out_ppm {
            debug!("Rebalance: exit {} charges {} ppm, skipping", scid, ppm);
            continue;
        }
        let floor = filter
            .deplete_amount_msat
            .min(percent_of(peer.total_msat, filter.deplete_percent));
        if peer.to_us_msat < amount_msat || peer.to_us_msat - amount_msat < floor {
            debug!("Rebalance: exit {} would deplete below {} msat", scid, floor);
            continue;
        }
        match circular_route(graph, scid, in_scid, amount_msat, max_hops) {
            Ok(route) => candidates.push(Candidate {
                scid: scid.to_string(),
                channel_ppm: ppm,
                route,
            }),
            Err(e) => debug!("Rebalance: exit {} unusable: {}", scid, e),
        }
    }

    if candidates.is_empty() {
        return Err(RebalanceError::NoRouteFound(format!(
            "no exit channel can route {} msat into {}",
            amount_msat, in_scid
        )));
    }
    sort_candidates(&mut candidates);
    Ok(candidates)
}

/// Routes out of `out_scid` into every eligible entry, cheapest first.
pub fn push_candidates(
    graph: &ChannelGraph,
    out_scid: &str,
    amount_msat: u64,
    max_hops: usize,
    filter: &PushFilter<'_>,
) -> RebalanceResult<Vec<Candidate>> {
    let out = own_out_half(graph, out_scid)?;
    if !out.active {
        return Err(RebalanceError::ChannelInactive(out_scid.to_string()));
    }

    let mut candidates = Vec::new();
    for peer in graph.peer_channels() {
        let scid = match peer.short_channel_id.as_deref() {
            Some(s) if s != out_scid => s,
            _ => continue,
        };
        if !in_list(filter.in_list, scid) {
            continue;
        }
        let entry_active = graph.in_half(scid).map_or(false, |h| h.active);
        let ppm = match graph.out_half(scid) {
            Some(h) if entry_active => channel_ppm(h, amount_msat),
            _ => continue,
        };
        if filter.in_list.is_none() && ppm < filter.min_out_ppm {
            debug!("Rebalance: entry {} charges only {} ppm, skipping", scid, ppm);
            continue;
        }
        let ceiling = filter
            .fill_amount_msat
            .min(percent_of(peer.total_msat, filter.fill_percent));
        if peer.to_us_msat.saturating_add(amount_msat) > ceiling {
            debug!("Rebalance: entry {} would fill above {} msat", scid, ceiling);
            continue;
        }
        match circular_route(graph, out_scid, scid, amount_msat, max_hops) {
            Ok(route) => candidates.push(Candidate {
                scid: scid.to_string(),
                channel_ppm: ppm,
                route,
            }),
            Err(e) => debug!("Rebalance: entry {} unusable: {}", scid, e),
        }
    }

    if candidates.is_empty() {
        return Err(RebalanceError::NoRouteFound(format!(
            "no entry channel can take {} msat from {}",
            amount_msat, out_scid
        )));
    }
    sort_candidates(&mut candidates);
    Ok(candidates)
}

/// Resolve a peer given by id or alias.
fn resolve_peer<'a>(graph: &'a ChannelGraph, who: &str) -> RebalanceResult<&'a str> {
    if let Some(node) = graph.node(who) {
        return Ok(node.id.as_str());
    }
    let mut matches = graph.nodes().filter(|n| !n.alias.is_empty() && n.alias == who);
    match (matches.next(), matches.next()) {
        (Some(node), None) => Ok(node.id.as_str()),
        (Some(_), Some(_)) => Err(RebalanceError::InvalidRequest(format!(
            "alias {} is ambiguous",
            who
        ))),
        (None, _) => Err(RebalanceError::InvalidRequest(format!("unknown node {}", who))),
    }
}

/// Pick the channel with the most spendable balance towards `out_node` and
/// the one with the most receivable balance from `in_node`.
pub fn resolve_node_channels(
    graph: &ChannelGraph,
    out_node: &str,
    in_node: &str,
) -> RebalanceResult<(String, String)> {
    let out_id = resolve_peer(graph, out_node)?;
    let in_id = resolve_peer(graph, in_node)?;

    let usable = |peer_id: &str| {
        graph
            .peer_channels()
            .filter(move |p| p.peer_id == peer_id && p.peer_connected && p.is_normal())
            .filter_map(|p| p.short_channel_id.as_deref().map(|s| (s, p)))
            .collect::<Vec<_>>()
    };

    let out_scid = usable(out_id)
        .into_iter()
        .max_by_key(|(scid, p)| (p.spendable_msat, std::cmp::Reverse(*scid)))
        .map(|(scid, _)| scid.to_string())
        .ok_or_else(|| {
            RebalanceError::InvalidRequest(format!("no usable channel with {}", out_node))
        })?;
    let in_scid = usable(in_id)
        .into_iter()
        .filter(|(scid, _)| *scid != out_scid)
        .max_by_key(|(scid, p)| (p.receivable_msat, std::cmp::Reverse(*scid)))
        .map(|(scid, _)| scid.to_string())
        .ok_or_else(|| {
            RebalanceError::InvalidRequest(format!("no usable channel with {}", in_node))
        })?;

    Ok((out_scid, in_scid))
}
