use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::channel::Channel;
use super::ChannelGraph;

/// Cheapest path of third-party halves from `from` to `to` that can deliver
/// `amount_msat` at `to`.
///
/// The search runs backwards from `to`, because the amount a half must carry
/// depends on the fees of every half after it. Priority is (cumulative fee,
/// hop count). The local node never appears on the path. Returns the halves
/// in forward order; an empty path when `from == to`.
pub fn find_path<'a>(
    graph: &'a ChannelGraph,
    from: &'a str,
    to: &'a str,
    amount_msat: u64,
    max_edges: usize,
) -> Option<Vec<&'a Channel>> {
    let self_id = graph.self_id();
    if from == self_id || to == self_id {
        return None;
    }

    let mut best: HashMap<&str, (u64, usize)> = HashMap::new();
    let mut carried: HashMap<&str, u64> = HashMap::new();
    let mut next: HashMap<&str, &Channel> = HashMap::new();
    let mut settled: HashSet<&str> = HashSet::new();
    let mut heap = BinaryHeap::new();

    best.insert(to, (0, 0));
    carried.insert(to, amount_msat);
    heap.push(Reverse((0u64, 0usize, to)));

    while let Some(Reverse((fee, hops, node))) = heap.pop() {
        if !settled.insert(node) {
            continue;
        }
        if node == from {
            return Some(unwind(from, to, &next));
        }
        if hops >= max_edges {
            continue;
        }
        let amount = match carried.get(node) {
            Some(a) => *a,
            None => continue,
        };

        for ch in graph.incoming(node) {
            let src = ch.source.as_str();
            if src == self_id || settled.contains(src) || !ch.can_carry(amount) {
                continue;
            }
            let hop_fee = ch.fee_for(amount);
            let candidate = (fee.saturating_add(hop_fee), hops + 1);
            let improves = best.get(src).map_or(true, |current| candidate < *current);
            if improves {
                best.insert(src, candidate);
                carried.insert(src, amount.saturating_add(hop_fee));
                next.insert(src, ch);
                heap.push(Reverse((candidate.0, candidate.1, src)));
            }
        }
    }

    None
}

fn unwind<'a>(from: &'a str, to: &str, next: &HashMap<&'a str, &'a Channel>) -> Vec<&'a Channel> {
    let mut path = Vec::new();
    let mut node = from;
    while node != to {
        match next.get(node) {
            Some(ch) => {
                path.push(*ch);
                node = ch.destination.as_str();
            }
            None => break,
        }
    }
    path
}
