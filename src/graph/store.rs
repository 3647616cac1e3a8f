use rusqlite::params;

use super::{Channel, ChannelGraph, ChannelId};
use crate::db::Database;

/// Replace the stored snapshot with `graph`. Returns the halves written.
pub fn save(db: &Database, graph: &ChannelGraph) -> anyhow::Result<usize> {
    let tx = db.conn().unchecked_transaction()?;
    tx.execute("DELETE FROM graph_channels", [])?;
    tx.execute("DELETE FROM graph_nodes", [])?;

    let mut written = 0;
    {
        let mut insert = tx.prepare(
            "INSERT INTO graph_channels \
             (scid, direction, source, destination, capacity_msat, base_fee_msat, fee_ppm, \
              delay, htlc_minimum_msat, htlc_maximum_msat, active, liquidity_msat, \
              liquidity_updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for ch in graph.channels() {
            insert.execute(params![
                ch.id.scid,
                ch.id.direction,
                ch.source,
                ch.destination,
                ch.capacity_msat as i64,
                ch.base_fee_msat as i64,
                ch.fee_ppm as i64,
                ch.delay,
                ch.htlc_minimum_msat as i64,
                ch.htlc_maximum_msat as i64,
                ch.active,
                ch.liquidity_msat as i64,
                ch.liquidity_updated_at,
            ])?;
            written += 1;
        }

        let mut insert = tx.prepare("INSERT INTO graph_nodes (id, alias) VALUES (?1, ?2)")?;
        for node in graph.nodes() {
            insert.execute(params![node.id, node.alias])?;
        }
    }
    tx.commit()?;
    Ok(written)
}

/// Seed `graph` with the stored snapshot. Returns the halves loaded.
pub fn load(db: &Database, graph: &mut ChannelGraph) -> anyhow::Result<usize> {
    let conn = db.conn();

    let mut stmt = conn.prepare("SELECT id, alias FROM graph_nodes")?;
    let nodes = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT scid, direction, source, destination, capacity_msat, base_fee_msat, fee_ppm, \
         delay, htlc_minimum_msat, htlc_maximum_msat, active, liquidity_msat, \
         liquidity_updated_at \
         FROM graph_channels",
    )?;
    let halves = stmt
        .query_map([], |row| {
            let scid: String = row.get(0)?;
            Ok(Channel {
                id: ChannelId::new(&scid, row.get(1)?),
                source: row.get(2)?,
                destination: row.get(3)?,
                capacity_msat: row.get::<_, i64>(4)? as u64,
                base_fee_msat: row.get::<_, i64>(5)? as u64,
                fee_ppm: row.get::<_, i64>(6)? as u64,
                delay: row.get(7)?,
                htlc_minimum_msat: row.get::<_, i64>(8)? as u64,
                htlc_maximum_msat: row.get::<_, i64>(9)? as u64,
                active: row.get(10)?,
                liquidity_msat: row.get::<_, i64>(11)? as u64,
                liquidity_updated_at: row.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let count = halves.len();
    graph.restore(halves, nodes);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{node_id, MockNode};

    fn ring_graph(node: &MockNode) -> ChannelGraph {
        let mut graph = ChannelGraph::new(&node.info.id);
        graph.apply_peer_channels(node.peer_channels.lock().unwrap().clone(), 100);
        graph.apply_gossip(
            node.channels.lock().unwrap().clone(),
            node.nodes.lock().unwrap().clone(),
            100,
            18_000,
        );
        graph
    }

    #[test]
    fn test_learned_estimate_survives_reload() {
        let node = MockNode::ring();
        let db = Database::open_in_memory().unwrap();
        let mut graph = ring_graph(&node);
        graph.apply_payment_failure("102x1x0", 0, 25_001_250, 150);
        assert_eq!(save(&db, &graph).unwrap(), 6);

        let mut restored = ChannelGraph::new(&node.info.id);
        assert_eq!(load(&db, &mut restored).unwrap(), 6);
        let half = restored.channel(&ChannelId::new("102x1x0", 0)).unwrap();
        assert_eq!(half.liquidity_msat, 24_001_250);
        assert_eq!(half.liquidity_updated_at, 150);
        assert_eq!(restored.node(&node_id('c')).unwrap().alias, "carol");
        assert_eq!(restored.incoming(&node_id('c')).count(), 2);

        // Gossip within the reset interval keeps the restored estimate
        restored.apply_peer_channels(node.peer_channels.lock().unwrap().clone(), 200);
        restored.apply_gossip(node.channels.lock().unwrap().clone(), Vec::new(), 200, 18_000);
        let half = restored.channel(&ChannelId::new("102x1x0", 0)).unwrap();
        assert_eq!(half.liquidity_msat, 24_001_250);
        assert_eq!(restored.stats(), graph.stats());
    }

    #[test]
    fn test_stale_restored_estimate_resets_on_refresh() {
        let node = MockNode::ring();
        let db = Database::open_in_memory().unwrap();
        let mut graph = ring_graph(&node);
        graph.apply_payment_failure("102x1x0", 0, 25_001_250, 100);
        save(&db, &graph).unwrap();

        let mut restored = ChannelGraph::new(&node.info.id);
        load(&db, &mut restored).unwrap();
        restored.apply_gossip(
            node.channels.lock().unwrap().clone(),
            Vec::new(),
            100 + 18_000,
            18_000,
        );
        let half = restored.channel(&ChannelId::new("102x1x0", 0)).unwrap();
        assert_eq!(half.liquidity_msat, 500_000_000);
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let node = MockNode::ring();
        let db = Database::open_in_memory().unwrap();
        save(&db, &ring_graph(&node)).unwrap();
        assert_eq!(save(&db, &ChannelGraph::new(&node.info.id)).unwrap(), 0);

        let mut restored = ChannelGraph::new(&node.info.id);
        assert_eq!(load(&db, &mut restored).unwrap(), 0);
        assert_eq!(restored.stats().nodes, 0);
    }
}
