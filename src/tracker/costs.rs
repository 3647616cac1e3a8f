use serde::Serialize;

use crate::db::Database;
use crate::graph::Route;

/// Day bucket: start-of-day Unix timestamp for a given time.
fn day_bucket(timestamp_secs: i64) -> i64 {
    timestamp_secs - timestamp_secs.rem_euclid(86400)
}

/// Record a successful chunk: the amount leaves the first hop's channel and
/// arrives on the last hop's, which is charged the fee.
pub fn record(db: &Database, route: &Route, fee_msat: u64, now: i64) -> anyhow::Result<()> {
    let (first, last) = match (route.hops.first(), route.hops.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return Ok(()),
    };
    let bucket = day_bucket(now);
    let amount = route.amount_msat as i64;
    let conn = db.conn();

    let sides = [
        (&first.channel.scid, &first.destination, 0i64, "out"),
        (&last.channel.scid, &last.source, fee_msat as i64, "in"),
    ];
    for (scid, peer, fee, direction) in sides {
        conn.execute(
            "INSERT INTO rebalance_costs \
             (channel_id, counterparty_node_id, day_bucket, fee_spent_msat, \
              amount_rebalanced_msat, direction) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(channel_id, day_bucket, direction) DO UPDATE SET \
             fee_spent_msat = fee_spent_msat + ?4, \
             amount_rebalanced_msat = amount_rebalanced_msat + ?5",
            rusqlite::params![scid, peer, bucket, fee, amount, direction],
        )?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCosts {
    pub fee_spent_msat: i64,
    pub amount_in_msat: i64,
    pub amount_out_msat: i64,
}

/// Rebalance totals for a channel since a given timestamp.
pub fn channel_costs_since(
    db: &Database,
    channel_id: &str,
    since_timestamp: i64,
) -> anyhow::Result<ChannelCosts> {
    let bucket = day_bucket(since_timestamp);
    let mut stmt = db.conn().prepare(
        "SELECT direction, COALESCE(SUM(fee_spent_msat), 0), \
         COALESCE(SUM(amount_rebalanced_msat), 0) \
         FROM rebalance_costs WHERE channel_id = ?1 AND day_bucket >= ?2 \
         GROUP BY direction",
    )?;
    let rows = stmt.query_map(rusqlite::params![channel_id, bucket], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut costs = ChannelCosts::default();
    for row in rows {
        let (direction, fee, amount) = row?;
        costs.fee_spent_msat += fee;
        if direction == "in" {
            costs.amount_in_msat += amount;
        } else {
            costs.amount_out_msat += amount;
        }
    }
    Ok(costs)
}

pub fn clear(db: &Database) -> anyhow::Result<usize> {
    Ok(db.conn().execute("DELETE FROM rebalance_costs", [])?)
}
