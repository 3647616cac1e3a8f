pub mod costs;
pub mod ledger;

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;

use crate::db::Database;
use crate::graph::{GraphStats, Route};
use crate::rebalance::request::Mode;
use crate::rebalance::result::{describe_route, parse_route, AttemptError, RebalanceAttempt};
use costs::ChannelCosts;
use ledger::PaymentLedger;

const SECS_PER_DAY: i64 = 86400;

/// Read-only view served by `circular-stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub graph_stats: GraphStats,
    pub successes: Vec<RebalanceAttempt>,
    pub failures: Vec<RebalanceAttempt>,
    /// Own channels that moved funds within the retention window.
    pub channel_costs: BTreeMap<String, ChannelCosts>,
}

/// Row counts removed by `circular-delete-stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletedStats {
    pub successes: usize,
    pub failures: usize,
    pub costs: usize,
}

/// Bounded attempt history, mirrored into SQLite, plus the payment ledger.
pub struct StatsTracker {
    attempts: Mutex<VecDeque<RebalanceAttempt>>,
    db: Mutex<Database>,
    ledger: PaymentLedger,
    capacity: usize,
    retention_secs: i64,
}

impl StatsTracker {
    /// Open the tracker over `db`, reloading the persisted history that is
    /// still within retention.
    pub fn new(db: Database, capacity: usize, retention_days: u64) -> anyhow::Result<Self> {
        let capacity = capacity.max(1);
        let retention_secs = (retention_days as i64).saturating_mul(SECS_PER_DAY);
        let now = chrono::Utc::now().timestamp();

        prune(&db, capacity, now - retention_secs)?;
        let loaded = load(&db, capacity)?;
        if !loaded.is_empty() {
            info!("Stats: reloaded {} rebalance attempts", loaded.len());
        }

        Ok(Self {
            attempts: Mutex::new(loaded.into()),
            db: Mutex::new(db),
            ledger: PaymentLedger::new(capacity),
            capacity,
            retention_secs,
        })
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    /// The store shared with the graph snapshot.
    pub fn database(&self) -> &Mutex<Database> {
        &self.db
    }

    /// Append an attempt to the ring and the database. Persistence failures
    /// are logged; the in-memory view stays authoritative for this process.
    pub async fn record(&self, attempt: RebalanceAttempt) {
        {
            let db = self.db.lock().await;
            let cutoff = attempt.created_at - self.retention_secs;
            if let Err(e) = insert(&db, &attempt).and_then(|_| prune(&db, self.capacity, cutoff)) {
                warn!("Stats: failed to persist attempt {}: {:#}", attempt.id, e);
            }
        }

        let mut attempts = self.attempts.lock().await;
        attempts.push_back(attempt);
        while attempts.len() > self.capacity {
            attempts.pop_front();
        }
    }

    /// Book the cost of a successful chunk.
    pub async fn record_cost(&self, route: &Route, fee_msat: u64) {
        let db = self.db.lock().await;
        if let Err(e) = costs::record(&db, route, fee_msat, chrono::Utc::now().timestamp()) {
            warn!("Stats: failed to record rebalance cost: {:#}", e);
        }
    }

    pub async fn successes(&self) -> Vec<RebalanceAttempt> {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|a| a.success)
            .cloned()
            .collect()
    }

    pub async fn failures(&self) -> Vec<RebalanceAttempt> {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|a| !a.success)
            .cloned()
            .collect()
    }

    /// Rebalance totals for each of `scids` within retention. Channels that
    /// moved nothing are left out.
    pub async fn channel_costs(&self, scids: &[String]) -> BTreeMap<String, ChannelCosts> {
        let since = chrono::Utc::now().timestamp() - self.retention_secs;
        let db = self.db.lock().await;
        let mut totals = BTreeMap::new();
        for scid in scids {
            match costs::channel_costs_since(&db, scid, since) {
                Ok(c) if c != ChannelCosts::default() => {
                    totals.insert(scid.clone(), c);
                }
                Ok(_) => {}
                Err(e) => warn!("Stats: failed to read costs for {}: {:#}", scid, e),
            }
        }
        totals
    }

    pub async fn report(&self, graph_stats: GraphStats, own_scids: &[String]) -> StatsReport {
        StatsReport {
            graph_stats,
            successes: self.successes().await,
            failures: self.failures().await,
            channel_costs: self.channel_costs(own_scids).await,
        }
    }

    /// Drop all history, in memory and on disk.
    pub async fn delete_stats(&self) -> anyhow::Result<DeletedStats> {
        let db = self.db.lock().await;
        let tx = db.conn().unchecked_transaction()?;
        let successes = tx.execute("DELETE FROM rebalance_attempts WHERE success = 1", [])?;
        let failures = tx.execute("DELETE FROM rebalance_attempts WHERE success = 0", [])?;
        tx.commit()?;
        let costs = costs::clear(&db)?;

        self.attempts.lock().await.clear();
        debug!(
            "Stats: deleted {} successes, {} failures, {} cost rows",
            successes, failures, costs
        );
        Ok(DeletedStats {
            successes,
            failures,
            costs,
        })
    }
}

fn insert(db: &Database, attempt: &RebalanceAttempt) -> anyhow::Result<()> {
    let (error_kind, error_message) = match &attempt.error {
        Some(e) => (Some(e.kind.as_str()), Some(e.message.as_str())),
        None => (None, None),
    };
    db.conn().execute(
        "INSERT OR REPLACE INTO rebalance_attempts \
         (id, request_id, mode, amount_msat, out_scid, in_scid, route, fee_msat, \
          tries, success, error_kind, error_message, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            attempt.id,
            attempt.request_id,
            attempt.mode.as_str(),
            attempt.amount_msat as i64,
            attempt.out_scid,
            attempt.in_scid,
            describe_route(&attempt.route),
            attempt.fee_msat as i64,
            attempt.tries,
            attempt.success,
            error_kind,
            error_message,
            attempt.created_at,
        ],
    )?;
    Ok(())
}

/// Keep at most `capacity` rows, none older than `cutoff`.
fn prune(db: &Database, capacity: usize, cutoff: i64) -> anyhow::Result<()> {
    let conn = db.conn();
    conn.execute(
        "DELETE FROM rebalance_attempts WHERE created_at < ?1",
        [cutoff],
    )?;
    conn.execute(
        "DELETE FROM rebalance_attempts WHERE rowid NOT IN \
         (SELECT rowid FROM rebalance_attempts ORDER BY created_at DESC, rowid DESC LIMIT ?1)",
        [capacity as i64],
    )?;
    Ok(())
}

/// Oldest first, at most `capacity`.
fn load(db: &Database, capacity: usize) -> anyhow::Result<Vec<RebalanceAttempt>> {
    let mut stmt = db.conn().prepare(
        "SELECT id, request_id, mode, amount_msat, out_scid, in_scid, route, fee_msat, \
         tries, success, error_kind, error_message, created_at \
         FROM rebalance_attempts ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([capacity as i64], |row| {
        let mode: String = row.get(2)?;
        let route: String = row.get(6)?;
        let error_kind: Option<String> = row.get(10)?;
        let error_message: Option<String> = row.get(11)?;
        Ok(RebalanceAttempt {
            id: row.get(0)?,
            request_id: row.get(1)?,
            mode: Mode::parse(&mode).unwrap_or(Mode::Circular),
            amount_msat: row.get::<_, i64>(3)? as u64,
            out_scid: row.get(4)?,
            in_scid: row.get(5)?,
            route: parse_route(&route),
            fee_msat: row.get::<_, i64>(7)? as u64,
            tries: row.get(8)?,
            success: row.get(9)?,
            error: error_kind.map(|kind| AttemptError {
                kind,
                message: error_message.unwrap_or_default(),
            }),
            created_at: row.get(12)?,
        })
    })?;

    let mut attempts = rows.collect::<Result<Vec<_>, _>>()?;
    attempts.reverse();
    Ok(attempts)
}
