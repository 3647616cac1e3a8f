use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to apply database schema")?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
-- One row per rebalance chunk
CREATE TABLE IF NOT EXISTS rebalance_attempts (
    id TEXT NOT NULL PRIMARY KEY,
    request_id TEXT NOT NULL,
    mode TEXT NOT NULL CHECK (mode IN ('circular', 'pull', 'push')),
    amount_msat INTEGER NOT NULL,
    out_scid TEXT,
    in_scid TEXT,
    route TEXT NOT NULL DEFAULT '',
    fee_msat INTEGER NOT NULL DEFAULT 0,
    tries INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL,
    error_kind TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_created
    ON rebalance_attempts(created_at);

-- Per-day totals for successful chunks, two rows per chunk: direction
-- 'out' on the own channel the chunk left through (fee 0), 'in' on the own
-- channel it came back through, which carries the whole route fee.
CREATE TABLE IF NOT EXISTS rebalance_costs (
    channel_id TEXT NOT NULL,
    counterparty_node_id TEXT NOT NULL,
    day_bucket INTEGER NOT NULL,
    fee_spent_msat INTEGER NOT NULL DEFAULT 0,
    amount_rebalanced_msat INTEGER NOT NULL DEFAULT 0,
    direction TEXT NOT NULL CHECK (direction IN ('in', 'out')),
    PRIMARY KEY (channel_id, day_bucket, direction)
);

-- Graph snapshot, replaced on every save and reloaded at startup so
-- learned liquidity survives a restart
CREATE TABLE IF NOT EXISTS graph_channels (
    scid TEXT NOT NULL,
    direction INTEGER NOT NULL CHECK (direction IN (0, 1)),
    source TEXT NOT NULL,
    destination TEXT NOT NULL,
    capacity_msat INTEGER NOT NULL,
    base_fee_msat INTEGER NOT NULL,
    fee_ppm INTEGER NOT NULL,
    delay INTEGER NOT NULL,
    htlc_minimum_msat INTEGER NOT NULL,
    htlc_maximum_msat INTEGER NOT NULL,
    active INTEGER NOT NULL,
    liquidity_msat INTEGER NOT NULL,
    liquidity_updated_at INTEGER NOT NULL,
    PRIMARY KEY (scid, direction)
);
CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT NOT NULL PRIMARY KEY,
    alias TEXT NOT NULL DEFAULT ''
);
"#;
