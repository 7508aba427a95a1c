// =============================================================================
// Durable store schema — four tables, seven indexes
//
// Column names are stable for external query compatibility and intentionally
// match the trading-core persistence contract rather than this crate's own
// Rust field names. A few columns (`trades.slippage_pct`,
// `trades.execution_latency_ms`, `regime_snapshots.trend_state`,
// `regime_snapshots.vol_state`, `regime_snapshots.market_structure_score`,
// `regime_snapshots.model_recommendation`) are nullable because nothing
// upstream of the store currently measures or carries that data — see
// DESIGN.md for the open-question decision.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 2;

const CREATE_TRADES: &str = "
CREATE TABLE IF NOT EXISTS trades (
    trade_id INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    entry_price REAL NOT NULL,
    stop_price REAL NOT NULL,
    tp_price REAL NOT NULL,
    fill_price REAL NOT NULL,
    slippage_pct REAL,
    execution_latency_ms REAL,
    regime_state TEXT NOT NULL,
    phase INTEGER NOT NULL,
    timestamp TEXT NOT NULL
)";

const CREATE_POSITIONS: &str = "
CREATE TABLE IF NOT EXISTS positions (
    position_id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL UNIQUE,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    avg_entry REAL NOT NULL,
    current_stop REAL NOT NULL,
    current_tp REAL NOT NULL,
    unrealized_pnl REAL NOT NULL,
    regime_at_entry TEXT NOT NULL,
    phase_at_entry INTEGER NOT NULL,
    opened_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    closed_at TEXT,
    close_price REAL,
    realized_pnl REAL,
    close_reason TEXT
)";

const CREATE_REGIME_SNAPSHOTS: &str = "
CREATE TABLE IF NOT EXISTS regime_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    symbol TEXT NOT NULL,
    regime_state TEXT NOT NULL,
    trend_state TEXT,
    vol_state TEXT,
    market_structure_score REAL,
    model_recommendation TEXT
)";

const CREATE_SYSTEM_EVENTS: &str = "
CREATE TABLE IF NOT EXISTS system_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    context_json TEXT NOT NULL,
    timestamp TEXT NOT NULL
)";

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
    "CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol)",
    "CREATE INDEX IF NOT EXISTS idx_positions_opened_at ON positions(opened_at)",
    "CREATE INDEX IF NOT EXISTS idx_positions_closed_at ON positions(closed_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON system_events(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_events_event_type ON system_events(event_type)",
];

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TRADES).context("create trades table")?;
    conn.execute_batch(CREATE_POSITIONS).context("create positions table")?;
    conn.execute_batch(CREATE_REGIME_SNAPSHOTS)
        .context("create regime_snapshots table")?;
    conn.execute_batch(CREATE_SYSTEM_EVENTS)
        .context("create system_events table")?;
    for stmt in INDEXES {
        conn.execute_batch(stmt).context("create index")?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("set schema version")?;
    Ok(())
}

/// Verify the schema version and that every expected table is present.
/// Used after restoring a backup to catch a corrupt or foreign file
/// before the engine starts writing to it.
pub fn verify_schema(conn: &Connection) -> Result<()> {
    let expected = ["trades", "positions", "regime_snapshots", "system_events"];
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")
        .context("prepare schema check")?;
    for table in expected {
        let exists: bool = stmt.exists([table]).context("check table existence")?;
        if !exists {
            anyhow::bail!("schema verification failed: missing table '{table}'");
        }
    }
    Ok(())
}
