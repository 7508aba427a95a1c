// =============================================================================
// Durable Store — SQLite persistence for trades, positions, and events
//
// Writes are fire-and-forget: a caller closing a position or publishing
// an event does not wait on the disk write, and a write failure never
// propagates back to them — it lands in the retry queue instead. Crash
// recovery reads `positions WHERE closed_at IS NULL` back into shadow
// state at startup. `backup_gz`/`restore_gz` give the admin API a single
// portable artifact for disaster recovery.
// =============================================================================

pub mod retry_queue;
pub mod schema;

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{error, info, warn};

use crate::event_bus::{Envelope, EventBus};
use crate::shadow_state::Position;
use crate::types::Side;
use retry_queue::RetryQueue;

pub struct DurableStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    retry_queue: RetryQueue,
    events: Arc<EventBus>,
}

impl DurableStore {
    pub fn open(path: impl Into<PathBuf>, events: Arc<EventBus>) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        schema::init_schema(&conn)?;
        info!(path = %path.display(), "durable store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            retry_queue: RetryQueue::new(events.clone()),
            events,
        })
    }

    pub fn open_in_memory(events: Arc<EventBus>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            retry_queue: RetryQueue::new(events.clone()),
            events,
        })
    }

    // -------------------------------------------------------------------
    // Writes — all fire-and-forget, all route failures to the retry queue
    // -------------------------------------------------------------------

    /// Records a closed trade. `trade.exit_price` is persisted as the row's
    /// `fill_price` — the closing fill is the execution this table exists
    /// to audit. `slippage_pct`/`execution_latency_ms` are left NULL: the
    /// order manager doesn't currently surface either up to the shadow
    /// state layer that builds `TradeRecord`.
    pub fn insert_trade(&self, trade: &crate::shadow_state::TradeRecord) {
        let result = self.conn.lock().execute(
            "INSERT INTO trades (signal_id, symbol, side, size, entry_price, stop_price, tp_price, fill_price, regime_state, phase, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.signal_id,
                trade.symbol,
                trade.side.to_string(),
                trade.quantity,
                trade.entry_price,
                trade.stop_price,
                trade.tp_price,
                trade.exit_price,
                trade.regime_state,
                trade.phase,
                trade.closed_at.to_rfc3339(),
            ],
        );
        self.handle_write_result(result, "insert_trade", &trade.symbol, || {
            serde_json::to_value(trade).unwrap_or_default()
        });
    }

    /// Upserts the open-position row for `position.symbol`. Only the
    /// nearest take-profit survives as `current_tp` — the positions table's
    /// column set has no room for the full ladder, matching the external
    /// schema contract rather than this crate's richer in-memory model.
    pub fn upsert_position(&self, position: &Position) {
        let current_tp = position.take_profits.first().copied().unwrap_or(0.0);
        let result = self.conn.lock().execute(
            "INSERT INTO positions (symbol, side, size, avg_entry, current_stop, current_tp, unrealized_pnl, regime_at_entry, phase_at_entry, opened_at, updated_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)
             ON CONFLICT(symbol) DO UPDATE SET
                side=excluded.side, size=excluded.size, avg_entry=excluded.avg_entry,
                current_stop=excluded.current_stop, current_tp=excluded.current_tp,
                unrealized_pnl=excluded.unrealized_pnl, updated_at=excluded.updated_at",
            params![
                position.symbol,
                position.side.to_string(),
                position.quantity,
                position.entry_price,
                position.stop_loss,
                current_tp,
                position.unrealized_pnl,
                position.regime_state,
                position.phase,
                position.opened_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        );
        self.handle_write_result(result, "upsert_position", &position.symbol, || {
            serde_json::to_value(position).unwrap_or_default()
        });
    }

    pub fn mark_position_closed(
        &self,
        symbol: &str,
        close_price: f64,
        realized_pnl: f64,
        close_reason: &str,
    ) {
        let result = self.conn.lock().execute(
            "UPDATE positions SET closed_at = ?1, close_price = ?2, realized_pnl = ?3, close_reason = ?4, updated_at = ?1 WHERE symbol = ?5",
            params![Utc::now().to_rfc3339(), close_price, realized_pnl, close_reason, symbol],
        );
        self.handle_write_result(result, "close_position", symbol, || {
            serde_json::json!({
                "symbol": symbol,
                "close_price": close_price,
                "realized_pnl": realized_pnl,
                "close_reason": close_reason,
            })
        });
    }

    /// Persists the derivatives-regime classification only — the richer
    /// trend/volatility/market-structure fields this table has room for
    /// belong to the (out-of-scope) regime-engine math library's
    /// `RegimeVector`, which this core consumes but does not archive.
    pub fn insert_regime_snapshot(
        &self,
        snapshot: &crate::safety::derivatives_regime::RegimeSnapshot,
    ) {
        let result = self.conn.lock().execute(
            "INSERT INTO regime_snapshots (timestamp, symbol, regime_state, trend_state, vol_state, market_structure_score, model_recommendation)
             VALUES (?1, ?2, ?3, NULL, NULL, NULL, NULL)",
            params![
                Utc::now().to_rfc3339(),
                snapshot.symbol,
                snapshot.class.to_string(),
            ],
        );
        self.handle_write_result(result, "insert_regime_snapshot", &snapshot.symbol, || {
            serde_json::to_value(snapshot).unwrap_or_default()
        });
    }

    pub fn insert_event(&self, envelope: &Envelope) {
        let event_type = serde_json::to_value(&envelope.event)
            .ok()
            .and_then(|v| v.get("type").cloned())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = serde_json::to_string(&envelope.event).unwrap_or_default();
        let result = self.conn.lock().execute(
            "INSERT INTO system_events (event_type, severity, description, context_json, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event_type,
                envelope.event.severity().to_string(),
                format!("{:?}", envelope.event),
                payload,
                envelope.timestamp.to_rfc3339(),
            ],
        );
        self.handle_write_result(result, "insert_event", &envelope.sequence.to_string(), || {
            serde_json::to_value(envelope).unwrap_or_default()
        });
    }

    fn handle_write_result<T, E: std::fmt::Display>(
        &self,
        result: std::result::Result<T, E>,
        operation: &str,
        name: &str,
        to_json: impl FnOnce() -> serde_json::Value,
    ) {
        if let Err(err) = result {
            warn!(operation, name, error = %err, "durable write failed, queuing for retry");
            self.retry_queue.push(operation, name, to_json());
        }
    }

    /// Replay due retry-queue items against the same SQL the original
    /// write used. Failures here call `requeue_failed` directly rather
    /// than going back through e.g. `insert_trade`, which would push a
    /// second, duplicate entry onto the queue.
    pub fn drain_retry_queue(&self) {
        for item in self.retry_queue.drain_due() {
            let result = self.replay(&item);
            if let Err(err) = result {
                error!(operation = %item.operation, name = %item.name, error = %err, "retry attempt failed");
                self.retry_queue.requeue_failed(item);
            }
        }
    }

    fn replay(&self, item: &retry_queue::RetryItem) -> Result<()> {
        match item.operation.as_str() {
            "insert_trade" => {
                let trade: crate::shadow_state::TradeRecord = serde_json::from_value(item.data.clone())
                    .context("malformed queued trade")?;
                self.conn.lock().execute(
                    "INSERT INTO trades (signal_id, symbol, side, size, entry_price, stop_price, tp_price, fill_price, regime_state, phase, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        trade.signal_id, trade.symbol, trade.side.to_string(), trade.quantity,
                        trade.entry_price, trade.stop_price, trade.tp_price, trade.exit_price,
                        trade.regime_state, trade.phase, trade.closed_at.to_rfc3339(),
                    ],
                )?;
            }
            "upsert_position" => {
                let position: Position = serde_json::from_value(item.data.clone())
                    .context("malformed queued position")?;
                let current_tp = position.take_profits.first().copied().unwrap_or(0.0);
                self.conn.lock().execute(
                    "INSERT INTO positions (symbol, side, size, avg_entry, current_stop, current_tp, unrealized_pnl, regime_at_entry, phase_at_entry, opened_at, updated_at, closed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)
                     ON CONFLICT(symbol) DO UPDATE SET
                        side=excluded.side, size=excluded.size, avg_entry=excluded.avg_entry,
                        current_stop=excluded.current_stop, current_tp=excluded.current_tp,
                        unrealized_pnl=excluded.unrealized_pnl, updated_at=excluded.updated_at",
                    params![
                        position.symbol, position.side.to_string(), position.quantity, position.entry_price,
                        position.stop_loss, current_tp, position.unrealized_pnl, position.regime_state,
                        position.phase, position.opened_at.to_rfc3339(), Utc::now().to_rfc3339(),
                    ],
                )?;
            }
            "close_position" => {
                let data = &item.data;
                let close_price = data.get("close_price").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let realized_pnl = data.get("realized_pnl").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let close_reason = data.get("close_reason").and_then(|v| v.as_str()).unwrap_or("unknown");
                self.conn.lock().execute(
                    "UPDATE positions SET closed_at = ?1, close_price = ?2, realized_pnl = ?3, close_reason = ?4, updated_at = ?1 WHERE symbol = ?5",
                    params![Utc::now().to_rfc3339(), close_price, realized_pnl, close_reason, item.name],
                )?;
            }
            "insert_regime_snapshot" => {
                let snap: crate::safety::derivatives_regime::RegimeSnapshot =
                    serde_json::from_value(item.data.clone()).context("malformed queued regime snapshot")?;
                self.conn.lock().execute(
                    "INSERT INTO regime_snapshots (timestamp, symbol, regime_state, trend_state, vol_state, market_structure_score, model_recommendation)
                     VALUES (?1, ?2, ?3, NULL, NULL, NULL, NULL)",
                    params![Utc::now().to_rfc3339(), snap.symbol, snap.class.to_string()],
                )?;
            }
            "insert_event" => {
                let envelope: Envelope = serde_json::from_value(item.data.clone())
                    .context("malformed queued event")?;
                self.insert_event(&envelope);
            }
            other => warn!(operation = other, "unknown retry-queue operation, dropping"),
        }
        Ok(())
    }

    pub fn retry_queue_depth(&self) -> usize {
        self.retry_queue.len()
    }

    // -------------------------------------------------------------------
    // Crash recovery
    // -------------------------------------------------------------------

    /// Positions with no `closed_at` survived an unclean shutdown with the
    /// broker still holding them open. Rehydrate them into shadow state
    /// before the pipeline starts accepting new signals, with a synthetic
    /// `signal_id` — the original signal that opened the position isn't
    /// part of this table's column set — and `pyramid_layers` reset to 1,
    /// since the ladder depth isn't persisted either.
    pub fn recover_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, side, size, avg_entry, current_stop, current_tp, unrealized_pnl, regime_at_entry, phase_at_entry, opened_at
             FROM positions WHERE closed_at IS NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, u8>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut recovered = Vec::new();
        for row in rows {
            let (symbol, side_str, size, avg_entry, current_stop, current_tp, unrealized_pnl, regime_at_entry, phase_at_entry, opened_at_str) =
                row?;
            let side = if side_str == "LONG" { Side::Long } else { Side::Short };
            let opened_at: DateTime<Utc> = opened_at_str.parse().unwrap_or_else(|_| Utc::now());
            let signal_id = format!("recovered_{symbol}_{}", Utc::now().timestamp());
            recovered.push(Position {
                symbol,
                side,
                entry_price: avg_entry,
                quantity: size,
                current_price: avg_entry,
                unrealized_pnl,
                unrealized_pnl_pct: 0.0,
                stop_loss: current_stop,
                take_profits: vec![current_tp],
                trailing_stop: None,
                extreme_price: avg_entry,
                pyramid_layers: 1,
                opened_at,
                realized_pnl: 0.0,
                signal_id,
                regime_state: regime_at_entry,
                phase: phase_at_entry,
            });
        }
        info!(count = recovered.len(), "recovered open positions from durable store");
        Ok(recovered)
    }

    // -------------------------------------------------------------------
    // Backup / restore
    // -------------------------------------------------------------------

    /// Snapshot the database file, gzip it, and write it to `dest`.
    pub fn backup_gz(&self, dest: impl AsRef<Path>) -> Result<()> {
        let _lock = self.conn.lock();
        if self.path.as_os_str() == ":memory:" {
            anyhow::bail!("cannot back up an in-memory store");
        }
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("failed to read database at {}", self.path.display()))?;
        let dest = dest.as_ref();
        let file = std::fs::File::create(dest)
            .with_context(|| format!("failed to create backup file at {}", dest.display()))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&raw).context("failed to write gzip backup")?;
        encoder.finish().context("failed to finalize gzip backup")?;
        info!(dest = %dest.display(), "database backed up");
        Ok(())
    }

    /// Decompress a `.db.gz` backup to a temp file, verify its schema,
    /// then atomically replace the live database.
    pub fn restore_gz(path: impl Into<PathBuf>, src: impl AsRef<Path>, events: Arc<EventBus>) -> Result<Self> {
        let path = path.into();
        let src = src.as_ref();
        let file = std::fs::File::open(src)
            .with_context(|| format!("failed to open backup at {}", src.display()))?;
        let mut decoder = GzDecoder::new(file);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .context("failed to decompress backup")?;

        let tmp_path = path.with_extension("db.restoring");
        std::fs::write(&tmp_path, &raw)
            .with_context(|| format!("failed to write restored database to {}", tmp_path.display()))?;

        {
            let conn = Connection::open(&tmp_path).context("failed to open restored database")?;
            schema::verify_schema(&conn).context("restored backup failed schema verification")?;
        }

        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to install restored database at {}", path.display()))?;
        info!(src = %src.display(), dest = %path.display(), "database restored from backup");
        Self::open(path, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CloseReason;

    fn store() -> DurableStore {
        DurableStore::open_in_memory(Arc::new(EventBus::new())).unwrap()
    }

    fn sample_position() -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 1.0,
            current_price: 100.0,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            stop_loss: 90.0,
            take_profits: vec![110.0, 120.0],
            trailing_stop: None,
            extreme_price: 100.0,
            pyramid_layers: 1,
            opened_at: Utc::now(),
            realized_pnl: 0.0,
            signal_id: "sig-store-test".into(),
            regime_state: "NEUTRAL".into(),
            phase: 1,
        }
    }

    #[test]
    fn upsert_then_recover_round_trips_open_position() {
        let store = store();
        store.upsert_position(&sample_position());
        let recovered = store.recover_open_positions().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].symbol, "BTCUSDT");
        assert_eq!(recovered[0].regime_state, "NEUTRAL");
        assert_eq!(recovered[0].phase, 1);
        // Only the nearest take-profit survives round-tripping through the
        // `current_tp` column.
        assert_eq!(recovered[0].take_profits, vec![110.0]);
    }

    #[test]
    fn recovered_position_gets_synthetic_signal_id() {
        let store = store();
        store.upsert_position(&sample_position());
        let recovered = store.recover_open_positions().unwrap();
        assert!(recovered[0].signal_id.starts_with("recovered_BTCUSDT_"));
    }

    #[test]
    fn closed_position_is_excluded_from_recovery() {
        let store = store();
        store.upsert_position(&sample_position());
        store.mark_position_closed("BTCUSDT", 110.0, 10.0, "MANUAL");
        assert!(store.recover_open_positions().unwrap().is_empty());
    }

    #[test]
    fn insert_trade_succeeds() {
        let store = store();
        let trade = crate::shadow_state::TradeRecord {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 110.0,
            quantity: 1.0,
            realized_pnl: 10.0,
            pnl_pct: 10.0,
            close_reason: CloseReason::Manual,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            signal_id: "sig-store-test".into(),
            stop_price: 90.0,
            tp_price: 120.0,
            regime_state: "NEUTRAL".into(),
            phase: 1,
        };
        store.insert_trade(&trade);
        assert_eq!(store.retry_queue_depth(), 0);
    }

    #[test]
    fn backup_refuses_in_memory_store() {
        let store = store();
        let dest = std::env::temp_dir().join("titan-core-test-backup.db.gz");
        assert!(store.backup_gz(&dest).is_err());
    }

    #[test]
    fn insert_event_persists_severity() {
        let store = store();
        let envelope = Envelope {
            sequence: 1,
            timestamp: Utc::now(),
            event: crate::event_bus::SystemEvent::ReconciliationFlatten {
                consecutive_mismatches: 3,
            },
        };
        store.insert_event(&envelope);
        let conn = store.conn.lock();
        let severity: String = conn
            .query_row("SELECT severity FROM system_events WHERE event_id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(severity, "CRITICAL");
    }
}
