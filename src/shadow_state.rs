// =============================================================================
// Shadow State — the internal source of truth for positions and intents
//
// Generalizes the position engine's open/partial/closed state machine with
// two additions the original engine never needed: an `Intent` map (tracked
// through its own lifecycle, independent of any position it may eventually
// produce) and the anti-ghost-position invariant — a REJECTED intent must
// never be allowed to mutate position state, by construction rather than by
// convention. Exactly one open `Position` is held per symbol; a further fill
// on the same side pyramids into the existing position via a volume-weighted
// average entry price instead of opening a second one.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::event_bus::{EventBus, SystemEvent};
use crate::types::{CloseReason, IntentStatus, IntentType, Side};

const TRADE_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub signal_id: String,
    pub symbol: String,
    pub intent_type: IntentType,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl Intent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    pub stop_loss: f64,
    /// Ordered ascending-distance take-profit ladder (TP1, TP2, ...).
    pub take_profits: Vec<f64>,
    #[serde(default)]
    pub trailing_stop: Option<f64>,
    #[serde(default)]
    pub extreme_price: f64,
    pub pyramid_layers: u32,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub realized_pnl: f64,
    /// `signal_id` of the intent that first opened this position. Not
    /// updated by later pyramid fills.
    #[serde(default)]
    pub signal_id: String,
    /// Derivatives regime class in effect when the position was opened.
    #[serde(default)]
    pub regime_state: String,
    /// Operating phase in effect when the position was opened.
    #[serde(default)]
    pub phase: u8,
}

impl Position {
    fn recompute_pnl(&mut self) {
        let direction = self.side.sign();
        self.unrealized_pnl = direction * (self.current_price - self.entry_price) * self.quantity;
        self.unrealized_pnl_pct = if self.entry_price > 0.0 {
            direction * ((self.current_price - self.entry_price) / self.entry_price) * 100.0
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    #[serde(default)]
    pub pnl_pct: f64,
    pub close_reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    #[serde(default)]
    pub signal_id: String,
    #[serde(default)]
    pub stop_price: f64,
    #[serde(default)]
    pub tp_price: f64,
    #[serde(default)]
    pub regime_state: String,
    #[serde(default)]
    pub phase: u8,
}

struct Inner {
    intents: HashMap<String, Intent>,
    positions: HashMap<String, Position>,
    trade_history: Vec<TradeRecord>,
}

/// Owns all mutable position/intent state behind a single per-instance
/// lock. There is deliberately no global lock shared with other
/// components — callers serialize through `ShadowState`'s own API, not
/// through an external mutex.
pub struct ShadowState {
    inner: RwLock<Inner>,
    events: std::sync::Arc<EventBus>,
}

impl ShadowState {
    pub fn new(events: std::sync::Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                intents: HashMap::new(),
                positions: HashMap::new(),
                trade_history: Vec::new(),
            }),
            events,
        }
    }

    // -------------------------------------------------------------------
    // Intent lifecycle
    // -------------------------------------------------------------------

    pub fn record_intent(&self, intent: Intent) {
        let symbol = intent.symbol.clone();
        let id = intent.id.clone();
        self.inner.write().intents.insert(id.clone(), intent);
        self.events.publish(SystemEvent::IntentReceived {
            intent_id: id,
            signal_id: symbol.clone(),
            symbol,
        });
    }

    pub fn get_intent(&self, id: &str) -> Option<Intent> {
        self.inner.read().intents.get(id).cloned()
    }

    /// Mark an intent rejected. This is the only path that sets
    /// `IntentStatus::Rejected`, and it touches no `Position` — the
    /// anti-ghost-position invariant holds by construction because
    /// nothing else in this type's API can create or modify a position
    /// from a rejected intent.
    pub fn reject_intent(&self, id: &str, reason: &str) {
        let mut inner = self.inner.write();
        if let Some(intent) = inner.intents.get_mut(id) {
            intent.status = IntentStatus::Rejected;
            intent.rejection_reason = Some(reason.to_string());
            let symbol = intent.symbol.clone();
            drop(inner);
            warn!(intent_id = id, reason, "intent rejected");
            self.events.publish(SystemEvent::IntentRejected {
                intent_id: id.to_string(),
                symbol,
                reason: reason.to_string(),
            });
        }
    }

    pub fn validate_intent(&self, id: &str) {
        if let Some(intent) = self.inner.write().intents.get_mut(id) {
            intent.status = IntentStatus::Validated;
        }
    }

    pub fn mark_intent_executed(&self, id: &str) {
        if let Some(intent) = self.inner.write().intents.get_mut(id) {
            intent.status = IntentStatus::Executed;
        }
    }

    /// Sweep expired PENDING/VALIDATED intents. Returns the expired ids.
    pub fn expire_stale_intents(&self) -> Vec<String> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let mut expired = Vec::new();
        for intent in inner.intents.values_mut() {
            if matches!(intent.status, IntentStatus::Pending | IntentStatus::Validated)
                && intent.is_expired(now)
            {
                intent.status = IntentStatus::Expired;
                expired.push(intent.id.clone());
            }
        }
        expired
    }

    // -------------------------------------------------------------------
    // Position management
    // -------------------------------------------------------------------

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.inner.read().positions.get(symbol).cloned()
    }

    pub fn get_all_positions(&self) -> Vec<Position> {
        self.inner.read().positions.values().cloned().collect()
    }

    /// Open a new position, or pyramid into an existing same-side one via
    /// a volume-weighted average entry price. Returns the resulting
    /// number of pyramid layers.
    #[allow(clippy::too_many_arguments)]
    pub fn confirm_execution(
        &self,
        symbol: &str,
        side: Side,
        fill_price: f64,
        fill_qty: f64,
        stop_loss: f64,
        take_profits: Vec<f64>,
        max_layers: u32,
        signal_id: &str,
        regime_state: &str,
        phase: u8,
    ) -> Result<u32, String> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.positions.get_mut(symbol) {
            if existing.side != side {
                return Err(format!(
                    "position already open on {symbol} with opposite side"
                ));
            }
            if existing.pyramid_layers >= max_layers {
                return Err(format!(
                    "symbol {symbol} already at max pyramid layers ({max_layers})"
                ));
            }
            let old_notional = existing.entry_price * existing.quantity;
            let new_notional = fill_price * fill_qty;
            let total_qty = existing.quantity + fill_qty;
            existing.entry_price = (old_notional + new_notional) / total_qty;
            existing.quantity = total_qty;
            existing.pyramid_layers += 1;
            existing.stop_loss = stop_loss;
            existing.take_profits = take_profits;
            existing.recompute_pnl();

            let layer = existing.pyramid_layers;
            let avg_price = existing.entry_price;
            let total_qty = existing.quantity;
            drop(inner);

            info!(symbol, avg_price, total_qty, layer, "position pyramided");
            self.events.publish(SystemEvent::PositionPyramided {
                symbol: symbol.to_string(),
                new_avg_price: avg_price,
                total_quantity: total_qty,
                layer,
            });
            Ok(layer)
        } else {
            let position = Position {
                symbol: symbol.to_string(),
                side,
                entry_price: fill_price,
                quantity: fill_qty,
                current_price: fill_price,
                unrealized_pnl: 0.0,
                unrealized_pnl_pct: 0.0,
                stop_loss,
                take_profits,
                trailing_stop: None,
                extreme_price: fill_price,
                pyramid_layers: 1,
                opened_at: Utc::now(),
                realized_pnl: 0.0,
                signal_id: signal_id.to_string(),
                regime_state: regime_state.to_string(),
                phase,
            };
            inner.positions.insert(symbol.to_string(), position);
            drop(inner);

            info!(symbol, side = %side, fill_price, fill_qty, "position opened");
            self.events.publish(SystemEvent::PositionOpened {
                symbol: symbol.to_string(),
                side,
                entry_price: fill_price,
                quantity: fill_qty,
            });
            Ok(1)
        }
    }

    /// Reinsert a position recovered from the durable store at startup,
    /// bypassing the intent/fill path entirely. Only called once, before
    /// the pipeline starts accepting new signals.
    pub fn restore_position(&self, position: Position) {
        let symbol = position.symbol.clone();
        self.inner.write().positions.insert(symbol.clone(), position);
        info!(symbol, "position restored from durable store");
    }

    pub fn update_price(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.write();
        if let Some(pos) = inner.positions.get_mut(symbol) {
            pos.current_price = price;
            let is_long = pos.side == Side::Long;
            if (is_long && price > pos.extreme_price) || (!is_long && price < pos.extreme_price) {
                pos.extreme_price = price;
            }
            pos.recompute_pnl();
        }
    }

    /// Fully close a position and append the immutable trade record.
    pub fn close_position(
        &self,
        symbol: &str,
        exit_price: f64,
        reason: CloseReason,
    ) -> Option<TradeRecord> {
        let mut inner = self.inner.write();
        let pos = inner.positions.remove(symbol)?;

        let direction = pos.side.sign();
        let realized_pnl =
            pos.realized_pnl + direction * (exit_price - pos.entry_price) * pos.quantity;
        let pnl_pct = if pos.entry_price > 0.0 {
            direction * ((exit_price - pos.entry_price) / pos.entry_price) * 100.0
        } else {
            0.0
        };

        let record = TradeRecord {
            symbol: symbol.to_string(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            realized_pnl,
            pnl_pct,
            close_reason: reason.clone(),
            opened_at: pos.opened_at,
            closed_at: Utc::now(),
            signal_id: pos.signal_id.clone(),
            stop_price: pos.stop_loss,
            tp_price: pos.take_profits.first().copied().unwrap_or(0.0),
            regime_state: pos.regime_state.clone(),
            phase: pos.phase,
        };

        inner.trade_history.push(record.clone());
        while inner.trade_history.len() > TRADE_HISTORY_CAPACITY {
            inner.trade_history.remove(0);
        }
        drop(inner);

        info!(symbol, exit_price, realized_pnl, reason = %reason, "position closed");
        self.events.publish(SystemEvent::PositionClosed {
            symbol: symbol.to_string(),
            close_reason: reason,
            realized_pnl,
        });
        Some(record)
    }

    /// Close every open position with the same reason. Used by
    /// reconciliation-triggered and panic-triggered flattens.
    pub fn close_all_positions(&self, reason: CloseReason) -> Vec<TradeRecord> {
        let symbols: Vec<String> = self.inner.read().positions.keys().cloned().collect();
        symbols
            .into_iter()
            .filter_map(|symbol| {
                let price = self
                    .inner
                    .read()
                    .positions
                    .get(&symbol)
                    .map(|p| p.current_price)
                    .unwrap_or(0.0);
                self.close_position(&symbol, price, reason.clone())
            })
            .collect()
    }

    pub fn recent_trades(&self, count: usize) -> Vec<TradeRecord> {
        let inner = self.inner.read();
        inner.trade_history.iter().rev().take(count).cloned().collect()
    }

    pub fn open_position_count(&self) -> usize {
        self.inner.read().positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn state() -> ShadowState {
        ShadowState::new(Arc::new(EventBus::new()))
    }

    #[test]
    fn rejected_intent_never_creates_a_position() {
        let s = state();
        s.record_intent(Intent {
            id: "i1".into(),
            signal_id: "sig1".into(),
            symbol: "BTCUSDT".into(),
            intent_type: IntentType::BuySetup,
            status: IntentStatus::Pending,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            rejection_reason: None,
        });
        s.reject_intent("i1", "l2_validator_stale_cache");
        assert_eq!(s.get_intent("i1").unwrap().status, IntentStatus::Rejected);
        assert!(s.get_position("BTCUSDT").is_none());
    }

    #[test]
    fn pyramiding_computes_volume_weighted_average() {
        let s = state();
        s.confirm_execution("BTCUSDT", Side::Long, 100.0, 1.0, 90.0, vec![110.0], 4, "sig-test", "NEUTRAL", 1)
            .unwrap();
        s.confirm_execution("BTCUSDT", Side::Long, 120.0, 1.0, 90.0, vec![130.0], 4, "sig-test", "NEUTRAL", 1)
            .unwrap();
        let pos = s.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.pyramid_layers, 2);
        assert!((pos.entry_price - 110.0).abs() < 1e-9);
        assert!((pos.quantity - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pyramid_layers_capped() {
        let s = state();
        s.confirm_execution("ETHUSDT", Side::Long, 100.0, 1.0, 90.0, vec![], 1, "sig-test", "NEUTRAL", 1)
            .unwrap();
        let err = s
            .confirm_execution("ETHUSDT", Side::Long, 105.0, 1.0, 90.0, vec![], 1, "sig-test", "NEUTRAL", 1)
            .unwrap_err();
        assert!(err.contains("max pyramid layers"));
    }

    #[test]
    fn only_one_position_per_symbol_opposite_side_rejected() {
        let s = state();
        s.confirm_execution("BTCUSDT", Side::Long, 100.0, 1.0, 90.0, vec![], 4, "sig-test", "NEUTRAL", 1)
            .unwrap();
        let err = s
            .confirm_execution("BTCUSDT", Side::Short, 100.0, 1.0, 110.0, vec![], 4, "sig-test", "NEUTRAL", 1)
            .unwrap_err();
        assert!(err.contains("opposite side"));
    }

    #[test]
    fn close_position_appends_trade_record_and_removes_position() {
        let s = state();
        s.confirm_execution("BTCUSDT", Side::Long, 100.0, 1.0, 90.0, vec![], 4, "sig-test", "NEUTRAL", 1)
            .unwrap();
        let record = s
            .close_position("BTCUSDT", 110.0, CloseReason::Tp(1))
            .unwrap();
        assert!((record.realized_pnl - 10.0).abs() < 1e-9);
        assert!(s.get_position("BTCUSDT").is_none());
        assert_eq!(s.recent_trades(10).len(), 1);
    }

    #[test]
    fn trade_history_ring_buffer_evicts_oldest() {
        let s = state();
        for i in 0..(TRADE_HISTORY_CAPACITY + 5) {
            let symbol = format!("SYM{i}");
            s.confirm_execution(&symbol, Side::Long, 100.0, 1.0, 90.0, vec![], 4, "sig-test", "NEUTRAL", 1)
                .unwrap();
            s.close_position(&symbol, 101.0, CloseReason::Manual);
        }
        assert_eq!(s.inner.read().trade_history.len(), TRADE_HISTORY_CAPACITY);
    }

    #[test]
    fn expire_stale_intents_flags_past_ttl() {
        let s = state();
        s.record_intent(Intent {
            id: "i2".into(),
            signal_id: "sig2".into(),
            symbol: "BTCUSDT".into(),
            intent_type: IntentType::Prepare,
            status: IntentStatus::Pending,
            created_at: Utc::now() - chrono::Duration::minutes(10),
            expires_at: Utc::now() - chrono::Duration::minutes(5),
            rejection_reason: None,
        });
        let expired = s.expire_stale_intents();
        assert_eq!(expired, vec!["i2".to_string()]);
        assert_eq!(s.get_intent("i2").unwrap().status, IntentStatus::Expired);
    }
}
