// =============================================================================
// Central Application State — Titan Core execution engine
// =============================================================================
//
// The single source of truth tying every subsystem together: the intent
// pipeline, shadow state, broker gateway, safety gates, phase manager,
// reconciliation engine, heartbeat, drift guard, durable store and panic
// controls. AppState itself owns none of the trading logic — it wires the
// pieces together and builds the snapshot the dashboard API and WebSocket
// feed consume.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the error ring buffer.
//   - Arc wrappers for every subsystem, each managing its own interior
//     mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::BrokerGateway;
use crate::config_manager::{ConfigManager, EngineConfig};
use crate::drift::DriftGuard;
use crate::event_bus::EventBus;
use crate::heartbeat::Heartbeat;
use crate::market_data::orderbook::OrderBookManager;
use crate::panic_controls::PanicControls;
use crate::phase_manager::PhaseManager;
use crate::pipeline::IntentPipeline;
use crate::reconcile::ReconciliationEngine;
use crate::safety::circuit_breaker::RiskState;
use crate::safety::rate_limiter::RateLimiterSnapshot;
use crate::safety::SafetyGates;
use crate::shadow_state::{Position, ShadowState, TradeRecord};
use crate::store::DurableStore;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

const MAX_RECENT_ERRORS: usize = 50;
const RECENT_TRADES_LIMIT: usize = 100;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every
    /// meaningful mutation so the WebSocket feed can detect staleness
    /// without diffing the whole snapshot.
    pub state_version: AtomicU64,

    pub config: Arc<ConfigManager>,
    pub shadow: Arc<ShadowState>,
    pub broker: Arc<BrokerGateway>,
    pub safety: Arc<SafetyGates>,
    pub phase_manager: Arc<PhaseManager>,
    pub orderbook: Arc<OrderBookManager>,
    pub events: Arc<EventBus>,
    pub pipeline: Arc<IntentPipeline>,
    pub reconcile: Arc<ReconciliationEngine>,
    pub heartbeat: Arc<Heartbeat>,
    pub drift: Arc<DriftGuard>,
    pub store: Arc<DurableStore>,
    pub panic_controls: Arc<PanicControls>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

#[allow(clippy::too_many_arguments)]
impl AppState {
    pub fn new(
        config: Arc<ConfigManager>,
        shadow: Arc<ShadowState>,
        broker: Arc<BrokerGateway>,
        safety: Arc<SafetyGates>,
        phase_manager: Arc<PhaseManager>,
        orderbook: Arc<OrderBookManager>,
        events: Arc<EventBus>,
        pipeline: Arc<IntentPipeline>,
        reconcile: Arc<ReconciliationEngine>,
        heartbeat: Arc<Heartbeat>,
        drift: Arc<DriftGuard>,
        store: Arc<DurableStore>,
        panic_controls: Arc<PanicControls>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            shadow,
            broker,
            safety,
            phase_manager,
            orderbook,
            events,
            pipeline,
            reconcile,
            heartbeat,
            drift,
            store,
            panic_controls,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the entire engine state.
    /// This is the payload sent to the dashboard via `GET /api/status`
    /// and pushed over the WebSocket feed on every state change.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let config = self.config.public_config();
        let version = self.current_state_version();
        let risk_state = self.safety.circuit_breaker.get_state();
        let rate_limit = self.safety.rate_limiter.snapshot();

        let positions = self.shadow.get_all_positions();
        let recent_trades = self.shadow.recent_trades(RECENT_TRADES_LIMIT);
        let recent_errors = self.recent_errors.read().clone();
        let retry_queue_depth = self.store.retry_queue_depth() as u64;

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            auto_exec_enabled: config.auto_exec_enabled,
            phase: self.phase_manager.current().as_u8(),
            positions,
            recent_trades,
            recent_errors: Some(recent_errors),
            risk: RiskSnapshot {
                risk_mode: risk_state.risk_mode,
                daily_pnl: risk_state.daily_pnl,
                daily_pnl_pct: risk_state.daily_pnl_pct,
                consecutive_losses: risk_state.consecutive_losses,
                breakers: risk_state.breakers,
            },
            rate_limiter: rate_limit,
            config: ConfigSummary {
                symbols: config.symbols.clone(),
                max_risk_pct: config.max_risk_pct,
                max_consecutive_mismatches: config.max_consecutive_mismatches,
                heartbeat_max_misses: config.heartbeat_max_misses,
            },
            retry_queue_depth,
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub auto_exec_enabled: bool,
    pub phase: u8,
    pub positions: Vec<Position>,
    pub recent_trades: Vec<TradeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_errors: Option<Vec<ErrorRecord>>,
    pub risk: RiskSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
    pub config: ConfigSummary,
    pub retry_queue_depth: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub risk_mode: String,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: u32,
    pub breakers: Vec<crate::safety::circuit_breaker::BreakerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub symbols: Vec<String>,
    pub max_risk_pct: f64,
    pub max_consecutive_mismatches: u32,
    pub heartbeat_max_misses: u32,
}

// Re-exported for callers that only need the raw risk state without a
// full snapshot (e.g. the `/api/status` fast path).
pub fn risk_state(safety: &SafetyGates) -> RiskState {
    safety.circuit_breaker.get_state()
}

pub fn engine_config(config: &ConfigManager) -> EngineConfig {
    config.public_config()
}
