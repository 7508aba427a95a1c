// =============================================================================
// Drift Monitors — PnL z-score watchdog and flash-crash detector
//
// Two independent tripwires layered on top of the circuit breaker's
// fixed thresholds: a z-score over a rolling PnL window catches a slow
// bleed the fixed daily-loss limit wouldn't yet have caught, and a
// short-window price-crash check catches a single violent candle. Both
// feed a more severe response than the circuit breaker's trip — the
// z-score stops new trading (`SAFETY_STOP`), the flash-crash monitor
// kills the whole engine (`HARD_KILL`).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::warn;

use crate::broker::BrokerGateway;
use crate::config_manager::ConfigManager;
use crate::event_bus::{EventBus, SystemEvent};
use crate::shadow_state::ShadowState;
use crate::types::{CloseReason, TradingMode};

const DEFAULT_WINDOW: usize = 30;
const MIN_SAMPLES: usize = 10;
const Z_SCORE_THRESHOLD: f64 = -2.0;

/// Rolling z-score watchdog over realized-trade PnL percentages.
pub struct PnlDriftMonitor {
    window: usize,
    samples: RwLock<VecDeque<f64>>,
    events: Arc<EventBus>,
}

impl PnlDriftMonitor {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self::with_window(DEFAULT_WINDOW, events)
    }

    pub fn with_window(window: usize, events: Arc<EventBus>) -> Self {
        Self {
            window,
            samples: RwLock::new(VecDeque::with_capacity(window)),
            events,
        }
    }

    /// Record a closed trade's realized PnL percentage and evaluate the
    /// z-score of the latest sample against the rest of the window.
    /// Returns `true` if this sample tripped `SAFETY_STOP`.
    pub fn record(&self, pnl_pct: f64) -> bool {
        let mut samples = self.samples.write();
        samples.push_back(pnl_pct);
        while samples.len() > self.window {
            samples.pop_front();
        }

        if samples.len() < MIN_SAMPLES {
            return false;
        }

        let baseline: Vec<f64> = samples.iter().copied().take(samples.len() - 1).collect();
        let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
        let variance =
            baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / baseline.len() as f64;
        let stddev = variance.sqrt();
        if stddev <= f64::EPSILON {
            return false;
        }

        let z = (pnl_pct - mean) / stddev;
        if z <= Z_SCORE_THRESHOLD {
            warn!(z_score = z, pnl_pct, "PnL drift z-score tripped safety stop");
            self.events.publish(SystemEvent::PnlDriftDetected { z_score: z });
            true
        } else {
            false
        }
    }
}

/// Short-window flash-crash detector, independent of the liquidation
/// detector's cascade-cooldown state machine — this one fires once and
/// hard-kills rather than holding a cooldown.
pub struct FlashCrashMonitor {
    window: Duration,
    threshold_pct: f64,
    prints: RwLock<HashMap<String, VecDeque<(Instant, f64)>>>,
}

impl FlashCrashMonitor {
    pub fn new() -> Self {
        Self::with_params(Duration::from_secs(5), 5.0)
    }

    pub fn with_params(window: Duration, threshold_pct: f64) -> Self {
        Self {
            window,
            threshold_pct,
            prints: RwLock::new(HashMap::new()),
        }
    }

    /// Feed a price print. Returns `Some(drop_pct)` if the window's
    /// high-low range exceeded the threshold.
    pub fn record_price(&self, symbol: &str, price: f64) -> Option<f64> {
        let mut prints = self.prints.write();
        let series = prints.entry(symbol.to_string()).or_default();
        let now = Instant::now();
        series.push_back((now, price));
        while let Some((at, _)) = series.front() {
            if now.duration_since(*at) > self.window {
                series.pop_front();
            } else {
                break;
            }
        }

        if series.len() < 2 {
            return None;
        }
        let high = series.iter().map(|(_, p)| *p).fold(f64::MIN, f64::max);
        let low = series.iter().map(|(_, p)| *p).fold(f64::MAX, f64::min);
        if high <= 0.0 {
            return None;
        }
        let drop_pct = (high - low) / high * 100.0;
        if drop_pct >= self.threshold_pct {
            Some(drop_pct)
        } else {
            None
        }
    }
}

impl Default for FlashCrashMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires both monitors to the kill-switch response they trigger.
pub struct DriftGuard {
    pub pnl: PnlDriftMonitor,
    pub flash_crash: FlashCrashMonitor,
    shadow: Arc<ShadowState>,
    broker: Arc<BrokerGateway>,
    config: Arc<ConfigManager>,
    events: Arc<EventBus>,
}

impl DriftGuard {
    pub fn new(
        shadow: Arc<ShadowState>,
        broker: Arc<BrokerGateway>,
        config: Arc<ConfigManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            pnl: PnlDriftMonitor::new(events.clone()),
            flash_crash: FlashCrashMonitor::new(),
            shadow,
            broker,
            config,
            events,
        }
    }

    pub fn on_trade_closed(&self, pnl_pct: f64) {
        if self.pnl.record(pnl_pct) {
            self.config.set_auto_exec(false);
            warn!("auto-execution disabled by PnL drift safety stop");
        }
    }

    pub async fn on_price_tick(&self, symbol: &str, price: f64) {
        if let Some(drop_pct) = self.flash_crash.record_price(symbol, price) {
            warn!(symbol, drop_pct, "flash crash detected, hard-killing engine");
            self.config.set_trading_mode(TradingMode::Killed);
            let shadow_closed = self.shadow.close_all_positions(CloseReason::HardKill);
            let broker_closed = self.broker.close_all_positions().await.unwrap_or(0);
            self.events.publish(SystemEvent::FlashCrashDetected {
                symbol: symbol.to_string(),
                drop_pct,
            });
            warn!(
                shadow_positions_closed = shadow_closed.len(),
                broker_positions_closed = broker_closed,
                "hard kill flatten complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_pnl_never_trips() {
        let monitor = PnlDriftMonitor::new(Arc::new(EventBus::new()));
        for _ in 0..20 {
            assert!(!monitor.record(0.5));
        }
    }

    #[test]
    fn sharp_negative_outlier_trips_safety_stop() {
        let monitor = PnlDriftMonitor::new(Arc::new(EventBus::new()));
        for _ in 0..15 {
            monitor.record(0.2);
        }
        assert!(monitor.record(-10.0));
    }

    #[test]
    fn flash_crash_needs_threshold_drop() {
        let monitor = FlashCrashMonitor::with_params(Duration::from_secs(5), 5.0);
        assert!(monitor.record_price("BTCUSDT", 100.0).is_none());
        assert!(monitor.record_price("BTCUSDT", 99.0).is_none());
        assert!(monitor.record_price("BTCUSDT", 90.0).is_some());
    }

    #[tokio::test]
    async fn on_price_tick_hard_kills_engine() {
        let events = Arc::new(EventBus::new());
        let shadow = Arc::new(ShadowState::new(events.clone()));
        let broker = Arc::new(BrokerGateway::new(
            Arc::new(crate::broker::paper::PaperAdapter::new()),
            crate::broker::RetryConfig::default(),
        ));
        let config = Arc::new(ConfigManager::new(
            "/tmp/titan-core-drift-test.json",
            events.clone(),
        ));
        let guard = DriftGuard::new(shadow, broker, config, events);
        guard.on_price_tick("BTCUSDT", 100.0).await;
        guard.on_price_tick("BTCUSDT", 90.0).await;
        assert_eq!(guard.config.trading_mode(), TradingMode::Killed);
    }
}
