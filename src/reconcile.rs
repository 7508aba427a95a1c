// =============================================================================
// Reconciliation Engine — compare shadow state against the broker
//
// Unlike a pure drift logger, this reconciles toward safety: a mismatch
// taxonomy classifies every discrepancy, and once the same symbol has
// mismatched for `max_consecutive_mismatches` consecutive passes, auto-
// execution is disabled and every position on both sides is flattened.
// A single in-flight guard keeps overlapping passes from running the
// flatten path twice if a slow broker call makes one pass overrun the
// next tick.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::BrokerGateway;
use crate::config_manager::ConfigManager;
use crate::event_bus::{EventBus, SystemEvent};
use crate::shadow_state::ShadowState;
use crate::types::{CloseReason, Side};

/// Absolute epsilon below which a size difference is considered noise
/// rather than drift.
const SIZE_EPS_ABS: f64 = 1e-10;
/// Relative epsilon applied on top of the absolute one for larger sizes.
const SIZE_EPS_REL: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchKind {
    /// Broker reports a position the shadow state has no record of.
    MissingInShadow,
    /// Shadow state holds a position the broker no longer reports.
    MissingInBroker,
    /// Both sides agree a position exists but disagree on direction.
    SideMismatch,
    /// Both sides agree on symbol and side but disagree on quantity.
    SizeMismatch,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MissingInShadow => "MISSING_IN_SHADOW",
            Self::MissingInBroker => "MISSING_IN_BROKER",
            Self::SideMismatch => "SIDE_MISMATCH",
            Self::SizeMismatch => "SIZE_MISMATCH",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mismatch {
    pub symbol: String,
    pub kind: MismatchKind,
    pub shadow_side: Option<Side>,
    pub broker_side: Option<Side>,
    pub shadow_qty: Option<f64>,
    pub broker_qty: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub timestamp: String,
    pub positions_matched: u32,
    pub mismatches: Vec<Mismatch>,
    pub emergency_flatten_triggered: bool,
}

fn sizes_match(a: f64, b: f64) -> bool {
    let diff = (a - b).abs();
    diff <= SIZE_EPS_ABS || diff <= a.abs().max(b.abs()) * SIZE_EPS_REL
}

pub struct ReconciliationEngine {
    shadow: Arc<ShadowState>,
    broker: Arc<BrokerGateway>,
    config: Arc<ConfigManager>,
    events: Arc<EventBus>,
    max_consecutive_mismatches: u32,
    consecutive_mismatches: AtomicU32,
    in_progress: AtomicBool,
}

impl ReconciliationEngine {
    pub fn new(
        shadow: Arc<ShadowState>,
        broker: Arc<BrokerGateway>,
        config: Arc<ConfigManager>,
        events: Arc<EventBus>,
        max_consecutive_mismatches: u32,
    ) -> Self {
        Self {
            shadow,
            broker,
            config,
            events,
            max_consecutive_mismatches,
            consecutive_mismatches: AtomicU32::new(0),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Run one reconciliation pass. Returns `Ok(None)` without doing any
    /// work if a previous pass is still in flight.
    pub async fn run_once(&self) -> Result<Option<ReconcileReport>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("reconciliation pass skipped: previous pass still in flight");
            return Ok(None);
        }
        let result = self.run_once_inner().await;
        self.in_progress.store(false, Ordering::Release);
        result.map(Some)
    }

    async fn run_once_inner(&self) -> Result<ReconcileReport> {
        let now = Utc::now().to_rfc3339();
        info!(timestamp = %now, "reconciliation pass started");

        let broker_positions = self.broker.get_open_positions().await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to fetch broker positions, treating as empty");
            Vec::new()
        });
        let shadow_positions = self.shadow.get_all_positions();

        let shadow_symbols: HashSet<&str> =
            shadow_positions.iter().map(|p| p.symbol.as_str()).collect();

        let mut mismatches = Vec::new();
        let mut matched = 0u32;

        for pos in &shadow_positions {
            match broker_positions.iter().find(|(s, _, _)| s == &pos.symbol) {
                None => mismatches.push(Mismatch {
                    symbol: pos.symbol.clone(),
                    kind: MismatchKind::MissingInBroker,
                    shadow_side: Some(pos.side),
                    broker_side: None,
                    shadow_qty: Some(pos.quantity),
                    broker_qty: None,
                }),
                Some((_, broker_side, broker_qty)) => {
                    if *broker_side != pos.side {
                        mismatches.push(Mismatch {
                            symbol: pos.symbol.clone(),
                            kind: MismatchKind::SideMismatch,
                            shadow_side: Some(pos.side),
                            broker_side: Some(*broker_side),
                            shadow_qty: Some(pos.quantity),
                            broker_qty: Some(*broker_qty),
                        });
                    } else if !sizes_match(pos.quantity, *broker_qty) {
                        mismatches.push(Mismatch {
                            symbol: pos.symbol.clone(),
                            kind: MismatchKind::SizeMismatch,
                            shadow_side: Some(pos.side),
                            broker_side: Some(*broker_side),
                            shadow_qty: Some(pos.quantity),
                            broker_qty: Some(*broker_qty),
                        });
                    } else {
                        matched += 1;
                    }
                }
            }
        }

        for (symbol, side, qty) in &broker_positions {
            if !shadow_symbols.contains(symbol.as_str()) {
                mismatches.push(Mismatch {
                    symbol: symbol.clone(),
                    kind: MismatchKind::MissingInShadow,
                    shadow_side: None,
                    broker_side: Some(*side),
                    shadow_qty: None,
                    broker_qty: Some(*qty),
                });
            }
        }

        let had_mismatch = !mismatches.is_empty();
        let streak_after = if had_mismatch {
            self.consecutive_mismatches.load(Ordering::Relaxed) + 1
        } else {
            0
        };

        for mismatch in &mismatches {
            warn!(
                symbol = %mismatch.symbol,
                kind = %mismatch.kind,
                consecutive = streak_after,
                "reconciliation mismatch detected"
            );
            self.events.publish(SystemEvent::ReconciliationMismatch {
                symbol: mismatch.symbol.clone(),
                kind: mismatch.kind.to_string(),
                consecutive: streak_after,
            });
        }

        let emergency_flatten_triggered = self.update_mismatch_streak(had_mismatch).await;

        let report = ReconcileReport {
            timestamp: now,
            positions_matched: matched,
            mismatches,
            emergency_flatten_triggered,
        };
        info!(
            positions_matched = report.positions_matched,
            mismatches = report.mismatches.len(),
            emergency_flatten_triggered,
            "reconciliation pass completed"
        );
        Ok(report)
    }

    /// Advance the consecutive-mismatch counter and trigger an emergency
    /// flatten once it reaches the configured threshold. Returns whether
    /// a flatten was triggered this pass.
    async fn update_mismatch_streak(&self, had_mismatch: bool) -> bool {
        if !had_mismatch {
            self.consecutive_mismatches.store(0, Ordering::Relaxed);
            return false;
        }
        let count = self.consecutive_mismatches.fetch_add(1, Ordering::Relaxed) + 1;
        if count < self.max_consecutive_mismatches {
            return false;
        }

        warn!(
            consecutive_mismatches = count,
            "reconciliation mismatch streak exceeded threshold, flattening all positions"
        );
        self.config.set_auto_exec(false);
        let shadow_closed = self
            .shadow
            .close_all_positions(CloseReason::ReconciliationFlatten);
        let broker_closed = self.broker.close_all_positions().await.unwrap_or_else(|err| {
            warn!(error = %err, "broker-side flatten failed during emergency reconciliation response");
            0
        });
        self.consecutive_mismatches.store(0, Ordering::Relaxed);
        info!(
            shadow_positions_closed = shadow_closed.len(),
            broker_positions_closed = broker_closed,
            "emergency flatten complete"
        );

        self.events.publish(SystemEvent::ReconciliationFlatten {
            consecutive_mismatches: count,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperAdapter;
    use crate::broker::RetryConfig;
    use crate::types::Side;

    fn engine(max: u32) -> ReconciliationEngine {
        let events = Arc::new(EventBus::new());
        let shadow = Arc::new(ShadowState::new(events.clone()));
        let broker = Arc::new(BrokerGateway::new(
            Arc::new(PaperAdapter::new()),
            RetryConfig::default(),
        ));
        let config = Arc::new(ConfigManager::new(
            "/tmp/titan-core-reconcile-test.json",
            events.clone(),
        ));
        ReconciliationEngine::new(shadow, broker, config, events, max)
    }

    #[test]
    fn sizes_match_tolerates_float_noise() {
        assert!(sizes_match(1.0000000001, 1.0));
        assert!(!sizes_match(1.0, 1.1));
    }

    #[tokio::test]
    async fn clean_state_reports_no_mismatches() {
        let engine = engine(3);
        let report = engine.run_once().await.unwrap().unwrap();
        assert!(report.mismatches.is_empty());
        assert!(!report.emergency_flatten_triggered);
    }

    #[tokio::test]
    async fn shadow_only_position_is_missing_in_broker() {
        let engine = engine(3);
        engine
            .shadow
            .confirm_execution(
                "BTCUSDT",
                Side::Long,
                100.0,
                1.0,
                90.0,
                vec![],
                4,
                "sig-reconcile-test",
                "NEUTRAL",
                1,
            )
            .unwrap();
        let report = engine.run_once().await.unwrap().unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].kind, MismatchKind::MissingInBroker);
    }

    #[tokio::test]
    async fn streak_exceeding_threshold_triggers_flatten_and_disables_auto_exec() {
        let engine = engine(2);
        engine
            .shadow
            .confirm_execution(
                "BTCUSDT",
                Side::Long,
                100.0,
                1.0,
                90.0,
                vec![],
                4,
                "sig-reconcile-test",
                "NEUTRAL",
                1,
            )
            .unwrap();

        let first = engine.run_once().await.unwrap().unwrap();
        assert!(!first.emergency_flatten_triggered);

        engine
            .shadow
            .confirm_execution(
                "BTCUSDT",
                Side::Long,
                100.0,
                1.0,
                90.0,
                vec![],
                4,
                "sig-reconcile-test",
                "NEUTRAL",
                1,
            )
            .ok();
        let second = engine.run_once().await.unwrap().unwrap();
        assert!(second.emergency_flatten_triggered);
        assert!(!engine.config.public_config().auto_exec_enabled);
    }

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let engine = engine(3);
        engine.in_progress.store(true, Ordering::SeqCst);
        let result = engine.run_once().await.unwrap();
        assert!(result.is_none());
    }
}
