// =============================================================================
// Panic Controls — operator-triggered FLATTEN_ALL and CANCEL_ALL
//
// Two distinct actions with distinct blast radii. FLATTEN_ALL closes
// every open position, both in shadow state and at the broker, and
// disarms auto-execution so nothing reopens behind the operator's back.
// CANCEL_ALL only cancels outstanding orders and armed triggers — it
// never touches an open position, and it deliberately never touches the
// idempotency cache either, so a signal already in flight still only
// executes once even across a CANCEL_ALL.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::broker::BrokerGateway;
use crate::config_manager::ConfigManager;
use crate::event_bus::{EventBus, SystemEvent};
use crate::pipeline::IntentPipeline;
use crate::shadow_state::ShadowState;
use crate::types::CloseReason;

#[derive(Debug, Clone, Serialize)]
pub struct PanicActionLog {
    pub action: &'static str,
    pub positions_affected: u32,
    pub orders_cancelled: u32,
    pub operator_id: String,
    pub timestamp: String,
}

pub struct PanicControls {
    shadow: Arc<ShadowState>,
    broker: Arc<BrokerGateway>,
    config: Arc<ConfigManager>,
    pipeline: Arc<IntentPipeline>,
    events: Arc<EventBus>,
}

impl PanicControls {
    pub fn new(
        shadow: Arc<ShadowState>,
        broker: Arc<BrokerGateway>,
        config: Arc<ConfigManager>,
        pipeline: Arc<IntentPipeline>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            shadow,
            broker,
            config,
            pipeline,
            events,
        }
    }

    /// Close every open position, on both sides, and disable
    /// auto-execution so the engine does not immediately reopen one.
    pub async fn flatten_all(&self, operator_id: &str) -> PanicActionLog {
        self.config.set_auto_exec(false);
        let shadow_closed = self.shadow.close_all_positions(CloseReason::PanicFlattenAll);
        let broker_closed = self.broker.close_all_positions().await.unwrap_or(0);
        let positions_affected = shadow_closed.len() as u32 + broker_closed;

        self.events.publish(SystemEvent::PanicFlattenAll {
            operator_id: operator_id.to_string(),
            positions_affected,
        });

        let log = PanicActionLog {
            action: "FLATTEN_ALL",
            positions_affected,
            orders_cancelled: 0,
            operator_id: operator_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        info!(?log, "panic flatten_all executed");
        log
    }

    /// Cancel every outstanding order and armed client-side trigger.
    /// Never closes a position and never touches the broker gateway's
    /// idempotency cache — a signal that already executed stays executed.
    pub async fn cancel_all(&self, operator_id: &str) -> PanicActionLog {
        self.pipeline.sweep_stale_triggers();
        let mut orders_cancelled = 0u32;
        for symbol in self.shadow.get_all_positions().iter().map(|p| p.symbol.clone()) {
            if let Ok(open_orders) = self.broker.get_open_orders(&symbol).await {
                for order_id in open_orders {
                    if self.broker.cancel_order(&symbol, &order_id).await.is_ok() {
                        orders_cancelled += 1;
                    }
                }
            }
        }

        self.events.publish(SystemEvent::PanicCancelAll {
            operator_id: operator_id.to_string(),
            orders_cancelled,
        });

        let log = PanicActionLog {
            action: "CANCEL_ALL",
            positions_affected: 0,
            orders_cancelled,
            operator_id: operator_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        info!(?log, "panic cancel_all executed");
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperAdapter;
    use crate::broker::RetryConfig;
    use crate::phase_manager::PhaseManager;
    use crate::safety::SafetyGates;
    use crate::types::Side;

    fn controls() -> PanicControls {
        let events = Arc::new(EventBus::new());
        let shadow = Arc::new(ShadowState::new(events.clone()));
        let broker = Arc::new(BrokerGateway::new(
            Arc::new(PaperAdapter::new()),
            RetryConfig::default(),
        ));
        let config = Arc::new(ConfigManager::new(
            "/tmp/titan-core-panic-test.json",
            events.clone(),
        ));
        let safety = Arc::new(SafetyGates::new(1000.0, 0.5, 10, 0.5, 100, 12));
        let phase_manager = Arc::new(PhaseManager::new(events.clone()));
        let orderbook = Arc::new(crate::market_data::orderbook::OrderBookManager::new());
        let drift = Arc::new(crate::drift::DriftGuard::new(
            shadow.clone(),
            broker.clone(),
            config.clone(),
            events.clone(),
        ));
        let pipeline = Arc::new(IntentPipeline::new(
            shadow.clone(),
            safety,
            config.clone(),
            phase_manager,
            broker.clone(),
            orderbook,
            events.clone(),
            drift,
            crate::l2_validator::CRYPTO_PRESET.clone(),
        ));
        PanicControls::new(shadow, broker, config, pipeline, events)
    }

    #[tokio::test]
    async fn flatten_all_closes_positions_and_disables_auto_exec() {
        let controls = controls();
        controls
            .shadow
            .confirm_execution(
                "BTCUSDT",
                Side::Long,
                100.0,
                1.0,
                90.0,
                vec![],
                4,
                "sig-panic-test",
                "NEUTRAL",
                1,
            )
            .unwrap();
        let log = controls.flatten_all("operator-1").await;
        assert_eq!(log.action, "FLATTEN_ALL");
        assert_eq!(log.positions_affected, 1);
        assert!(controls.shadow.get_all_positions().is_empty());
        assert!(!controls.config.public_config().auto_exec_enabled);
    }

    #[tokio::test]
    async fn cancel_all_never_closes_positions() {
        let controls = controls();
        controls
            .shadow
            .confirm_execution(
                "BTCUSDT",
                Side::Long,
                100.0,
                1.0,
                90.0,
                vec![],
                4,
                "sig-panic-test",
                "NEUTRAL",
                1,
            )
            .unwrap();
        let log = controls.cancel_all("operator-1").await;
        assert_eq!(log.action, "CANCEL_ALL");
        assert_eq!(log.positions_affected, 0);
        assert_eq!(controls.shadow.get_all_positions().len(), 1);
    }
}
