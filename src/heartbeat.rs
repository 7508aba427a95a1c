// =============================================================================
// Heartbeat — dead-man's switch on the broker WS user stream
//
// Generalizes `app_state.rs`'s `last_ws_user_event: RwLock<Instant>` field
// into a standalone monitor: once `max_misses` consecutive expected beats
// pass without a fresh user-stream event, the engine assumes the
// connection is silently dead and emergency-flattens rather than trade
// blind.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::BrokerGateway;
use crate::config_manager::ConfigManager;
use crate::event_bus::{EventBus, SystemEvent};
use crate::shadow_state::ShadowState;
use crate::types::CloseReason;

const BEAT_INTERVAL: Duration = Duration::from_secs(10);

pub struct Heartbeat {
    last_event: RwLock<Instant>,
    max_misses: u32,
    consecutive_misses: AtomicU32,
    shadow: Arc<ShadowState>,
    broker: Arc<BrokerGateway>,
    config: Arc<ConfigManager>,
    events: Arc<EventBus>,
}

impl Heartbeat {
    pub fn new(
        max_misses: u32,
        shadow: Arc<ShadowState>,
        broker: Arc<BrokerGateway>,
        config: Arc<ConfigManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            last_event: RwLock::new(Instant::now()),
            max_misses,
            consecutive_misses: AtomicU32::new(0),
            shadow,
            broker,
            config,
            events,
        }
    }

    /// Call on every user-stream event (order update, balance update,
    /// listenKey keepalive ack) to reset the dead-man's switch.
    pub fn record_beat(&self) {
        *self.last_event.write() = Instant::now();
        self.consecutive_misses.store(0, Ordering::Relaxed);
    }

    /// Check whether a beat is overdue; if so, bump the miss counter and
    /// flatten once `max_misses` is reached. Intended to be called once
    /// per `BEAT_INTERVAL` from the maintenance loop.
    pub async fn check(&self) {
        let overdue = self.last_event.read().elapsed() >= BEAT_INTERVAL;
        if !overdue {
            return;
        }
        let misses = self.consecutive_misses.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(misses, max = self.max_misses, "heartbeat missed");
        self.events.publish(SystemEvent::HeartbeatMissed {
            consecutive_misses: misses,
        });

        if misses >= self.max_misses {
            warn!("dead man's switch triggered, flattening all positions");
            self.config.set_auto_exec(false);
            let shadow_closed = self.shadow.close_all_positions(CloseReason::DeadMansSwitch);
            let broker_closed = self.broker.close_all_positions().await.unwrap_or_else(|err| {
                warn!(error = %err, "broker-side flatten failed during dead man's switch response");
                0
            });
            info!(
                shadow_positions_closed = shadow_closed.len(),
                broker_positions_closed = broker_closed,
                "dead man's switch flatten complete"
            );
            self.events.publish(SystemEvent::DeadMansSwitchTriggered);
            self.consecutive_misses.store(0, Ordering::Relaxed);
            *self.last_event.write() = Instant::now();
        }
    }

    pub fn interval() -> Duration {
        BEAT_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperAdapter;
    use crate::broker::RetryConfig;
    use crate::types::Side;

    fn heartbeat(max_misses: u32) -> Heartbeat {
        let events = Arc::new(EventBus::new());
        let shadow = Arc::new(ShadowState::new(events.clone()));
        let broker = Arc::new(BrokerGateway::new(
            Arc::new(PaperAdapter::new()),
            RetryConfig::default(),
        ));
        let config = Arc::new(ConfigManager::new(
            "/tmp/titan-core-heartbeat-test.json",
            events.clone(),
        ));
        Heartbeat::new(max_misses, shadow, broker, config, events)
    }

    #[tokio::test]
    async fn fresh_beat_never_misses() {
        let hb = heartbeat(3);
        hb.record_beat();
        hb.check().await;
        assert_eq!(hb.consecutive_misses.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn stale_beat_triggers_flatten_after_max_misses() {
        let hb = heartbeat(2);
        hb.shadow
            .confirm_execution(
                "BTCUSDT",
                Side::Long,
                100.0,
                1.0,
                90.0,
                vec![],
                4,
                "sig-test",
                "NEUTRAL",
                1,
            )
            .unwrap();
        *hb.last_event.write() = Instant::now() - BEAT_INTERVAL - Duration::from_secs(1);
        hb.check().await;
        assert_eq!(hb.consecutive_misses.load(Ordering::Relaxed), 1);

        *hb.last_event.write() = Instant::now() - BEAT_INTERVAL - Duration::from_secs(1);
        hb.check().await;
        assert_eq!(hb.consecutive_misses.load(Ordering::Relaxed), 0);
        assert!(hb.shadow.get_position("BTCUSDT").is_none());
        assert!(!hb.config.public_config().auto_exec_enabled);
    }
}
