// =============================================================================
// Typed event bus
//
// Replaces the pervasive ad hoc emitters a first pass at this system tends
// to grow (gateway calling into shadow state calling into reconciliation
// directly). Every cross-module notification goes out as a `SystemEvent`
// on a single broadcast channel; subscribers (the WS handler, the durable
// store writer, the panic-control logger) never call back into the module
// that raised the event.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{CloseReason, Severity, Side};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SystemEvent {
    IntentReceived {
        intent_id: String,
        signal_id: String,
        symbol: String,
    },
    IntentRejected {
        intent_id: String,
        symbol: String,
        reason: String,
    },
    IntentExecuted {
        intent_id: String,
        symbol: String,
        side: Side,
        quantity: f64,
        price: f64,
        client_order_id: String,
    },
    PositionOpened {
        symbol: String,
        side: Side,
        entry_price: f64,
        quantity: f64,
    },
    PositionPyramided {
        symbol: String,
        new_avg_price: f64,
        total_quantity: f64,
        layer: u32,
    },
    PositionClosed {
        symbol: String,
        close_reason: CloseReason,
        realized_pnl: f64,
    },
    CircuitBreakerTripped {
        reason: String,
    },
    CircuitBreakerReset,
    RateLimitBackoff {
        multiplier: u32,
    },
    RegimeChanged {
        symbol: String,
        class: String,
        size_multiplier: f64,
    },
    LiquidationCascadeDetected {
        symbol: String,
    },
    ReconciliationMismatch {
        symbol: String,
        kind: String,
        consecutive: u32,
    },
    ReconciliationFlatten {
        consecutive_mismatches: u32,
    },
    HeartbeatMissed {
        consecutive_misses: u32,
    },
    DeadMansSwitchTriggered,
    PnlDriftDetected {
        z_score: f64,
    },
    FlashCrashDetected {
        symbol: String,
        drop_pct: f64,
    },
    PhaseTransition {
        from: u8,
        to: u8,
        equity: f64,
    },
    PanicFlattenAll {
        operator_id: String,
        positions_affected: u32,
    },
    PanicCancelAll {
        operator_id: String,
        orders_cancelled: u32,
    },
    ConfigUpdated {
        field: String,
    },
    RetryQueueExhausted {
        operation: String,
    },
    Log {
        severity: Severity,
        message: String,
    },
}

impl SystemEvent {
    pub fn severity(&self) -> Severity {
        match self {
            Self::IntentRejected { .. }
            | Self::CircuitBreakerTripped { .. }
            | Self::RateLimitBackoff { .. }
            | Self::ReconciliationMismatch { .. }
            | Self::HeartbeatMissed { .. }
            | Self::RetryQueueExhausted { .. } => Severity::Warn,
            Self::ReconciliationFlatten { .. }
            | Self::DeadMansSwitchTriggered
            | Self::PnlDriftDetected { .. }
            | Self::FlashCrashDetected { .. }
            | Self::LiquidationCascadeDetected { .. }
            | Self::PanicFlattenAll { .. } => Severity::Critical,
            Self::Log { severity, .. } => *severity,
            _ => Severity::Info,
        }
    }
}

/// A timestamped envelope, what actually travels on the channel and what
/// the durable store's `system_events` table persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: SystemEvent,
}

pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    sequence: std::sync::atomic::AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Publish an event. Never blocks; if nobody is subscribed the event
    /// is simply dropped, matching `tokio::sync::broadcast`'s semantics.
    pub fn publish(&self, event: SystemEvent) {
        let sequence = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope = Envelope {
            sequence,
            timestamp: Utc::now(),
            event,
        };
        // A publish with no subscribers returns Err; that's expected at
        // startup before the WS/store consumers have attached.
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SystemEvent::CircuitBreakerReset);
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.sequence, 0);
        matches!(envelope.event, SystemEvent::CircuitBreakerReset);
    }

    #[tokio::test]
    async fn sequence_numbers_increase_monotonically() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SystemEvent::CircuitBreakerReset);
        bus.publish(SystemEvent::CircuitBreakerReset);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[test]
    fn severity_classification() {
        assert_eq!(
            SystemEvent::DeadMansSwitchTriggered.severity(),
            Severity::Critical
        );
        assert_eq!(
            SystemEvent::ConfigUpdated {
                field: "x".into()
            }
            .severity(),
            Severity::Info
        );
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(SystemEvent::CircuitBreakerReset);
    }
}
