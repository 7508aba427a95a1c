// =============================================================================
// Phase Manager — equity-tier operating phase
//
// Phase 1 (KICKSTARTER, equity < $1000): scalp-only, 10% risk, no
// pyramiding, maker-only. Phase 2 (TREND RIDER, equity >= $1000): day/swing,
// 5% risk, up to 4 pyramid layers, taker. Defaults to phase 1 whenever
// equity is unknown, the conservative choice for unset state.
// =============================================================================

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::info;

use crate::event_bus::{EventBus, SystemEvent};
use crate::types::Phase;

const PHASE_THRESHOLD_EQUITY: f64 = 1000.0;

pub struct PhaseManager {
    current: AtomicU8,
    events: std::sync::Arc<EventBus>,
}

impl PhaseManager {
    pub fn new(events: std::sync::Arc<EventBus>) -> Self {
        Self {
            current: AtomicU8::new(Phase::One.as_u8()),
            events,
        }
    }

    pub fn current(&self) -> Phase {
        match self.current.load(Ordering::Relaxed) {
            2 => Phase::Two,
            _ => Phase::One,
        }
    }

    /// Re-evaluate the phase given the latest known equity. `None` (no
    /// known equity yet) defaults to phase 1.
    pub fn update_equity(&self, equity: Option<f64>) -> Phase {
        let new_phase = match equity {
            Some(e) if e >= PHASE_THRESHOLD_EQUITY => Phase::Two,
            _ => Phase::One,
        };
        let old = self.current();
        if new_phase != old {
            self.current.store(new_phase.as_u8(), Ordering::Relaxed);
            info!(from = old.as_u8(), to = new_phase.as_u8(), equity = ?equity, "phase transition");
            self.events.publish(SystemEvent::PhaseTransition {
                from: old.as_u8(),
                to: new_phase.as_u8(),
                equity: equity.unwrap_or(0.0),
            });
        }
        new_phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn defaults_to_phase_one_with_unknown_equity() {
        let pm = PhaseManager::new(Arc::new(EventBus::new()));
        assert_eq!(pm.current(), Phase::One);
        assert_eq!(pm.update_equity(None), Phase::One);
    }

    #[test]
    fn crossing_threshold_transitions_to_phase_two() {
        let pm = PhaseManager::new(Arc::new(EventBus::new()));
        assert_eq!(pm.update_equity(Some(1500.0)), Phase::Two);
        assert_eq!(pm.current(), Phase::Two);
    }

    #[test]
    fn dropping_below_threshold_reverts_to_phase_one() {
        let pm = PhaseManager::new(Arc::new(EventBus::new()));
        pm.update_equity(Some(2000.0));
        assert_eq!(pm.update_equity(Some(500.0)), Phase::One);
    }
}
