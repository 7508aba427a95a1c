// =============================================================================
// Liquidation Detector — flags forced-liquidation cascades
//
// Holds a short rolling window of recent trade prints per symbol and
// classifies a cascade the way the regime detector classifies market
// state: a hierarchy of rules evaluated top-to-bottom against the window,
// with a held "cascade active" state that cools down rather than
// resetting the instant the triggering condition clears.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Price move within the window that marks a cascade (1.5%).
const CASCADE_PRICE_DROP_PCT: f64 = 1.5;
/// Rolling window length.
const WINDOW: Duration = Duration::from_secs(10);
/// Minimum number of prints required before a window is considered
/// statistically meaningful.
const MIN_PRINTS: usize = 5;
/// How long a detected cascade continues to veto trading after the
/// triggering price action clears.
const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Copy)]
struct Print {
    price: f64,
    at: Instant,
}

struct SymbolState {
    prints: Vec<Print>,
    cascade_until: Option<Instant>,
}

pub struct LiquidationDetector {
    symbols: RwLock<HashMap<String, SymbolState>>,
}

impl LiquidationDetector {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Feed a trade print from the market-data stream.
    pub fn record_trade(&self, symbol: &str, price: f64) {
        let mut symbols = self.symbols.write();
        let state = symbols.entry(symbol.to_string()).or_insert_with(|| SymbolState {
            prints: Vec::new(),
            cascade_until: None,
        });

        let now = Instant::now();
        state.prints.push(Print { price, at: now });
        state.prints.retain(|p| now.duration_since(p.at) <= WINDOW);

        if state.prints.len() < MIN_PRINTS {
            return;
        }

        let high = state
            .prints
            .iter()
            .map(|p| p.price)
            .fold(f64::MIN, f64::max);
        let low = state
            .prints
            .iter()
            .map(|p| p.price)
            .fold(f64::MAX, f64::min);

        if high <= 0.0 {
            return;
        }
        let drop_pct = (high - low) / high * 100.0;

        if drop_pct >= CASCADE_PRICE_DROP_PCT {
            if state.cascade_until.is_none() {
                warn!(symbol, drop_pct, "liquidation cascade detected");
            }
            state.cascade_until = Some(now + COOLDOWN);
        }
    }

    /// Returns `Ok(())` if trading is permitted, or a reason string if a
    /// cascade is active (or still cooling down) for `symbol`.
    pub fn check(&self, symbol: &str) -> Result<(), String> {
        let symbols = self.symbols.read();
        match symbols.get(symbol).and_then(|s| s.cascade_until) {
            Some(until) if Instant::now() < until => {
                Err("liquidation_cascade_detected".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl Default for LiquidationDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LiquidationDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidationDetector")
            .field("tracked_symbols", &self.symbols.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calm_prints_never_trip() {
        let d = LiquidationDetector::new();
        for price in [100.0, 100.1, 99.9, 100.2, 100.0, 99.95] {
            d.record_trade("BTCUSDT", price);
        }
        assert!(d.check("BTCUSDT").is_ok());
    }

    #[test]
    fn sharp_drop_trips_cascade() {
        let d = LiquidationDetector::new();
        for price in [100.0, 99.5, 99.0, 98.0, 97.0, 96.0] {
            d.record_trade("BTCUSDT", price);
        }
        assert_eq!(d.check("BTCUSDT").unwrap_err(), "liquidation_cascade_detected");
    }

    #[test]
    fn unrelated_symbol_unaffected() {
        let d = LiquidationDetector::new();
        for price in [100.0, 99.5, 99.0, 98.0, 97.0, 96.0] {
            d.record_trade("BTCUSDT", price);
        }
        assert!(d.check("ETHUSDT").is_ok());
    }
}
