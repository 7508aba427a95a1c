// =============================================================================
// L2 Validator — zero-I/O checks against the cached order book
//
// Every check reads only the already-cached `OrderBookState`; none of them
// touch the network, matching the "zero-I/O" requirement so the validator
// can run inline in the pipeline without adding latency. Checks run in a
// fixed order and the first failure short-circuits the rest.
// =============================================================================

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::market_data::orderbook::OrderBookState;
use crate::types::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetPreset {
    pub name: &'static str,
    pub max_cache_age_ms: u64,
    pub min_structure_score: f64,
    pub max_spread_pct: f64,
    pub max_slippage_pct: f64,
    pub obi_top_n: usize,
    pub obi_buy_threshold: f64,
    pub obi_sell_threshold: f64,
}

pub static CRYPTO_PRESET: Lazy<AssetPreset> = Lazy::new(|| AssetPreset {
    name: "crypto",
    max_cache_age_ms: 100,
    min_structure_score: 60.0,
    max_spread_pct: 0.10,
    max_slippage_pct: 0.15,
    obi_top_n: 10,
    obi_buy_threshold: 0.5,
    obi_sell_threshold: -0.5,
});

pub static EQUITY_PRESET: Lazy<AssetPreset> = Lazy::new(|| AssetPreset {
    name: "equity",
    max_cache_age_ms: 250,
    min_structure_score: 55.0,
    max_spread_pct: 0.05,
    max_slippage_pct: 0.08,
    obi_top_n: 5,
    obi_buy_threshold: 0.5,
    obi_sell_threshold: -0.5,
});

pub static FX_PRESET: Lazy<AssetPreset> = Lazy::new(|| AssetPreset {
    name: "fx",
    max_cache_age_ms: 500,
    min_structure_score: 50.0,
    max_spread_pct: 0.02,
    max_slippage_pct: 0.03,
    obi_top_n: 5,
    obi_buy_threshold: 0.5,
    obi_sell_threshold: -0.5,
});

/// Multiplier applied to the structure-score / spread / slippage
/// thresholds when momentum is strong enough to justify relaxing them.
fn relaxation_multiplier(momentum_score: f64) -> f64 {
    if momentum_score > 90.0 {
        1.5
    } else if momentum_score > 80.0 {
        1.25
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub reason: String,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

fn fail(reason: &str) -> ValidationFailure {
    ValidationFailure {
        reason: reason.to_string(),
    }
}

/// Validate a prospective order against the cached order book. `quantity`
/// is the intended fill size, used for the slippage walk.
pub fn validate(
    book: &OrderBookState,
    preset: &AssetPreset,
    side: Side,
    quantity: f64,
    structure_score: f64,
    momentum_score: f64,
) -> Result<(), ValidationFailure> {
    let relax = relaxation_multiplier(momentum_score);

    // 1. Cache freshness.
    if book.age_ms() > preset.max_cache_age_ms {
        return Err(fail("l2_stale_cache"));
    }

    // 2. Structure threshold.
    if structure_score < preset.min_structure_score / relax {
        return Err(fail("l2_weak_structure"));
    }

    // 3. Depth.
    if book.depth_notional(preset.obi_top_n) <= 0.0 {
        return Err(fail("l2_empty_depth"));
    }

    // 4. Spread.
    let mid = (book.best_bid + book.best_ask) / 2.0;
    if mid <= 0.0 {
        return Err(fail("l2_invalid_mid"));
    }
    let spread_pct = (book.best_ask - book.best_bid) / mid * 100.0;
    if spread_pct > preset.max_spread_pct * relax {
        return Err(fail("l2_wide_spread"));
    }

    // 5. Slippage walk.
    let buy = side == Side::Long;
    let avg_price = book.walk(buy, quantity).ok_or_else(|| fail("l2_insufficient_depth"))?;
    let reference = if buy { book.best_ask } else { book.best_bid };
    let slippage_pct = ((avg_price - reference) / reference).abs() * 100.0;
    if slippage_pct > preset.max_slippage_pct * relax {
        return Err(fail("l2_excess_slippage"));
    }

    // 6. Order book imbalance, mirrored per side.
    let obi = book.imbalance_top_n(preset.obi_top_n);
    match side {
        Side::Long if obi < preset.obi_buy_threshold => return Err(fail("l2_obi_unfavorable")),
        Side::Short if obi > preset.obi_sell_threshold => return Err(fail("l2_obi_unfavorable")),
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fresh_book() -> OrderBookState {
        OrderBookState {
            symbol: "BTCUSDT".into(),
            best_bid: 100.0,
            best_ask: 100.05,
            bid_depth: 50.0,
            ask_depth: 50.0,
            spread_bps: 5.0,
            imbalance: 0.0,
            last_update_id: 1,
            bids: vec![(100.0, 20.0), (99.9, 20.0)],
            asks: vec![(100.05, 20.0), (100.1, 20.0)],
            received_at: Instant::now(),
        }
    }

    #[test]
    fn healthy_book_passes() {
        let book = fresh_book();
        let result = validate(&book, &CRYPTO_PRESET, Side::Long, 5.0, 70.0, 10.0);
        assert!(result.is_ok());
    }

    #[test]
    fn stale_cache_is_rejected() {
        let mut book = fresh_book();
        book.received_at = Instant::now() - std::time::Duration::from_millis(200);
        let result = validate(&book, &CRYPTO_PRESET, Side::Long, 5.0, 70.0, 10.0);
        assert_eq!(result.unwrap_err().reason, "l2_stale_cache");
    }

    #[test]
    fn wide_spread_is_rejected() {
        let mut book = fresh_book();
        book.best_ask = 105.0;
        let result = validate(&book, &CRYPTO_PRESET, Side::Long, 5.0, 70.0, 10.0);
        assert_eq!(result.unwrap_err().reason, "l2_wide_spread");
    }

    #[test]
    fn momentum_relaxes_structure_threshold() {
        let book = fresh_book();
        // structure_score of 45 fails the base 60 threshold but should pass
        // once momentum_score > 90 relaxes it by 1.5x (60/1.5 = 40).
        let result = validate(&book, &CRYPTO_PRESET, Side::Long, 5.0, 45.0, 95.0);
        assert!(result.is_ok());
    }

    #[test]
    fn weak_structure_rejected_without_momentum_relaxation() {
        let book = fresh_book();
        let result = validate(&book, &CRYPTO_PRESET, Side::Long, 5.0, 45.0, 10.0);
        assert_eq!(result.unwrap_err().reason, "l2_weak_structure");
    }

    #[test]
    fn short_with_balanced_book_rejected_on_obi() {
        let book = fresh_book();
        let result = validate(&book, &CRYPTO_PRESET, Side::Short, 5.0, 70.0, 10.0);
        assert_eq!(result.unwrap_err().reason, "l2_obi_unfavorable");
    }

    #[test]
    fn short_with_ask_heavy_book_passes_obi() {
        let mut book = fresh_book();
        book.bids = vec![(100.0, 10.0), (99.9, 10.0)];
        book.asks = vec![(100.05, 40.0), (100.1, 40.0)];
        let result = validate(&book, &CRYPTO_PRESET, Side::Short, 5.0, 70.0, 10.0);
        assert!(result.is_ok());
    }
}
