// =============================================================================
// Safety Gates — the pipeline's chained pre-trade checks
//
// Evaluated in a fixed order: Circuit Breaker -> Liquidation Detector ->
// Rate Limiter -> Derivatives Regime. The first veto short-circuits the
// chain; the rate limiter's check is cooperative (it waits) rather than
// rejecting, since request throughput is not itself a trading decision.
// =============================================================================

pub mod circuit_breaker;
pub mod derivatives_regime;
pub mod liquidation_detector;
pub mod rate_limiter;

use crate::types::Side;
use circuit_breaker::CircuitBreaker;
use derivatives_regime::{DerivativesRegimeGate, RegimeSnapshot};
use liquidation_detector::LiquidationDetector;
use rate_limiter::RateLimiter;

pub struct SafetyGates {
    pub circuit_breaker: CircuitBreaker,
    pub liquidation_detector: LiquidationDetector,
    pub rate_limiter: RateLimiter,
    pub derivatives_regime: DerivativesRegimeGate,
}

impl SafetyGates {
    pub fn new(
        capital: f64,
        max_daily_loss_pct: f64,
        max_consecutive_losses: u32,
        max_drawdown_pct: f64,
        max_daily_trades: u32,
        requests_per_sec: u32,
    ) -> Self {
        Self {
            circuit_breaker: CircuitBreaker::new(
                capital,
                max_daily_loss_pct,
                max_consecutive_losses,
                max_drawdown_pct,
                max_daily_trades,
            ),
            liquidation_detector: LiquidationDetector::new(),
            rate_limiter: RateLimiter::new(requests_per_sec),
            derivatives_regime: DerivativesRegimeGate::new(),
        }
    }

    /// Run the non-cooperative gates (circuit breaker, liquidation
    /// detector) that can veto outright, then cooperatively throttle
    /// against the rate limiter before allowing the caller to proceed to
    /// the network call. The regime gate's veto depends on intent side so
    /// it is checked separately by the caller against a fetched
    /// `RegimeSnapshot`.
    pub async fn check_pretrade(&self, symbol: &str) -> Result<(), String> {
        self.circuit_breaker.check()?;
        self.liquidation_detector.check(symbol)?;
        self.rate_limiter.throttle().await;
        Ok(())
    }

    pub fn check_regime(&self, snapshot: &RegimeSnapshot, side: Side) -> Result<f64, String> {
        let allowed = match side {
            Side::Long => snapshot.trading_allowed.long,
            Side::Short => snapshot.trading_allowed.short,
        };
        if allowed {
            Ok(snapshot.size_multiplier)
        } else {
            Err(format!("derivatives_regime_{}", snapshot.class))
        }
    }
}
