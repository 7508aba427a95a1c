// =============================================================================
// Derivatives Regime Gate — annualized funding rate classifier
//
// Re-keys the contrarian funding monitor onto the four named regimes the
// safety-gate stage checks trade direction against, each carrying its own
// `tradingAllowed.{long,short}` pair and a position-size multiplier.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeClass {
    ExtremeGreed,
    HighGreed,
    ExtremeFear,
    Neutral,
}

impl std::fmt::Display for RegimeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExtremeGreed => "EXTREME_GREED",
            Self::HighGreed => "HIGH_GREED",
            Self::ExtremeFear => "EXTREME_FEAR",
            Self::Neutral => "NEUTRAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradingAllowed {
    pub long: bool,
    pub short: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub symbol: String,
    pub funding_rate: f64,
    pub annualized_pct: f64,
    pub class: RegimeClass,
    pub trading_allowed: TradingAllowed,
    pub size_multiplier: f64,
}

fn classify(annualized_pct: f64) -> (RegimeClass, TradingAllowed, f64) {
    if annualized_pct > 100.0 {
        (
            RegimeClass::ExtremeGreed,
            TradingAllowed { long: false, short: true },
            0.25,
        )
    } else if annualized_pct > 50.0 {
        (
            RegimeClass::HighGreed,
            TradingAllowed { long: true, short: true },
            0.75,
        )
    } else if annualized_pct < -50.0 {
        (
            RegimeClass::ExtremeFear,
            TradingAllowed { long: true, short: false },
            0.5,
        )
    } else {
        (
            RegimeClass::Neutral,
            TradingAllowed { long: true, short: true },
            1.0,
        )
    }
}

pub struct DerivativesRegimeGate {
    client: reqwest::Client,
    cache: parking_lot::RwLock<std::collections::HashMap<String, RegimeSnapshot>>,
}

impl DerivativesRegimeGate {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            cache: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Last snapshot refreshed for `symbol`, if any. The pipeline's
    /// safety-gate stage reads this instead of fetching inline, so a
    /// funding-rate API outage never adds latency to order placement.
    pub fn cached(&self, symbol: &str) -> Option<RegimeSnapshot> {
        self.cache.read().get(symbol).cloned()
    }

    /// Fetch and cache the latest snapshot for `symbol`. Called from a
    /// periodic background task, not from the order path.
    pub async fn refresh(&self, symbol: &str) -> Result<RegimeSnapshot> {
        let snapshot = self.fetch(symbol).await?;
        self.cache.write().insert(symbol.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Seed the cache directly, bypassing the funding-rate API call.
    /// Pairs with `classify_rate` for exercising the regime gate without
    /// network access.
    pub fn seed_cache(&self, snapshot: RegimeSnapshot) {
        self.cache.write().insert(snapshot.symbol.clone(), snapshot);
    }

    async fn fetch(&self, symbol: &str) -> Result<RegimeSnapshot> {
        let url = format!(
            "https://fapi.binance.com/fapi/v1/fundingRate?symbol={symbol}&limit=1"
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET funding rate for {symbol}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse funding rate response")?;
        if !status.is_success() {
            anyhow::bail!("funding rate API returned {}: {}", status, body);
        }

        let entry = body
            .as_array()
            .context("funding rate response is not an array")?
            .first()
            .context("funding rate response array is empty")?;

        let rate: f64 = entry["fundingRate"]
            .as_str()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);

        Ok(Self::classify_rate(symbol, rate))
    }

    /// Pure classification step, split out so tests don't need network
    /// access: `annualized_pct = funding_rate * 3 * 365 * 100`, three
    /// funding events per day compounded simply across the year.
    pub fn classify_rate(symbol: &str, funding_rate: f64) -> RegimeSnapshot {
        let annualized_pct = funding_rate * 3.0 * 365.0 * 100.0;
        let (class, trading_allowed, size_multiplier) = classify(annualized_pct);

        debug!(symbol, annualized_pct, class = %class, "derivatives regime classified");

        RegimeSnapshot {
            symbol: symbol.to_string(),
            funding_rate,
            annualized_pct,
            class,
            trading_allowed,
            size_multiplier,
        }
    }
}

impl Default for DerivativesRegimeGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extreme_greed_blocks_longs_only() {
        let snap = DerivativesRegimeGate::classify_rate("BTCUSDT", 0.001);
        assert_eq!(snap.class, RegimeClass::ExtremeGreed);
        assert!(!snap.trading_allowed.long);
        assert!(snap.trading_allowed.short);
    }

    #[test]
    fn extreme_greed_cuts_size_to_quarter() {
        let snap = DerivativesRegimeGate::classify_rate("BTCUSDT", 0.001);
        assert_eq!(snap.size_multiplier, 0.25);
    }

    #[test]
    fn extreme_fear_blocks_shorts_only() {
        let snap = DerivativesRegimeGate::classify_rate("BTCUSDT", -0.0006);
        assert_eq!(snap.class, RegimeClass::ExtremeFear);
        assert!(snap.trading_allowed.long);
        assert!(!snap.trading_allowed.short);
    }

    #[test]
    fn neutral_allows_both_sides_full_size() {
        let snap = DerivativesRegimeGate::classify_rate("BTCUSDT", 0.00001);
        assert_eq!(snap.class, RegimeClass::Neutral);
        assert_eq!(snap.size_multiplier, 1.0);
    }

    #[test]
    fn high_greed_reduces_size() {
        let snap = DerivativesRegimeGate::classify_rate("BTCUSDT", 0.0003);
        assert_eq!(snap.class, RegimeClass::HighGreed);
        assert_eq!(snap.size_multiplier, 0.75);
    }

    #[test]
    fn cache_starts_empty_and_holds_whatever_is_inserted() {
        let gate = DerivativesRegimeGate::new();
        assert!(gate.cached("BTCUSDT").is_none());
        gate.seed_cache(DerivativesRegimeGate::classify_rate("BTCUSDT", 0.0003));
        assert_eq!(gate.cached("BTCUSDT").unwrap().class, RegimeClass::HighGreed);
    }
}
