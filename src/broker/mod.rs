// =============================================================================
// Broker Gateway — capability interface + idempotency/retry wrapping
//
// `BrokerAdapter` is the capability interface a concrete venue integration
// implements (per the redesign flag replacing runtime polymorphism over an
// ad hoc client object). `BrokerGateway` wraps whichever adapter is
// configured with the idempotency cache, retry classification, and timeout
// handling the order manager stage of the pipeline needs — none of that
// logic is duplicated per-adapter.
// =============================================================================

pub mod binance;
pub mod paper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::types::Side;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrderParams {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub client_order_id: String,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct FillReport {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub fill_price: f64,
    pub fill_quantity: f64,
    pub is_maker: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("permanent broker error: {0}")]
    Permanent(String),
}

impl BrokerError {
    /// Classify a raw error message the way a broker-agnostic gateway has
    /// to: by matching known transient causes, not by trusting a typed
    /// error the adapter itself may not have been able to construct
    /// (e.g. a raw reqwest timeout).
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        const RETRYABLE_NEEDLES: &[&str] = &[
            "etimedout",
            "econnreset",
            "econnrefused",
            "rate_limit",
            "ratelimit",
            "rate limit",
            "timeout",
            "timed out",
        ];
        if RETRYABLE_NEEDLES.iter().any(|needle| lower.contains(needle)) {
            Self::Transient(message.to_string())
        } else {
            Self::Permanent(message.to_string())
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Capability interface a venue integration implements. Kept intentionally
/// narrow — the gateway, not the adapter, owns retries, idempotency, and
/// timeouts.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(&self, params: &OrderParams) -> Result<FillReport, BrokerError>;
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), BrokerError>;
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<String>, BrokerError>;
    async fn get_open_positions(&self) -> Result<Vec<(String, Side, f64)>, BrokerError>;
    async fn close_all_positions(&self) -> Result<u32, BrokerError>;
    fn name(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

struct CacheEntry {
    fill: FillReport,
    inserted_at: Instant,
}

/// Wraps a `BrokerAdapter` with per-signal idempotency (at-most-once
/// execution per `signal_id`) and linear-backoff retry on transient
/// errors.
pub struct BrokerGateway {
    adapter: Arc<dyn BrokerAdapter>,
    idempotency: Mutex<HashMap<String, CacheEntry>>,
    retry: RetryConfig,
}

impl BrokerGateway {
    pub fn new(adapter: Arc<dyn BrokerAdapter>, retry: RetryConfig) -> Self {
        Self {
            adapter,
            idempotency: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Deterministic idempotency key: SHA-256(signal_id) truncated to 32
    /// hex characters.
    pub fn idempotency_key(signal_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(signal_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..32].to_string()
    }

    pub fn generate_client_order_id(symbol: &str, side: Side) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..8)
                .map(|_| {
                    let n: u8 = rng.gen_range(0..16);
                    std::char::from_digit(n as u32, 16).unwrap()
                })
                .collect()
        };
        format!("titan_{symbol}_{side}_{now}_{suffix}")
    }

    fn sweep_expired(&self, cache: &mut HashMap<String, CacheEntry>) {
        let now = Instant::now();
        cache.retain(|_, entry| now.duration_since(entry.inserted_at) < IDEMPOTENCY_TTL);
    }

    /// Returns the previously-recorded fill if `signal_id` was already
    /// executed within the TTL window, without placing a new order.
    pub fn check_idempotent(&self, signal_id: &str) -> Option<FillReport> {
        let key = Self::idempotency_key(signal_id);
        self.lookup(&key)
    }

    fn lookup(&self, key: &str) -> Option<FillReport> {
        let mut cache = self.idempotency.lock();
        self.sweep_expired(&mut cache);
        cache.get(key).map(|e| e.fill.clone())
    }

    #[instrument(skip(self, params), name = "broker_gateway::execute")]
    pub async fn execute(
        &self,
        signal_id: &str,
        params: OrderParams,
    ) -> Result<FillReport, BrokerError> {
        let key = Self::idempotency_key(signal_id);

        if let Some(fill) = self.lookup(&key) {
            info!(
                symbol = %params.symbol,
                client_order_id = %fill.client_order_id,
                "idempotent replay — returning cached fill without placing a new order"
            );
            return Ok(fill);
        }

        let mut attempt = 0u32;
        loop {
            let result =
                tokio::time::timeout(self.retry.timeout, self.adapter.place_order(&params)).await;

            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(BrokerError::Transient("broker request timed out".into())),
            };

            match outcome {
                Ok(fill) => {
                    let mut cache = self.idempotency.lock();
                    self.sweep_expired(&mut cache);
                    cache.insert(
                        key,
                        CacheEntry {
                            fill: fill.clone(),
                            inserted_at: Instant::now(),
                        },
                    );
                    info!(
                        symbol = %params.symbol,
                        client_order_id = %fill.client_order_id,
                        "order filled"
                    );
                    return Ok(fill);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.timeout * attempt;
                    warn!(
                        symbol = %params.symbol,
                        attempt,
                        error = %err,
                        "retrying after transient broker error"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), BrokerError> {
        self.adapter.cancel_order(symbol, client_order_id).await
    }

    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<String>, BrokerError> {
        self.adapter.get_open_orders(symbol).await
    }

    pub async fn get_open_positions(&self) -> Result<Vec<(String, Side, f64)>, BrokerError> {
        self.adapter.get_open_positions().await
    }

    pub async fn close_all_positions(&self) -> Result<u32, BrokerError> {
        self.adapter.close_all_positions().await
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic_and_truncated() {
        let a = BrokerGateway::idempotency_key("sig-123");
        let b = BrokerGateway::idempotency_key("sig-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn idempotency_key_differs_per_signal() {
        let a = BrokerGateway::idempotency_key("sig-1");
        let b = BrokerGateway::idempotency_key("sig-2");
        assert_ne!(a, b);
    }

    #[test]
    fn client_order_id_matches_expected_format() {
        let id = BrokerGateway::generate_client_order_id("BTCUSDT", Side::Long);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "titan");
        assert_eq!(parts[1], "BTCUSDT");
        assert_eq!(parts[2], "LONG");
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[4].len(), 8);
    }

    #[tokio::test]
    async fn execute_replays_cached_fill_for_repeated_signal() {
        let gateway = BrokerGateway::new(
            Arc::new(crate::broker::paper::PaperAdapter::new()),
            RetryConfig::default(),
        );
        let params = OrderParams {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            order_type: OrderType::Market,
            quantity: 1.0,
            price: Some(100.0),
            client_order_id: BrokerGateway::generate_client_order_id("BTCUSDT", Side::Long),
            reduce_only: false,
        };
        let first = gateway.execute("sig-dup", params.clone()).await.unwrap();
        let second = gateway.execute("sig-dup", params).await.unwrap();
        assert_eq!(first.exchange_order_id, second.exchange_order_id);
    }

    #[tokio::test]
    async fn check_idempotent_returns_none_before_execution() {
        let gateway = BrokerGateway::new(
            Arc::new(crate::broker::paper::PaperAdapter::new()),
            RetryConfig::default(),
        );
        assert!(gateway.check_idempotent("sig-never-run").is_none());
    }

    #[test]
    fn classify_retryable_errors() {
        assert!(BrokerError::classify("ETIMEDOUT").is_retryable());
        assert!(BrokerError::classify("connection reset: ECONNRESET").is_retryable());
        assert!(BrokerError::classify("rate limit exceeded").is_retryable());
        assert!(!BrokerError::classify("insufficient balance").is_retryable());
    }
}
