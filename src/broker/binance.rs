// =============================================================================
// Binance spot `BrokerAdapter` implementation
//
// HMAC-SHA256 signed REST plumbing: sign the query string, stamp a
// recvWindow, read back the response envelope. The retry and idempotency
// behavior live one layer up in `BrokerGateway`, so this adapter only
// has to worry about talking to the exchange.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, instrument, warn};

use crate::broker::{BrokerAdapter, BrokerError, FillReport, OrderParams, OrderType};
use crate::heartbeat::Heartbeat;
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
/// Binance listenKeys expire 60 minutes after the last keepalive; renew
/// well inside that window.
const USER_STREAM_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Confirm the configured credentials actually authenticate before
    /// they are accepted into the live configuration.
    #[instrument(skip(self), name = "binance_adapter::test_connection")]
    pub async fn test_connection(&self) -> Result<(), BrokerError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::classify(&e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BrokerError::Permanent(format!(
                "authentication check failed: {}",
                resp.status()
            )))
        }
    }

    /// Open a user-data-stream listenKey. Unlike every other endpoint this
    /// adapter calls, it needs only the API-key header, no HMAC signature.
    #[instrument(skip(self), name = "binance_adapter::start_user_stream")]
    async fn start_user_stream(&self) -> Result<String, BrokerError> {
        let url = format!("{}/api/v3/userDataStream", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| BrokerError::classify(&e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Permanent(format!("malformed userDataStream response: {e}")))?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Permanent(format!("no listenKey in response: {body}")))
    }

    /// Extend a listenKey's 60-minute expiry window.
    #[instrument(skip(self, listen_key), name = "binance_adapter::keepalive_user_stream")]
    async fn keepalive_user_stream(&self, listen_key: &str) -> Result<(), BrokerError> {
        let url = format!(
            "{}/api/v3/userDataStream?listenKey={}",
            self.base_url, listen_key
        );
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| BrokerError::classify(&e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BrokerError::classify(&resp.text().await.unwrap_or_default()))
        }
    }
}

/// Connect to the Binance user-data-stream WebSocket for `adapter`'s
/// listenKey, recording a heartbeat beat on every message received so the
/// dead-man's-switch has a live connectivity signal independent of order
/// placement. Runs until the stream disconnects or errors, then returns
/// so the caller can reconnect; mirrors `market_data::orderbook::run_depth_stream`'s
/// reconnect-on-return shape.
pub async fn run_user_stream(adapter: Arc<BinanceAdapter>, heartbeat: Arc<Heartbeat>) -> Result<()> {
    let listen_key = adapter
        .start_user_stream()
        .await
        .map_err(|e| anyhow::anyhow!("failed to open user data stream: {e}"))?;
    info!("user data stream listenKey acquired");

    let keepalive_handle = {
        let adapter = adapter.clone();
        let listen_key = listen_key.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(USER_STREAM_KEEPALIVE_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = adapter.keepalive_user_stream(&listen_key).await {
                    warn!(error = %e, "user data stream keepalive failed");
                }
            }
        })
    };

    let url = format!("wss://stream.binance.com:9443/ws/{listen_key}");
    let result = async {
        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to user data stream WebSocket")?;
        info!("user data stream WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(_msg)) => {
                    heartbeat.record_beat();
                }
                Some(Err(e)) => {
                    warn!(error = %e, "user data stream WebSocket read error");
                    return Err(anyhow::Error::from(e));
                }
                None => {
                    warn!("user data stream WebSocket ended");
                    return Ok(());
                }
            }
        }
    }
    .await;

    keepalive_handle.abort();
    result
}

#[async_trait]
impl BrokerAdapter for BinanceAdapter {
    #[instrument(skip(self, params), name = "binance_adapter::place_order")]
    async fn place_order(&self, params: &OrderParams) -> Result<FillReport, BrokerError> {
        let side_str = match params.side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let type_str = match params.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };

        let mut query = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            params.symbol, side_str, type_str, params.quantity, params.client_order_id
        );
        if let Some(price) = params.price {
            query.push_str(&format!("&price={price}&timeInForce=GTC"));
        }
        if params.reduce_only {
            query.push_str("&reduceOnly=true");
        }

        let qs = self.signed_query(&query);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| BrokerError::classify(&e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Permanent(format!("malformed order response: {e}")))?;

        if !status.is_success() {
            if status.as_u16() == 429 || status.as_u16() == 418 {
                return Err(BrokerError::Transient(format!("rate_limit: {body}")));
            }
            return Err(BrokerError::classify(&body.to_string()));
        }

        let fill_price = body["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| params.price)
            .unwrap_or(0.0);

        debug!(symbol = %params.symbol, "order placed");
        Ok(FillReport {
            client_order_id: params.client_order_id.clone(),
            exchange_order_id: body["orderId"].to_string(),
            fill_price,
            fill_quantity: params.quantity,
            is_maker: matches!(params.order_type, OrderType::Limit),
        })
    }

    #[instrument(skip(self), name = "binance_adapter::cancel_order")]
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), BrokerError> {
        let params = format!("symbol={symbol}&origClientOrderId={client_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BrokerError::classify(&e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            warn!(symbol, client_order_id, body, "cancel_order failed");
            Err(BrokerError::classify(&body))
        }
    }

    #[instrument(skip(self), name = "binance_adapter::get_open_orders")]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<String>, BrokerError> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::classify(&e.to_string()))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Permanent(format!("malformed openOrders response: {e}")))?;

        let orders = body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|o| o["clientOrderId"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(orders)
    }

    #[instrument(skip(self), name = "binance_adapter::get_open_positions")]
    async fn get_open_positions(&self) -> Result<Vec<(String, Side, f64)>, BrokerError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::classify(&e.to_string()))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Permanent(format!("malformed account response: {e}")))?;

        let balances = body["balances"].as_array().cloned().unwrap_or_default();
        let positions = balances
            .into_iter()
            .filter_map(|b| {
                let asset = b["asset"].as_str()?.to_string();
                let free: f64 = b["free"].as_str()?.parse().ok()?;
                if free > 0.0 {
                    Some((format!("{asset}USDT"), Side::Long, free))
                } else {
                    None
                }
            })
            .collect();
        Ok(positions)
    }

    #[instrument(skip(self), name = "binance_adapter::close_all_positions")]
    async fn close_all_positions(&self) -> Result<u32, BrokerError> {
        let positions = self.get_open_positions().await?;
        let mut closed = 0u32;
        for (symbol, side, quantity) in positions {
            let opposite = match side {
                Side::Long => Side::Short,
                Side::Short => Side::Long,
            };
            let params = OrderParams {
                symbol: symbol.clone(),
                side: opposite,
                order_type: OrderType::Market,
                quantity,
                price: None,
                client_order_id: format!("titan_flatten_{symbol}_{}", Self::timestamp_ms()),
                reduce_only: true,
            };
            match self.place_order(&params).await {
                Ok(_) => closed += 1,
                Err(err) => warn!(symbol, %err, "failed to flatten position"),
            }
        }
        Ok(closed)
    }

    fn name(&self) -> &'static str {
        "binance"
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
