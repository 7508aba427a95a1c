// =============================================================================
// Order Book Manager — Real-time orderbook aggregation
//
// Expanded from an aggregate-only cache into one that also keeps the raw
// (price, qty) levels the L2 validator needs for a slippage walk and an
// order-book-imbalance-over-top-N calculation — the aggregate fields alone
// only support a freshness/spread check.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

/// Manages orderbook state for multiple symbols.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBookState>>,
}

/// Orderbook state for a single symbol. `received_at` is not serialized —
/// it exists purely for the cache-freshness check and would be meaningless
/// once round-tripped through JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookState {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub spread_bps: f64,
    pub imbalance: f64,
    pub last_update_id: u64,
    /// Descending-price bid levels, best first.
    pub bids: Vec<(f64, f64)>,
    /// Ascending-price ask levels, best first.
    pub asks: Vec<(f64, f64)>,
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
}

impl OrderBookState {
    pub fn age_ms(&self) -> u64 {
        self.received_at.elapsed().as_millis() as u64
    }

    /// Sum of price*qty across the top `n` bid and ask levels combined.
    pub fn depth_notional(&self, n: usize) -> f64 {
        self.bids
            .iter()
            .take(n)
            .chain(self.asks.iter().take(n))
            .map(|(price, qty)| price * qty)
            .sum()
    }

    /// Order book imbalance over the top `n` levels:
    /// `(bid_qty - ask_qty) / (bid_qty + ask_qty)`.
    pub fn imbalance_top_n(&self, n: usize) -> f64 {
        let bid_qty: f64 = self.bids.iter().take(n).map(|(_, q)| q).sum();
        let ask_qty: f64 = self.asks.iter().take(n).map(|(_, q)| q).sum();
        let total = bid_qty + ask_qty;
        if total > 0.0 {
            (bid_qty - ask_qty) / total
        } else {
            0.0
        }
    }

    /// Simulate consuming `quantity` by walking the book on `side`
    /// (true = buy/walk the ask side) and return the volume-weighted
    /// average fill price, or `None` if depth is insufficient.
    pub fn walk(&self, buy: bool, quantity: f64) -> Option<f64> {
        let levels = if buy { &self.asks } else { &self.bids };
        let mut remaining = quantity;
        let mut notional = 0.0;
        for (price, qty) in levels {
            let take = remaining.min(*qty);
            notional += take * price;
            remaining -= take;
            if remaining <= 0.0 {
                return Some(notional / quantity);
            }
        }
        None
    }
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Update the orderbook state for a symbol from full per-level data.
    pub fn update_levels(
        &self,
        symbol: &str,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
        update_id: u64,
    ) {
        let best_bid = bids.first().map(|(p, _)| *p).unwrap_or(0.0);
        let best_ask = asks.first().map(|(p, _)| *p).unwrap_or(0.0);
        let bid_depth: f64 = bids.iter().map(|(_, q)| q).sum();
        let ask_depth: f64 = asks.iter().map(|(_, q)| q).sum();

        let mid = (best_bid + best_ask) / 2.0;
        let spread_bps = if mid > 0.0 {
            ((best_ask - best_bid) / mid) * 10_000.0
        } else {
            0.0
        };

        let total_depth = bid_depth + ask_depth;
        let imbalance = if total_depth > 0.0 {
            (bid_depth - ask_depth) / total_depth
        } else {
            0.0
        };

        let state = OrderBookState {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            bid_depth,
            ask_depth,
            spread_bps,
            imbalance,
            last_update_id: update_id,
            bids,
            asks,
            received_at: Instant::now(),
        };

        self.books.write().insert(symbol.to_string(), state);
    }

    pub fn get(&self, symbol: &str) -> Option<OrderBookState> {
        self.books.read().get(symbol).cloned()
    }

    pub fn spread_bps(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|s| s.spread_bps)
    }

    pub fn imbalance(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|s| s.imbalance)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Depth WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the Binance partial depth WebSocket stream for a single symbol
/// and feed orderbook updates into `manager`. Runs until the stream
/// disconnects or errors, then returns so the caller can reconnect.
pub async fn run_depth_stream(symbol: &str, manager: &Arc<OrderBookManager>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@depth20@100ms");
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(&text) {
                        Ok((bids, asks, update_id)) => {
                            manager.update_levels(symbol, bids, asks, update_id);
                        }
                        Err(e) => warn!(error = %e, "failed to parse depth message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance partial-depth message into ordered (price, qty) levels.
fn parse_depth_message(text: &str) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>, u64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let update_id = root["lastUpdateId"]
        .as_u64()
        .context("missing field lastUpdateId")?;

    let parse_levels = |arr: &serde_json::Value| -> Vec<(f64, f64)> {
        arr.as_array()
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|level| {
                        let price: f64 = level.get(0)?.as_str()?.parse().ok()?;
                        let qty: f64 = level.get(1)?.as_str()?.parse().ok()?;
                        Some((price, qty))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let bids = parse_levels(&root["bids"]);
    let asks = parse_levels(&root["asks"]);

    Ok((bids, asks, update_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBookState {
        OrderBookState {
            symbol: "BTCUSDT".into(),
            best_bid: 100.0,
            best_ask: 100.2,
            bid_depth: 10.0,
            ask_depth: 8.0,
            spread_bps: 20.0,
            imbalance: 0.1,
            last_update_id: 1,
            bids: vec![(100.0, 5.0), (99.9, 5.0)],
            asks: vec![(100.2, 4.0), (100.3, 4.0)],
            received_at: Instant::now(),
        }
    }

    #[test]
    fn walk_returns_none_when_depth_insufficient() {
        let b = book();
        assert!(b.walk(true, 100.0).is_none());
    }

    #[test]
    fn walk_computes_volume_weighted_price() {
        let b = book();
        let avg = b.walk(true, 4.0).unwrap();
        assert!((avg - 100.2).abs() < 1e-9);
    }

    #[test]
    fn imbalance_top_n_matches_manual_calc() {
        let b = book();
        let imb = b.imbalance_top_n(2);
        assert!((imb - (10.0 - 8.0) / 18.0).abs() < 1e-9);
    }

    #[test]
    fn update_levels_computes_aggregates() {
        let manager = OrderBookManager::new();
        manager.update_levels(
            "ETHUSDT",
            vec![(50.0, 2.0)],
            vec![(50.1, 3.0)],
            7,
        );
        let state = manager.get("ETHUSDT").unwrap();
        assert_eq!(state.best_bid, 50.0);
        assert_eq!(state.best_ask, 50.1);
        assert!(state.spread_bps > 0.0);
    }
}
