// =============================================================================
// Paper broker adapter — synthetic local fills, no network call
//
// Grounded on the demo-mode execution path: generate a fill at whatever
// price the caller asked for and record it so `get_open_positions` /
// `close_all_positions` behave consistently for dashboards and tests.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::broker::{BrokerAdapter, BrokerError, FillReport, OrderParams};
use crate::types::Side;

#[derive(Clone)]
struct PaperPosition {
    side: Side,
    quantity: f64,
}

pub struct PaperAdapter {
    positions: Mutex<HashMap<String, PaperPosition>>,
}

impl PaperAdapter {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for PaperAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for PaperAdapter {
    async fn place_order(&self, params: &OrderParams) -> Result<FillReport, BrokerError> {
        let fill_price = params.price.unwrap_or(0.0);
        let mut positions = self.positions.lock();
        positions.insert(
            params.symbol.clone(),
            PaperPosition {
                side: params.side,
                quantity: params.quantity,
            },
        );

        Ok(FillReport {
            client_order_id: params.client_order_id.clone(),
            exchange_order_id: Uuid::new_v4().to_string(),
            fill_price,
            fill_quantity: params.quantity,
            is_maker: false,
        })
    }

    async fn cancel_order(&self, _symbol: &str, _client_order_id: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<String>, BrokerError> {
        Ok(Vec::new())
    }

    async fn get_open_positions(&self) -> Result<Vec<(String, Side, f64)>, BrokerError> {
        Ok(self
            .positions
            .lock()
            .iter()
            .map(|(symbol, pos)| (symbol.clone(), pos.side, pos.quantity))
            .collect())
    }

    async fn close_all_positions(&self) -> Result<u32, BrokerError> {
        let mut positions = self.positions.lock();
        let count = positions.len() as u32;
        positions.clear();
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OrderType;

    #[tokio::test]
    async fn place_order_records_position() {
        let adapter = PaperAdapter::new();
        let params = OrderParams {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            order_type: OrderType::Market,
            quantity: 1.0,
            price: Some(100.0),
            client_order_id: "titan_BTCUSDT_LONG_1_abcd1234".into(),
            reduce_only: false,
        };
        let fill = adapter.place_order(&params).await.unwrap();
        assert_eq!(fill.fill_quantity, 1.0);
        assert_eq!(adapter.get_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_all_positions_clears_book() {
        let adapter = PaperAdapter::new();
        let params = OrderParams {
            symbol: "ETHUSDT".into(),
            side: Side::Short,
            order_type: OrderType::Market,
            quantity: 2.0,
            price: Some(50.0),
            client_order_id: "titan_ETHUSDT_SHORT_1_abcd1234".into(),
            reduce_only: false,
        };
        adapter.place_order(&params).await.unwrap();
        let closed = adapter.close_all_positions().await.unwrap();
        assert_eq!(closed, 1);
        assert!(adapter.get_open_positions().await.unwrap().is_empty());
    }
}
