use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Action, OrderRequest, OrderResponse, OrderStatus, OrderType, PositionSide};

/// Order recorded by the local paper broker. Paper orders fill immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperOrder {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Action,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub pos_side: Option<PositionSide>,
    pub reduce_only: bool,
    pub timestamp: DateTime<Utc>,
}

impl PaperOrder {
    pub fn to_response(&self, realized_pnl: Option<f64>) -> OrderResponse {
        OrderResponse {
            id: self.order_id.clone(),
            client_order_id: self.client_order_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            amount: self.amount,
            price: Some(self.price),
            filled: self.amount,
            remaining: 0.0,
            status: self.status,
            timestamp: self.timestamp,
            pos_side: self.pos_side,
            reduce_only: self.reduce_only,
            realized_pnl,
        }
    }
}

/// In-memory fill simulator for `paper_on_real`
///
/// Never talks to the network. Ledger effects are applied by the router.
#[derive(Debug, Default)]
pub struct LocalPaperBroker {
    orders: Vec<PaperOrder>,
    order_counter: u64,
}

impl LocalPaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instant fill of `request` at `fill_price`
    pub fn create_order(&mut self, request: &OrderRequest, fill_price: f64) -> PaperOrder {
        self.order_counter += 1;
        let now = Utc::now();
        let order = PaperOrder {
            order_id: format!("paper_{}_{}", now.timestamp_millis(), self.order_counter),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: fill_price,
            status: OrderStatus::Filled,
            pos_side: request.pos_side,
            reduce_only: request.reduce_only,
            timestamp: now,
        };

        tracing::info!(
            "📝 [paper] Filled {} {} {} @ {} (id={})",
            order.side,
            order.amount,
            order.symbol,
            order.price,
            order.order_id
        );
        self.orders.push(order.clone());
        order
    }

    /// Paper orders are already filled, so there is nothing to cancel; reports success
    pub fn cancel_order(&self, order_id: &str, symbol: &str) {
        tracing::debug!("[paper] cancel {} on {} (no-op)", order_id, symbol);
    }

    pub fn orders(&self) -> &[PaperOrder] {
        &self.orders
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}
