//! In-memory exchange used by unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{ExchangeApi, ExchangeEnvironment};
use crate::candles::Timeframe;
use crate::error::ExchangeError;
use crate::models::{
    AccountBalance, Candle, ExchangePosition, InstrumentInfo, MarginMode, OrderRequest,
    OrderResponse, OrderStatus, PositionMode, PositionSide, Ticker,
};

#[derive(Default)]
pub struct FakeExchange {
    pub environment: ExchangeEnvironment,
    pub instruments: Vec<InstrumentInfo>,
    pub tickers: Mutex<HashMap<String, f64>>,
    pub candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub positions: Mutex<Vec<ExchangePosition>>,
    pub open_orders: Mutex<Vec<OrderResponse>>,
    pub balance: Mutex<Option<AccountBalance>>,
    pub created: Mutex<Vec<OrderRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub leverage_calls: AtomicUsize,
    pub position_mode_calls: AtomicUsize,
    /// Margin modes requested through `set_margin_mode`, in call order
    pub margin_mode_calls: Mutex<Vec<MarginMode>>,
    pub ticker_calls: AtomicUsize,
    /// Error returned by every `set_leverage` / `set_position_mode` call
    pub settings_error: Mutex<Option<ExchangeError>>,
    pub fail_positions: AtomicBool,
    pub fail_cancel: AtomicBool,
    pub fail_create_for: Mutex<HashSet<String>>,
    /// Positions are reduced by reduce-only fills unless set
    pub ignore_closes: AtomicBool,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instrument(mut self, symbol: &str, ct_val: f64, lot_sz: f64, min_sz: f64) -> Self {
        self.instruments.push(InstrumentInfo {
            symbol: symbol.to_string(),
            ct_val,
            lot_sz,
            min_sz,
            tick_sz: 0.1,
        });
        self
    }

    pub fn set_ticker(&self, symbol: &str, price: f64) {
        self.tickers.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.lock().unwrap().insert(symbol.to_string(), candles);
    }

    pub fn add_position(&self, symbol: &str, side: PositionSide, contracts: f64, entry_price: f64) {
        self.positions.lock().unwrap().push(ExchangePosition {
            symbol: symbol.to_string(),
            side,
            contracts,
            entry_price,
            leverage: 10,
            margin_mode: MarginMode::Cross,
            unrealized_pnl: 0.0,
        });
    }

    pub fn network_order_calls(&self) -> usize {
        self.created.lock().unwrap().len() + self.cancelled.lock().unwrap().len()
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    fn environment(&self) -> ExchangeEnvironment {
        self.environment.clone()
    }

    async fn load_markets(&self) -> Result<Vec<InstrumentInfo>, ExchangeError> {
        Ok(self.instruments.clone())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self.candles.lock().unwrap();
        let series = candles
            .get(symbol)
            .ok_or_else(|| ExchangeError::UnknownInstrument(symbol.to_string()))?;
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        let last = self
            .tickers
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownInstrument(symbol.to_string()))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: None,
            ask: None,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError> {
        self.balance
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ExchangeError::Decode("no balance".into()))
    }

    async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
        if self.fail_positions.load(Ordering::SeqCst) {
            return Err(ExchangeError::Network("positions endpoint down".into()));
        }
        Ok(self
            .positions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ExchangeError> {
        Ok(self
            .open_orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        self.created.lock().unwrap().push(request.clone());
        if self.fail_create_for.lock().unwrap().contains(&request.symbol) {
            return Err(ExchangeError::Api {
                code: "51000".into(),
                message: "order rejected".into(),
            });
        }

        if request.reduce_only && !self.ignore_closes.load(Ordering::SeqCst) {
            let mut positions = self.positions.lock().unwrap();
            for p in positions.iter_mut() {
                let matches_side = request.pos_side.map_or(true, |side| side == p.side);
                if p.symbol == request.symbol && matches_side {
                    p.contracts = (p.contracts - request.amount).max(0.0);
                }
            }
            positions.retain(|p| p.contracts > 0.0);
        }

        let count = self.created.lock().unwrap().len();
        Ok(OrderResponse {
            id: format!("fake-{}", count),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            filled: request.amount,
            remaining: 0.0,
            status: OrderStatus::Filled,
            timestamp: Utc::now(),
            pos_side: request.pos_side,
            reduce_only: request.reduce_only,
            realized_pnl: None,
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(ExchangeError::Network("cancel failed".into()));
        }
        self.cancelled.lock().unwrap().push(order_id.to_string());
        self.open_orders.lock().unwrap().retain(|o| o.id != order_id);
        Ok(())
    }

    async fn set_leverage(
        &self,
        _symbol: &str,
        _leverage: u32,
        _margin_mode: MarginMode,
        _pos_side: Option<PositionSide>,
    ) -> Result<(), ExchangeError> {
        self.leverage_calls.fetch_add(1, Ordering::SeqCst);
        match self.settings_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn set_position_mode(&self, _mode: PositionMode) -> Result<(), ExchangeError> {
        self.position_mode_calls.fetch_add(1, Ordering::SeqCst);
        match self.settings_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn set_margin_mode(
        &self,
        _symbol: &str,
        margin_mode: MarginMode,
        _leverage: u32,
    ) -> Result<(), ExchangeError> {
        self.margin_mode_calls.lock().unwrap().push(margin_mode);
        match self.settings_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
