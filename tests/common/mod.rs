//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use perpbot::candles::Timeframe;
use perpbot::error::ExchangeError;
use perpbot::exchange::{ExchangeApi, ExchangeEnvironment};
use perpbot::strategy::{Direction, Strategy, StrategyDecision};
use perpbot::{
    AccountBalance, Candle, ExchangePosition, InstrumentInfo, MarginMode, OrderRequest,
    OrderResponse, PositionMode, PositionSide, Ticker,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Market data only; any trading call is counted so tests can prove paper mode never reaches it
#[derive(Default)]
pub struct MarketDataExchange {
    pub environment: ExchangeEnvironment,
    pub instruments: Vec<InstrumentInfo>,
    pub candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub tickers: Mutex<HashMap<String, f64>>,
    pub trading_calls: AtomicUsize,
}

impl MarketDataExchange {
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

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        if let Some(last) = candles.last() {
            self.tickers.lock().unwrap().insert(symbol.to_string(), last.close);
        }
        self.candles.lock().unwrap().insert(symbol.to_string(), candles);
    }

    pub fn set_ticker(&self, symbol: &str, price: f64) {
        self.tickers.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn trading_calls(&self) -> usize {
        self.trading_calls.load(Ordering::SeqCst)
    }

    fn refuse(&self) -> ExchangeError {
        self.trading_calls.fetch_add(1, Ordering::SeqCst);
        ExchangeError::Api {
            code: "test".into(),
            message: "trading is not available on this exchange".into(),
        }
    }
}

#[async_trait]
impl ExchangeApi for MarketDataExchange {
    fn environment(&self) -> ExchangeEnvironment {
        self.environment.clone()
    }

    async fn load_markets(&self) -> Result<Vec<InstrumentInfo>, ExchangeError> {
        Ok(self.instruments.clone())
    }

    async fn fetch_ohlcv(&self, symbol: &str, _timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self.candles.lock().unwrap().get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles[skip..].to_vec())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
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
        Err(self.refuse())
    }

    async fn fetch_positions(&self, _symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Err(self.refuse())
    }

    async fn fetch_open_orders(&self, _symbol: Option<&str>) -> Result<Vec<OrderResponse>, ExchangeError> {
        Err(self.refuse())
    }

    async fn create_order(&self, _request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        Err(self.refuse())
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        Err(self.refuse())
    }

    async fn set_leverage(
        &self,
        _symbol: &str,
        _leverage: u32,
        _margin_mode: MarginMode,
        _pos_side: Option<PositionSide>,
    ) -> Result<(), ExchangeError> {
        Err(self.refuse())
    }

    async fn set_position_mode(&self, _mode: PositionMode) -> Result<(), ExchangeError> {
        Err(self.refuse())
    }

    async fn set_margin_mode(&self, _symbol: &str, _margin_mode: MarginMode, _leverage: u32) -> Result<(), ExchangeError> {
        Err(self.refuse())
    }
}

/// Emits the same direction on every evaluation
pub struct FixedDirection(pub Direction);

impl Strategy for FixedDirection {
    fn generate_signal(&self, _symbol: &str, _timeframe: Timeframe, _candles: &[Candle]) -> perpbot::Result<StrategyDecision> {
        Ok(StrategyDecision {
            direction: self.0,
            confidence: Some(0.9),
            kind: "fixed".into(),
            reason: format!("fixed {:?}", self.0),
        })
    }

    fn name(&self) -> &str {
        "fixed_direction"
    }

    fn min_candles_required(&self) -> usize {
        2
    }
}

/// `count` flat candles on `timeframe`, the last one forming now
pub fn candles_ending_now(timeframe: Timeframe, count: i64, close: f64) -> Vec<Candle> {
    let step = timeframe.duration_ms();
    let forming = timeframe.align(Utc::now().timestamp_millis());
    (0..count)
        .rev()
        .map(|i| Candle::from_row([(forming - i * step) as f64, close, close * 1.01, close * 0.99, close, 10.0]))
        .collect()
}
