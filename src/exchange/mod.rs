// Exchange access module
#[cfg(test)]
pub(crate) mod fake;
pub mod okx;
pub mod retry;

use async_trait::async_trait;

use crate::candles::Timeframe;
use crate::error::ExchangeError;
use crate::models::{
    AccountBalance, Candle, ExchangePosition, InstrumentInfo, MarginMode, OrderRequest,
    OrderResponse, PositionMode, PositionSide, Ticker,
};

pub use okx::OkxClient;
pub use retry::{with_retry, RetryConfig};

/// What the client knows about the venue it talks to; inspected by the startup safety gate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeEnvironment {
    pub sandbox: bool,
    /// Value of the simulated-trading header sent with every request, if any
    pub simulated_trading: Option<String>,
    /// Every base URL / endpoint the client is configured with
    pub endpoints: Vec<String>,
}

/// Typed exchange operations used by the trading core
///
/// Implementations decode venue responses into the model types before returning.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    fn environment(&self) -> ExchangeEnvironment;

    /// Contract metadata for every tradable swap
    async fn load_markets(&self) -> Result<Vec<InstrumentInfo>, ExchangeError>;

    /// Candles oldest first; the last row may be forming
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError>;

    async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ExchangeError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
        pos_side: Option<PositionSide>,
    ) -> Result<(), ExchangeError>;

    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), ExchangeError>;

    async fn set_margin_mode(
        &self,
        symbol: &str,
        margin_mode: MarginMode,
        leverage: u32,
    ) -> Result<(), ExchangeError>;
}
