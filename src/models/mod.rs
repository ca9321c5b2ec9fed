use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::candles::Timeframe;

/// One OHLCV bar, identified by its open timestamp (ms)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Build from a feed row `[open_ts_ms, open, high, low, close, volume]`
    pub fn from_row(row: [f64; 6]) -> Self {
        Self {
            open_ts: row[0] as i64,
            open: row[1],
            high: row[2],
            low: row[3],
            close: row[4],
            volume: row[5],
        }
    }

    pub fn close_ts(&self, timeframe: Timeframe) -> i64 {
        self.open_ts + timeframe.duration_ms()
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
        }
    }

    /// Position side opened by this action
    pub fn opens(&self) -> PositionSide {
        match self {
            Action::Buy => PositionSide::Long,
            Action::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which channel produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Intrabar,
    Confirmed,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSource::Intrabar => f.write_str("intrabar"),
            SignalSource::Confirmed => f.write_str("confirmed"),
        }
    }
}

/// A deduplicated, executable trading signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub action: Action,
    pub confidence: Option<f64>,
    pub candle_ts: i64,
    pub price: f64,
    pub reason: String,
    pub source: SignalSource,
    pub generated_at: DateTime<Utc>,
}

/// Position side in hedge mode. `None` is what net-mode exchanges report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    None,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
            PositionSide::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            "none" | "net" | "" => Some(PositionSide::None),
            _ => None,
        }
    }

    /// Order side that reduces a position on this side
    pub fn closing_action(&self) -> Option<Action> {
        match self {
            PositionSide::Long => Some(Action::Sell),
            PositionSide::Short => Some(Action::Buy),
            PositionSide::None => None,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
        }
    }
}

/// Hedge (long/short) or one-way (net) position mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMode {
    Hedge,
    Net,
}

impl PositionMode {
    pub fn as_okx_str(&self) -> &'static str {
        match self {
            PositionMode::Hedge => "long_short_mode",
            PositionMode::Net => "net_mode",
        }
    }
}

/// Composite `(symbol, timeframe)` key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

/// Composite `(symbol, side)` key; one position per symbol per side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
        }
    }
}

/// Position as reported by the exchange (or the paper ledger)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub contracts: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub unrealized_pnl: f64,
}

/// Contract metadata used for sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    /// Base-asset amount per contract
    pub ct_val: f64,
    pub lot_sz: f64,
    pub min_sz: f64,
    pub tick_sz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Action,
    pub order_type: OrderType,
    /// Quantity in contracts
    pub amount: f64,
    pub price: Option<f64>,
    pub pos_side: Option<PositionSide>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Action, amount: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            pos_side: None,
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn with_pos_side(mut self, pos_side: PositionSide) -> Self {
        self.pos_side = Some(pos_side);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Order result; identical in shape for live and paper fills
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Action,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub filled: f64,
    pub remaining: f64,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub pos_side: Option<PositionSide>,
    pub reduce_only: bool,
    /// Realized PnL attributed to this fill, when known
    pub realized_pnl: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// USDT account summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_equity: f64,
    pub available: f64,
}

/// Convert a unified symbol (`BTC/USDT:USDT`) into an exchange instrument id (`BTC-USDT-SWAP`).
/// Already-normalized ids pass through unchanged.
pub fn normalize_symbol(symbol: &str) -> String {
    let symbol = symbol.trim().to_uppercase();
    if let Some((pair, settle)) = symbol.split_once(':') {
        if let Some((base, quote)) = pair.split_once('/') {
            if quote == settle {
                return format!("{}-{}-SWAP", base, quote);
            }
        }
    }
    if let Some((base, quote)) = symbol.split_once('/') {
        return format!("{}-{}-SWAP", base, quote);
    }
    symbol
}

/// Base asset of a symbol in either notation
pub fn base_asset(symbol: &str) -> String {
    let normalized = normalize_symbol(symbol);
    normalized
        .split('-')
        .next()
        .unwrap_or_default()
        .to_string()
}
