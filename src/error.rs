use thiserror::Error;

use crate::models::PositionSide;

/// Startup-blocking configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("forbidden run mode '{0}': only 'live' and 'paper_on_real' are allowed")]
    ForbiddenRunMode(String),

    #[error("sandbox environment detected: {}", .0.join("; "))]
    SandboxDetected(Vec<String>),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Errors returned by the exchange adapter
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by exchange")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("exchange rejected request [{code}]: {message}")]
    Api { code: String, message: String },

    #[error("failed to decode exchange response: {0}")]
    Decode(String),

    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),
}

/// OKX error codes meaning "system busy / try again"
const TRANSIENT_API_CODES: &[&str] = &["50001", "50004", "50011", "50013"];

/// OKX error code returned when leverage or position mode is unchanged
const ALREADY_SET_CODE: &str = "50019";

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Network(_) | ExchangeError::RateLimited { .. } | ExchangeError::Timeout => {
                true
            }
            ExchangeError::Api { code, .. } => TRANSIENT_API_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Errors that must never be retried, even by a caller that retries everything else
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Auth(_))
    }

    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }

    /// True when the exchange refused a settings change because the value is already in effect
    pub fn is_already_set(&self) -> bool {
        match self {
            ExchangeError::Api { code, message } => {
                let lower = message.to_lowercase();
                code == ALREADY_SET_CODE || lower.contains("already") || lower.contains("same")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

/// Simulated ledger rejections; the ledger is never mutated when one is returned
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("insufficient free margin: required {required:.4}, free {free:.4}")]
    InsufficientFreeMargin { required: f64, free: f64 },

    #[error("margin ratio limit exceeded: used {projected:.4} would exceed limit {limit:.4}")]
    MarginRatioExceeded { projected: f64, limit: f64 },

    #[error("no {side} position for {symbol}")]
    PositionNotFound { symbol: String, side: PositionSide },

    #[error("close quantity {requested} exceeds held quantity {held}")]
    CloseExceedsPosition { requested: f64, held: f64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// OHLCV input problems
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("need at least {needed} candles for {symbol}, got {got}")]
    InsufficientCandles {
        symbol: String,
        needed: usize,
        got: usize,
    },

    #[error("unknown timeframe: {0}")]
    UnknownTimeframe(String),
}

/// Failures surfaced by the execution router and the scan pipeline
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Validation(String),

    #[error("no usable price for {0}")]
    NoPrice(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
