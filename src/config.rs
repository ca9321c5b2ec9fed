//! Configuration for perpbot
//!
//! Defaults, then optional `config/default` and `config/local` files (or an explicit path),
//! then `PERPBOT__*` environment overrides.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::candles::Timeframe;
use crate::error::ConfigError;
use crate::exchange::okx::{OkxConfig, OKX_API_BASE};
use crate::execution::executor::ExecutorSettings;
use crate::execution::ledger::{DEFAULT_INITIAL_BALANCE, DEFAULT_LEVERAGE, DEFAULT_MAX_MARGIN_RATIO};
use crate::execution::router::RunMode;
use crate::models::MarginMode;
use crate::risk::RiskLimits;
use crate::strategy::dual_channel::ExecutionMode;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Resolved from `live`, `paper_on_real` or a legacy paper alias while loading
    pub run_mode: RunMode,
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub paper: PaperConfig,
}

#[derive(Clone, Deserialize)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    pub simulated_trading: String,
    pub sandbox: bool,
    pub requests_per_second: u32,
}

// Keeps credentials out of logs
impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("simulated_trading", &self.simulated_trading)
            .field("sandbox", &self.sandbox)
            .field("requests_per_second", &self.requests_per_second)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub timeframe: String,
    /// `intrabar`, `confirmed` or `both`
    pub execution_mode: String,
    pub ohlcv_limit: usize,
    /// Fraction of equity used as margin per order
    pub risk_pct: f64,
    pub default_leverage: u32,
    pub margin_mode: String,
    pub hedge_mode: bool,
    pub allow_pyramiding: bool,
    /// Delay after each candle boundary before scanning
    pub scan_offset_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub max_order_size: f64,
    pub daily_loss_limit_pct: f64,
    pub enable_order_validation: bool,
    pub enable_daily_loss_limit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    pub initial_balance: f64,
    pub max_margin_ratio: f64,
    /// Empty keeps paper state in memory only
    pub redis_url: String,
    pub redis_prefix: String,
}

impl AppConfig {
    /// Builder pre-populated with every default
    fn defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        Config::builder()
            .set_default("run_mode", "paper_on_real")?
            // Exchange defaults
            .set_default("exchange.base_url", OKX_API_BASE)?
            .set_default("exchange.api_key", "")?
            .set_default("exchange.api_secret", "")?
            .set_default("exchange.api_passphrase", "")?
            .set_default("exchange.simulated_trading", "0")?
            .set_default("exchange.sandbox", false)?
            .set_default("exchange.requests_per_second", 10)?
            // Trading defaults
            .set_default("trading.symbols", vec!["BTC-USDT-SWAP", "ETH-USDT-SWAP"])?
            .set_default("trading.timeframe", "5m")?
            .set_default("trading.execution_mode", "intrabar")?
            .set_default("trading.ohlcv_limit", 100)?
            .set_default("trading.risk_pct", 0.02)?
            .set_default("trading.default_leverage", DEFAULT_LEVERAGE as i64)?
            .set_default("trading.margin_mode", "cross")?
            .set_default("trading.hedge_mode", true)?
            .set_default("trading.allow_pyramiding", false)?
            .set_default("trading.scan_offset_secs", 5)?
            // Risk defaults
            .set_default("risk.max_order_size", 1000.0)?
            .set_default("risk.daily_loss_limit_pct", 0.10)?
            .set_default("risk.enable_order_validation", true)?
            .set_default("risk.enable_daily_loss_limit", true)?
            // Paper defaults
            .set_default("paper.initial_balance", DEFAULT_INITIAL_BALANCE)?
            .set_default("paper.max_margin_ratio", DEFAULT_MAX_MARGIN_RATIO)?
            .set_default("paper.redis_url", "")?
            .set_default("paper.redis_prefix", "perpbot:paper")
    }

    /// Load and validate. `path` replaces the `config/default` + `config/local` lookup.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;
        builder = match path {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder
                .add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name("config/local").required(false)),
        };
        // Override with environment variables (PERPBOT__TRADING__TIMEFRAME=15m)
        let config = builder
            .add_source(Environment::with_prefix("PERPBOT").prefix_separator("__").separator("__"))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeframe = self.timeframe()?;
        self.margin_mode()?;

        if self.trading.symbols.is_empty() {
            return Err(ConfigError::Invalid("trading.symbols is empty".into()));
        }
        if !(self.trading.risk_pct > 0.0 && self.trading.risk_pct <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "trading.risk_pct must be in (0, 1], got {}",
                self.trading.risk_pct
            )));
        }
        if self.trading.default_leverage == 0 {
            return Err(ConfigError::Invalid("trading.default_leverage must be >= 1".into()));
        }
        if self.trading.ohlcv_limit < 2 {
            return Err(ConfigError::Invalid("trading.ohlcv_limit must be >= 2".into()));
        }
        if self.paper.initial_balance <= 0.0 {
            return Err(ConfigError::Invalid("paper.initial_balance must be positive".into()));
        }
        if !(self.paper.max_margin_ratio > 0.0 && self.paper.max_margin_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "paper.max_margin_ratio must be in (0, 1], got {}",
                self.paper.max_margin_ratio
            )));
        }
        if self.risk.max_order_size <= 0.0 {
            return Err(ConfigError::Invalid("risk.max_order_size must be positive".into()));
        }
        if !(self.risk.daily_loss_limit_pct > 0.0 && self.risk.daily_loss_limit_pct <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "risk.daily_loss_limit_pct must be in (0, 1], got {}",
                self.risk.daily_loss_limit_pct
            )));
        }
        let offset_ms = self.trading.scan_offset_secs.saturating_mul(1000);
        if offset_ms >= timeframe.duration_ms() as u64 {
            return Err(ConfigError::Invalid(format!(
                "trading.scan_offset_secs must be shorter than the {} timeframe, got {}s",
                timeframe, self.trading.scan_offset_secs
            )));
        }
        Ok(())
    }

    pub fn timeframe(&self) -> Result<Timeframe, ConfigError> {
        self.trading
            .timeframe
            .parse::<Timeframe>()
            .map_err(|e| ConfigError::Invalid(format!("trading.timeframe: {}", e)))
    }

    pub fn margin_mode(&self) -> Result<MarginMode, ConfigError> {
        match self.trading.margin_mode.trim().to_lowercase().as_str() {
            "cross" => Ok(MarginMode::Cross),
            "isolated" => Ok(MarginMode::Isolated),
            other => Err(ConfigError::Invalid(format!("trading.margin_mode '{}'", other))),
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::parse_or_default(&self.trading.execution_mode)
    }

    pub fn scan_offset(&self) -> Duration {
        Duration::from_secs(self.trading.scan_offset_secs)
    }

    pub fn okx_config(&self) -> Result<OkxConfig, ConfigError> {
        Ok(OkxConfig {
            base_url: self.exchange.base_url.clone(),
            api_key: self.exchange.api_key.clone(),
            api_secret: self.exchange.api_secret.clone(),
            api_passphrase: self.exchange.api_passphrase.clone(),
            simulated_trading: self.exchange.simulated_trading.clone(),
            sandbox: self.exchange.sandbox,
            requests_per_second: self.exchange.requests_per_second,
            margin_mode: self.margin_mode()?,
        })
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_order_size: self.risk.max_order_size,
            daily_loss_limit_pct: self.risk.daily_loss_limit_pct,
            enable_order_validation: self.risk.enable_order_validation,
            enable_daily_loss_limit: self.risk.enable_daily_loss_limit,
        }
    }

    pub fn executor_settings(&self) -> Result<ExecutorSettings, ConfigError> {
        Ok(ExecutorSettings {
            symbols: self.trading.symbols.clone(),
            timeframe: self.timeframe()?,
            ohlcv_limit: self.trading.ohlcv_limit,
            risk_pct: self.trading.risk_pct,
            leverage: self.trading.default_leverage,
            hedge_mode: self.trading.hedge_mode,
            allow_pyramiding: self.trading.allow_pyramiding,
        })
    }

    /// One-line summary without secrets, for the startup log
    pub fn digest(&self) -> String {
        format!(
            "run_mode={} symbols={:?} timeframe={} execution_mode={} risk_pct={} leverage={}x hedge={}",
            self.run_mode,
            self.trading.symbols,
            self.trading.timeframe,
            self.trading.execution_mode,
            self.trading.risk_pct,
            self.trading.default_leverage,
            self.trading.hedge_mode
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
