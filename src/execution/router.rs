use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::ledger::{AccountState, PriceMap, SimulatedAccount};
use super::paper_broker::{LocalPaperBroker, PaperOrder};
use crate::error::{ConfigError, ExecutionError};
use crate::exchange::{with_retry, ExchangeApi, ExchangeEnvironment, RetryConfig};
use crate::models::{
    base_asset, Action, ExchangePosition, MarginMode, OrderRequest, OrderResponse, PositionMode,
    PositionSide,
};
use crate::persistence::PaperStore;
use crate::risk::OrderSizeCalculator;

/// Longest client order id the venue accepts
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 32;

/// Endpoint substrings that identify a non-production venue
const SANDBOX_TOKENS: &[&str] = &["sandbox", "demo", "wspap"];

/// Where orders go. Market data always comes from the real venue.
///
/// Deserializes through `RunMode::resolve`, so a loaded config holds the resolved mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum RunMode {
    /// Real orders on the real exchange
    Live,
    /// Real market data, orders filled by the local paper broker
    PaperOnReal,
}

impl RunMode {
    /// Resolve a configured run mode once, at load time.
    ///
    /// Legacy paper aliases map to `PaperOnReal` with a warning. Nothing maps to `Live`
    /// except the literal `live`.
    pub fn resolve(raw: &str) -> Result<Self, ConfigError> {
        let value = raw.trim().to_lowercase();
        match value.as_str() {
            "live" => Ok(RunMode::Live),
            "paper_on_real" => Ok(RunMode::PaperOnReal),
            "" => {
                tracing::warn!("⚠️ run_mode not set, defaulting to paper_on_real");
                Ok(RunMode::PaperOnReal)
            }
            "paper" | "sim" | "simulation" | "paper_trading" | "demo" => {
                tracing::warn!("⚠️ Legacy run_mode '{}' mapped to paper_on_real", raw.trim());
                Ok(RunMode::PaperOnReal)
            }
            _ => Err(ConfigError::ForbiddenRunMode(raw.trim().to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Live => "live",
            RunMode::PaperOnReal => "paper_on_real",
        }
    }

    pub fn is_paper(&self) -> bool {
        *self == RunMode::PaperOnReal
    }
}

impl TryFrom<String> for RunMode {
    type Error = ConfigError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        RunMode::resolve(&raw)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard startup gate: any sign of a sandbox or simulated-trading venue is fatal
pub fn check_environment(env: &ExchangeEnvironment) -> Result<(), ConfigError> {
    let mut reasons = Vec::new();

    if env.sandbox {
        reasons.push("sandbox mode is enabled on the exchange client".to_string());
    }
    if env.simulated_trading.as_deref().map(str::trim) == Some("1") {
        reasons.push("x-simulated-trading=1 is set".to_string());
    }
    for endpoint in &env.endpoints {
        let lower = endpoint.to_lowercase();
        if let Some(token) = SANDBOX_TOKENS.iter().find(|t| lower.contains(*t)) {
            reasons.push(format!("endpoint {} contains '{}'", endpoint, token));
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        for reason in &reasons {
            tracing::error!("🚨 Environment check failed: {}", reason);
        }
        Err(ConfigError::SandboxDetected(reasons))
    }
}

/// `{side initial}{base asset, 4 chars}{ms timestamp mod 1e10}{6 hex}`, alphanumeric
pub fn generate_client_order_id(symbol: &str, side: Action) -> String {
    let initial = match side {
        Action::Buy => 'b',
        Action::Sell => 's',
    };
    let base: String = base_asset(symbol)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect();
    let ts = Utc::now().timestamp_millis().rem_euclid(10_000_000_000);
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();

    let mut id = format!("{}{}{}{}", initial, base, ts, suffix);
    id.truncate(MAX_CLIENT_ORDER_ID_LEN);
    id
}

/// Paper-mode state, present only in `PaperOnReal`
struct PaperDesk {
    account: SimulatedAccount,
    broker: LocalPaperBroker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single entry point for every order-affecting call.
///
/// In `Live` the calls go to the exchange unchanged apart from client order ids and
/// close flags. In `PaperOnReal` they never touch the network.
pub struct ExecutionRouter {
    exchange: Arc<dyn ExchangeApi>,
    mode: RunMode,
    hedge_mode: bool,
    margin_mode: MarginMode,
    instruments: Arc<OrderSizeCalculator>,
    read_retry: RetryConfig,
    paper: Option<Mutex<PaperDesk>>,
    leverage_cache: Mutex<HashMap<String, u32>>,
    margin_mode_applied: Mutex<HashSet<String>>,
    position_mode_cache: Mutex<Option<PositionMode>>,
    last_prices: Mutex<PriceMap>,
}

impl ExecutionRouter {
    /// Runs the environment gate in both modes; paper mode still reads real market data
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        mode: RunMode,
        account: SimulatedAccount,
        instruments: Arc<OrderSizeCalculator>,
    ) -> Result<Self, ConfigError> {
        check_environment(&exchange.environment())?;

        let paper = match mode {
            RunMode::PaperOnReal => Some(Mutex::new(PaperDesk {
                account,
                broker: LocalPaperBroker::new(),
            })),
            RunMode::Live => None,
        };

        tracing::info!("🧭 Execution router ready: run_mode={}", mode);
        if mode == RunMode::Live {
            tracing::warn!("⚠️ LIVE mode: orders will be sent to the exchange");
        }

        Ok(Self {
            exchange,
            mode,
            hedge_mode: true,
            margin_mode: MarginMode::Cross,
            instruments,
            read_retry: RetryConfig::fast(),
            paper,
            leverage_cache: Mutex::new(HashMap::new()),
            margin_mode_applied: Mutex::new(HashSet::new()),
            position_mode_cache: Mutex::new(None),
            last_prices: Mutex::new(PriceMap::new()),
        })
    }

    pub fn with_hedge_mode(mut self, hedge_mode: bool) -> Self {
        self.hedge_mode = hedge_mode;
        self
    }

    pub fn with_margin_mode(mut self, margin_mode: MarginMode) -> Self {
        self.margin_mode = margin_mode;
        self
    }

    pub fn with_read_retry(mut self, retry: RetryConfig) -> Self {
        self.read_retry = retry;
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn hedge_mode(&self) -> bool {
        self.hedge_mode
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeApi> {
        &self.exchange
    }

    pub fn instruments(&self) -> &Arc<OrderSizeCalculator> {
        &self.instruments
    }

    pub fn read_retry(&self) -> &RetryConfig {
        &self.read_retry
    }

    pub fn record_price(&self, symbol: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            lock(&self.last_prices).insert(symbol.to_string(), price);
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        lock(&self.last_prices).get(symbol).copied()
    }

    pub fn prices(&self) -> PriceMap {
        lock(&self.last_prices).clone()
    }

    /// Last recorded price, or one ticker read
    pub async fn resolve_price(&self, symbol: &str) -> Result<f64, ExecutionError> {
        if let Some(price) = self.last_price(symbol) {
            return Ok(price);
        }
        let ticker = with_retry(&self.read_retry, || self.exchange.fetch_ticker(symbol)).await?;
        if !(ticker.last.is_finite() && ticker.last > 0.0) {
            return Err(ExecutionError::NoPrice(symbol.to_string()));
        }
        self.record_price(symbol, ticker.last);
        Ok(ticker.last)
    }

    /// Leverage used for new positions on `symbol`
    pub fn leverage_for(&self, symbol: &str) -> Option<u32> {
        lock(&self.leverage_cache).get(symbol).copied()
    }

    /// Paper account snapshot at the last recorded prices
    pub fn paper_state(&self) -> Option<AccountState> {
        let prices = self.prices();
        self.paper
            .as_ref()
            .map(|desk| lock(desk).account.get_state(&prices))
    }

    pub fn paper_status_report(&self) -> Option<String> {
        let prices = self.prices();
        self.paper
            .as_ref()
            .map(|desk| lock(desk).account.status_report(&prices))
    }

    pub fn paper_orders(&self) -> Vec<PaperOrder> {
        self.paper
            .as_ref()
            .map(|desk| lock(desk).broker.orders().to_vec())
            .unwrap_or_default()
    }

    /// Current equity: paper ledger at fresh prices, or the exchange account balance
    pub async fn equity(&self) -> Result<f64, ExecutionError> {
        match &self.paper {
            Some(desk) => {
                let prices = self.prices();
                Ok(lock(desk).account.equity(&prices))
            }
            None => {
                let balance = with_retry(&self.read_retry, || self.exchange.fetch_balance()).await?;
                Ok(balance.total_equity)
            }
        }
    }

    pub async fn has_position(&self, symbol: &str, side: PositionSide) -> Result<bool, ExecutionError> {
        let positions = self.fetch_positions(Some(symbol)).await?;
        Ok(positions
            .iter()
            .any(|p| p.side == side && p.contracts > 0.0))
    }

    /// Place an order. Never retried: a duplicate create could fill twice.
    pub async fn create_order(&self, mut request: OrderRequest) -> Result<OrderResponse, ExecutionError> {
        if !(request.amount.is_finite() && request.amount > 0.0) {
            return Err(ExecutionError::Validation(format!(
                "order amount must be positive, got {}",
                request.amount
            )));
        }
        if request.client_order_id.is_none() {
            request.client_order_id = Some(generate_client_order_id(&request.symbol, request.side));
        }

        match &self.paper {
            Some(desk) => self.paper_create_order(desk, request).await,
            None => {
                tracing::info!(
                    "🚀 Sending {} {} {} {} (posSide={:?}, reduceOnly={}, clOrdId={:?})",
                    request.order_type.as_str(),
                    request.side,
                    request.amount,
                    request.symbol,
                    request.pos_side,
                    request.reduce_only,
                    request.client_order_id
                );
                let response = self.exchange.create_order(&request).await.map_err(|e| {
                    tracing::error!("❌ Order failed for {}: {}", request.symbol, e);
                    e
                })?;
                tracing::info!("✅ Order accepted: id={} status={:?}", response.id, response.status);
                Ok(response)
            }
        }
    }

    async fn paper_create_order(
        &self,
        desk: &Mutex<PaperDesk>,
        request: OrderRequest,
    ) -> Result<OrderResponse, ExecutionError> {
        tracing::warn!(
            "[paper] blocked_real_trade op=create_order symbol={} side={} amount={} reduce_only={}",
            request.symbol,
            request.side,
            request.amount,
            request.reduce_only
        );

        let fill_price = self.resolve_price(&request.symbol).await?;
        let side = request.pos_side.unwrap_or_else(|| {
            if request.reduce_only {
                // A reduce-only buy shrinks a short, a reduce-only sell shrinks a long
                match request.side {
                    Action::Buy => PositionSide::Short,
                    Action::Sell => PositionSide::Long,
                }
            } else {
                request.side.opens()
            }
        });

        let contract_value = if request.reduce_only {
            None
        } else {
            let info = self
                .instruments
                .ensure_instrument(self.exchange.as_ref(), &request.symbol, &self.read_retry)
                .await?;
            Some(info.ct_val)
        };
        let leverage = self.leverage_for(&request.symbol);
        let prices = self.prices();

        let mut desk = lock(desk);
        let realized_pnl = match contract_value {
            None => Some(desk.account.close_position(&request.symbol, side, request.amount, fill_price, 0.0)?),
            Some(ct_val) => {
                desk.account.open_position(
                    &request.symbol,
                    side,
                    request.amount,
                    fill_price,
                    leverage,
                    ct_val,
                    &prices,
                )?;
                None
            }
        };

        let mut filled = request;
        filled.pos_side = Some(side);
        let order = desk.broker.create_order(&filled, fill_price);
        Ok(order.to_response(realized_pnl))
    }

    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExecutionError> {
        match &self.paper {
            Some(desk) => {
                tracing::warn!(
                    "[paper] blocked_real_trade op=cancel_order order_id={} symbol={}",
                    order_id,
                    symbol
                );
                lock(desk).broker.cancel_order(order_id, symbol);
                Ok(())
            }
            None => {
                self.exchange.cancel_order(order_id, symbol).await?;
                tracing::info!("🗑️ Cancelled order {} on {}", order_id, symbol);
                Ok(())
            }
        }
    }

    /// Non-zero positions; from the ledger in paper mode
    pub async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExecutionError> {
        match &self.paper {
            Some(desk) => {
                let prices = self.prices();
                let desk = lock(desk);
                Ok(desk
                    .account
                    .positions()
                    .into_iter()
                    .filter(|p| symbol.map_or(true, |s| p.symbol == s))
                    .map(|p| {
                        let price = prices.get(&p.symbol).copied().unwrap_or(p.entry_price);
                        ExchangePosition {
                            unrealized_pnl: p.unrealized_pnl_at(price),
                            symbol: p.symbol,
                            side: p.side,
                            contracts: p.qty,
                            entry_price: p.entry_price,
                            leverage: p.leverage,
                            margin_mode: self.margin_mode,
                        }
                    })
                    .collect())
            }
            None => {
                let positions =
                    with_retry(&self.read_retry, || self.exchange.fetch_positions(symbol)).await?;
                Ok(positions.into_iter().filter(|p| p.contracts > 0.0).collect())
            }
        }
    }

    /// Always empty in paper mode: paper orders fill on creation
    pub async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ExecutionError> {
        match &self.paper {
            Some(_) => Ok(Vec::new()),
            None => Ok(with_retry(&self.read_retry, || self.exchange.fetch_open_orders(symbol)).await?),
        }
    }

    /// Reduce-only market order that shrinks the `side` position by `amount` contracts
    pub async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        amount: f64,
    ) -> Result<OrderResponse, ExecutionError> {
        let action = side.closing_action().ok_or_else(|| {
            ExecutionError::Validation(format!("cannot close {} position without a side", symbol))
        })?;

        let mut request = OrderRequest::market(symbol, action, amount).reduce_only();
        if self.hedge_mode || self.paper.is_some() {
            request = request.with_pos_side(side);
        }
        tracing::info!("🔻 Closing {} {} x{} via {}", symbol, side, amount, action);
        self.create_order(request).await
    }

    /// Set leverage (and, the first time per symbol, margin mode); "already set" responses count as success
    pub async fn ensure_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExecutionError> {
        if leverage == 0 {
            return Err(ExecutionError::Validation("leverage must be at least 1".into()));
        }
        if self.leverage_for(symbol) == Some(leverage) {
            return Ok(());
        }

        if self.paper.is_none() {
            // The first call per symbol also applies the configured margin mode
            let margin_mode_applied = lock(&self.margin_mode_applied).contains(symbol);
            let outcome = if margin_mode_applied {
                self.exchange
                    .set_leverage(symbol, leverage, self.margin_mode, None)
                    .await
            } else {
                self.exchange
                    .set_margin_mode(symbol, self.margin_mode, leverage)
                    .await
            };
            match outcome {
                Ok(()) => tracing::info!(
                    "⚙️ Leverage set: {} {}x ({})",
                    symbol,
                    leverage,
                    self.margin_mode.as_str()
                ),
                Err(e) if e.is_already_set() => {
                    tracing::debug!("Leverage already {}x on {}", leverage, symbol)
                }
                Err(e) => {
                    tracing::error!("❌ Failed to set leverage {}x on {}: {}", leverage, symbol, e);
                    return Err(e.into());
                }
            }
        }

        lock(&self.margin_mode_applied).insert(symbol.to_string());
        lock(&self.leverage_cache).insert(symbol.to_string(), leverage);
        Ok(())
    }

    /// Set the account position mode once; "already set" responses count as success
    pub async fn ensure_position_mode(&self, mode: PositionMode) -> Result<(), ExecutionError> {
        if *lock(&self.position_mode_cache) == Some(mode) {
            return Ok(());
        }

        if self.paper.is_none() {
            match self.exchange.set_position_mode(mode).await {
                Ok(()) => tracing::info!("⚙️ Position mode set: {}", mode.as_okx_str()),
                Err(e) if e.is_already_set() => {
                    tracing::debug!("Position mode already {}", mode.as_okx_str())
                }
                Err(e) => {
                    tracing::error!("❌ Failed to set position mode {}: {}", mode.as_okx_str(), e);
                    return Err(e.into());
                }
            }
        }

        *lock(&self.position_mode_cache) = Some(mode);
        Ok(())
    }

    /// Restore the paper ledger from the store; no-op in live mode
    pub async fn load_paper_state(&self, store: &dyn PaperStore) -> crate::Result<()> {
        let Some(desk) = &self.paper else {
            return Ok(());
        };
        let mut account = lock(desk).account.clone();
        account.sync_from_store(store).await?;
        lock(desk).account = account;
        Ok(())
    }

    /// Save the paper ledger to the store; no-op in live mode
    pub async fn save_paper_state(&self, store: &dyn PaperStore) -> crate::Result<()> {
        let Some(desk) = &self.paper else {
            return Ok(());
        };
        let account = lock(desk).account.clone();
        let prices = self.prices();
        account.sync_to_store(store, &prices).await
    }
}
