use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::router::ExecutionRouter;
use crate::candles::Timeframe;
use crate::error::{ExecutionError, LedgerError};
use crate::exchange::with_retry;
use crate::models::{OrderRequest, PositionMode, Signal};
use crate::persistence::PaperStore;
use crate::risk::RiskControl;
use crate::strategy::{DualChannelEngine, DualChannelOhlcv};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Execute { contracts: f64, order_id: String },
    Skip,
    Reject,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub symbol: String,
    pub action: ExecutionAction,
    pub reason: String,
    pub signal: Signal,
}

impl ExecutionDecision {
    fn new(signal: &Signal, action: ExecutionAction, reason: impl Into<String>) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            action,
            reason: reason.into(),
            signal: signal.clone(),
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self.action, ExecutionAction::Execute { .. })
    }
}

/// What one scan cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub symbols_scanned: usize,
    pub signals: usize,
    pub decisions: Vec<ExecutionDecision>,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn executed_count(&self) -> usize {
        self.decisions.iter().filter(|d| d.is_executed()).count()
    }

    pub fn summary_line(&self) -> String {
        format!(
            "[cycle] scanned={} signals={} executed={} errors={}",
            self.symbols_scanned,
            self.signals,
            self.executed_count(),
            self.errors.len()
        )
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub ohlcv_limit: usize,
    /// Fraction of equity committed as margin per order
    pub risk_pct: f64,
    pub leverage: u32,
    pub hedge_mode: bool,
    /// Add to an existing same-side position on a new signal
    pub allow_pyramiding: bool,
}

/// Per-cycle pipeline: fetch, scan, gate, size, route
pub struct Executor {
    router: Arc<ExecutionRouter>,
    engine: DualChannelEngine,
    risk: RiskControl,
    store: Option<Arc<dyn PaperStore>>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        router: Arc<ExecutionRouter>,
        engine: DualChannelEngine,
        risk: RiskControl,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            router,
            engine,
            risk,
            store: None,
            settings,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PaperStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn router(&self) -> &Arc<ExecutionRouter> {
        &self.router
    }

    pub fn risk(&self) -> &RiskControl {
        &self.risk
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// One-time startup work: instruments, position mode, restored paper state
    pub async fn initialize(&mut self) -> crate::Result<()> {
        let exchange = self.router.exchange().clone();
        self.router
            .instruments()
            .load_instruments(exchange.as_ref(), self.router.read_retry())
            .await?;

        let mode = if self.settings.hedge_mode {
            PositionMode::Hedge
        } else {
            PositionMode::Net
        };
        self.router.ensure_position_mode(mode).await?;

        if let Some(store) = &self.store {
            self.router.load_paper_state(store.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let started_at = Utc::now();
        let mut report = CycleReport {
            started_at,
            symbols_scanned: 0,
            signals: 0,
            decisions: Vec::new(),
            errors: Vec::new(),
        };

        self.risk.reset_if_new_day(started_at);

        let symbols = self.settings.symbols.clone();
        for symbol in &symbols {
            let signal = match self.scan_symbol(symbol, started_at.timestamp_millis()).await {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!("⚠️ Scan failed for {}: {}", symbol, e);
                    report.errors.push(format!("{}: {}", symbol, e));
                    continue;
                }
            };
            report.symbols_scanned += 1;

            let Some(signal) = signal else {
                continue;
            };
            report.signals += 1;

            match self.process_signal(&signal).await {
                Ok(decision) => {
                    tracing::info!(
                        "📋 {} {} -> {:?}: {}",
                        decision.symbol,
                        signal.action,
                        decision.action,
                        decision.reason
                    );
                    report.decisions.push(decision);
                }
                Err(e) => {
                    tracing::error!("❌ Execution failed for {}: {}", symbol, e);
                    report.errors.push(format!("{}: {}", symbol, e));
                }
            }
        }

        if report.executed_count() > 0 {
            if let Some(store) = &self.store {
                if let Err(e) = self.router.save_paper_state(store.as_ref()).await {
                    tracing::warn!("⚠️ Failed to save paper state: {}", e);
                    report.errors.push(format!("paper store: {}", e));
                }
            }
        }

        tracing::info!("{}", report.summary_line());
        report
    }

    /// Fetch candles for `symbol`, record its last price and return the signal to execute, if any
    pub async fn scan_symbol(&mut self, symbol: &str, scan_time: i64) -> Result<Option<Signal>, ExecutionError> {
        let exchange = self.router.exchange().clone();
        let timeframe = self.settings.timeframe;
        let limit = self.settings.ohlcv_limit;

        let candles = with_retry(self.router.read_retry(), || {
            exchange.fetch_ohlcv(symbol, timeframe, limit)
        })
        .await?;
        if let Some(last) = candles.last() {
            self.router.record_price(symbol, last.close);
        }

        let data = DualChannelOhlcv::from_candles(symbol, timeframe, candles, scan_time)?;
        let result = self.engine.process_scan(&data, scan_time);
        Ok(self.engine.get_execution_signal(&result).cloned())
    }

    /// Turn a signal into an order, or into the reason it was not placed
    pub async fn process_signal(&mut self, signal: &Signal) -> Result<ExecutionDecision, ExecutionError> {
        let symbol = signal.symbol.as_str();
        let side = signal.action.opens();

        // Check 1: daily loss limit against fresh equity
        let equity = self.router.equity().await?;
        if let Err(reason) = self.risk.can_trade(equity) {
            return Ok(ExecutionDecision::new(signal, ExecutionAction::Skip, reason));
        }

        // Check 2: one position per side unless pyramiding
        if !self.settings.allow_pyramiding && self.router.has_position(symbol, side).await? {
            return Ok(ExecutionDecision::new(
                signal,
                ExecutionAction::Skip,
                format!("Already have open {} position", side),
            ));
        }

        // Check 3: size
        let exchange = self.router.exchange().clone();
        self.router
            .instruments()
            .ensure_instrument(exchange.as_ref(), symbol, self.router.read_retry())
            .await?;
        self.router.ensure_leverage(symbol, self.settings.leverage).await?;
        let price = self.router.resolve_price(symbol).await?;

        let size = self.router.instruments().calculate(
            symbol,
            equity,
            self.settings.risk_pct,
            self.settings.leverage,
            price,
        );
        if !size.is_valid {
            return Ok(ExecutionDecision::new(
                signal,
                ExecutionAction::Reject,
                size.error.unwrap_or_else(|| "order size rejected".to_string()),
            ));
        }

        // Check 4: order notional limit
        let validation = self.risk.validate_order(size.notional, symbol);
        if !validation.is_valid {
            return Ok(ExecutionDecision::new(
                signal,
                ExecutionAction::Reject,
                validation.error_message.unwrap_or_default(),
            ));
        }

        let mut request = OrderRequest::market(symbol, signal.action, size.contracts);
        if self.settings.hedge_mode {
            request = request.with_pos_side(side);
        }

        match self.router.create_order(request).await {
            Ok(order) => {
                if let Some(pnl) = order.realized_pnl {
                    self.risk.record_trade_pnl(pnl);
                }
                Ok(ExecutionDecision::new(
                    signal,
                    ExecutionAction::Execute {
                        contracts: order.filled,
                        order_id: order.id,
                    },
                    format!("{} signal, {} contracts", signal.source, size.contracts),
                ))
            }
            Err(ExecutionError::Ledger(e @ (LedgerError::InsufficientFreeMargin { .. }
            | LedgerError::MarginRatioExceeded { .. }))) => Ok(ExecutionDecision::new(
                signal,
                ExecutionAction::Reject,
                e.to_string(),
            )),
            Err(e) => Err(e),
        }
    }
}
