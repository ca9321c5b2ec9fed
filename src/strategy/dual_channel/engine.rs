use chrono::{TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

use super::ohlcv::DualChannelOhlcv;
use super::trackers::{ConfirmedSignalTracker, IntrabarSignalTracker};
use crate::candles::{is_candle_closed, Timeframe, MAX_SIGNAL_HISTORY};
use crate::models::{Action, Candle, Signal, SignalSource};
use crate::strategy::{Strategy, StrategyDecision};

/// Which channel drives order execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Intrabar,
    Confirmed,
    Both,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Intrabar => "intrabar",
            ExecutionMode::Confirmed => "confirmed",
            ExecutionMode::Both => "both",
        }
    }

    /// Parse, falling back to `Intrabar` with a warning for unknown values
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid execution mode '{}', using 'intrabar'", s);
            ExecutionMode::Intrabar
        })
    }

    pub fn computes_intrabar(&self) -> bool {
        matches!(self, ExecutionMode::Intrabar | ExecutionMode::Both)
    }

    pub fn computes_confirmed(&self) -> bool {
        matches!(self, ExecutionMode::Confirmed | ExecutionMode::Both)
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "intrabar" => Ok(ExecutionMode::Intrabar),
            "confirmed" => Ok(ExecutionMode::Confirmed),
            "both" => Ok(ExecutionMode::Both),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one scan over one (symbol, timeframe)
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub scan_time: i64,
    pub forming_ts: i64,
    pub closed_ts: i64,
    pub intrabar_signals: Vec<Signal>,
    /// Confirmed signals left after reconciliation against this scan's intrabar signals
    pub confirmed_signals: Vec<Signal>,
    pub intrabar_fired_count: usize,
    /// New confirmed signals produced, including reconciled ones
    pub confirmed_new_count: usize,
    /// Confirmed signals dropped because an intrabar signal with the same action fired
    pub reconciled_count: usize,
}

impl ScanResult {
    fn new(data: &DualChannelOhlcv, scan_time: i64) -> Self {
        Self {
            symbol: data.symbol.clone(),
            timeframe: data.timeframe,
            scan_time,
            forming_ts: data.forming_ts(),
            closed_ts: data.closed_ts(),
            intrabar_signals: Vec::new(),
            confirmed_signals: Vec::new(),
            intrabar_fired_count: 0,
            confirmed_new_count: 0,
            reconciled_count: 0,
        }
    }

    pub fn has_signals(&self) -> bool {
        !self.intrabar_signals.is_empty() || !self.confirmed_signals.is_empty()
    }

    /// `[scan] tf=5m at=12:05:03 forming_ts=... closed_ts=... intrabar_fired=1 confirmed_new=0`
    pub fn summary_line(&self) -> String {
        let at = Utc
            .timestamp_millis_opt(self.scan_time)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| self.scan_time.to_string());
        format!(
            "[scan] {} tf={} at={} forming_ts={} closed_ts={} intrabar_fired={} confirmed_new={}",
            self.symbol,
            self.timeframe,
            at,
            self.forming_ts,
            self.closed_ts,
            self.intrabar_fired_count,
            self.confirmed_new_count
        )
    }
}

/// Runs a strategy on both the forming and the last closed candle and decides what to execute
pub struct DualChannelEngine {
    strategy: Box<dyn Strategy>,
    mode: ExecutionMode,
    intrabar: IntrabarSignalTracker,
    confirmed: ConfirmedSignalTracker,
}

impl DualChannelEngine {
    pub fn new(strategy: Box<dyn Strategy>, mode: ExecutionMode) -> Self {
        Self::with_history(strategy, mode, MAX_SIGNAL_HISTORY)
    }

    pub fn with_history(strategy: Box<dyn Strategy>, mode: ExecutionMode, max_history: usize) -> Self {
        Self {
            strategy,
            mode,
            intrabar: IntrabarSignalTracker::new(max_history),
            confirmed: ConfirmedSignalTracker::new(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        tracing::info!("Execution mode set to: {}", mode);
    }

    fn evaluate(&self, data: &DualChannelOhlcv, candles: &[Candle], channel: SignalSource) -> Option<StrategyDecision> {
        if candles.len() < self.strategy.min_candles_required() {
            tracing::debug!(
                "Insufficient data for {} signal: {}/{} ({} candles)",
                channel,
                data.symbol,
                data.timeframe,
                candles.len()
            );
            return None;
        }

        match self.strategy.generate_signal(&data.symbol, data.timeframe, candles) {
            Ok(decision) => Some(decision),
            Err(e) => {
                tracing::error!(
                    "Error calculating {} signal for {}/{}: {}",
                    channel,
                    data.symbol,
                    data.timeframe,
                    e
                );
                None
            }
        }
    }

    fn build_signal(
        data: &DualChannelOhlcv,
        decision: &StrategyDecision,
        action: Action,
        candle: Candle,
        source: SignalSource,
    ) -> Signal {
        Signal {
            symbol: data.symbol.clone(),
            timeframe: data.timeframe,
            action,
            confidence: decision.confidence,
            candle_ts: candle.open_ts,
            price: candle.close,
            reason: decision.reason.clone(),
            source,
            generated_at: Utc::now(),
        }
    }

    /// Forming-candle channel; at most one signal per forming candle
    fn calculate_intrabar_signal(&self, data: &DualChannelOhlcv, scan_time: i64) -> Option<Signal> {
        let decision = self.evaluate(data, data.candles_with_forming(), SignalSource::Intrabar)?;
        let action = decision.direction.action();
        let forming = data.forming_candle();

        match self
            .intrabar
            .try_fire(&data.symbol, data.timeframe, forming, scan_time, action.is_some())
        {
            Ok((true, _)) => {
                let action = action?;
                let signal = Self::build_signal(data, &decision, action, forming, SignalSource::Intrabar);
                tracing::info!(
                    "[trade] intrabar {} symbol={} price={:.2} forming_ts={}",
                    action,
                    signal.symbol,
                    signal.price,
                    signal.candle_ts
                );
                Some(signal)
            }
            Ok((false, reason)) => {
                tracing::debug!(symbol = %data.symbol, reason = reason.as_str(), "Intrabar signal suppressed");
                None
            }
            Err(e) => {
                tracing::error!("Intrabar tracker unavailable: {}", e);
                None
            }
        }
    }

    /// Closed-candle channel; each closed candle is evaluated once, signal or not
    fn calculate_confirmed_signal(&mut self, data: &DualChannelOhlcv, scan_time: i64) -> Option<Signal> {
        let closed_ts = data.closed_ts();
        if !self.confirmed.should_calculate(&data.symbol, data.timeframe, closed_ts) {
            return None;
        }
        if !is_candle_closed(closed_ts, data.timeframe, scan_time) {
            tracing::debug!(
                symbol = %data.symbol,
                closed_ts,
                "Second-to-last candle has not closed yet"
            );
            return None;
        }

        let candles = data.closed_candles();
        if candles.len() < self.strategy.min_candles_required() {
            self.confirmed.record_calculated(&data.symbol, data.timeframe, closed_ts);
            tracing::debug!(
                "Insufficient data for confirmed signal: {}/{} ({} candles)",
                data.symbol,
                data.timeframe,
                candles.len()
            );
            return None;
        }

        // Strategy errors leave the candle unrecorded so the next scan retries it
        let decision = self.evaluate(data, candles, SignalSource::Confirmed)?;
        self.confirmed.record_calculated(&data.symbol, data.timeframe, closed_ts);

        let action = decision.direction.action()?;
        let signal = Self::build_signal(
            data,
            &decision,
            action,
            data.last_closed_candle(),
            SignalSource::Confirmed,
        );
        tracing::info!(
            "[signal] confirmed {} symbol={} closed_ts={}",
            action,
            signal.symbol,
            closed_ts
        );
        Some(signal)
    }

    /// Run both channels (as the mode requires) over one fetch
    pub fn process_scan(&mut self, data: &DualChannelOhlcv, scan_time: i64) -> ScanResult {
        let mut result = ScanResult::new(data, scan_time);

        if self.mode.computes_intrabar() {
            if let Some(signal) = self.calculate_intrabar_signal(data, scan_time) {
                result.intrabar_signals.push(signal);
                result.intrabar_fired_count += 1;
            }
        }

        if self.mode.computes_confirmed() {
            if let Some(signal) = self.calculate_confirmed_signal(data, scan_time) {
                result.confirmed_new_count += 1;

                let duplicate = result
                    .intrabar_signals
                    .iter()
                    .any(|s| s.symbol == signal.symbol && s.action == signal.action);
                if duplicate {
                    result.reconciled_count += 1;
                    tracing::debug!(
                        symbol = %signal.symbol,
                        action = %signal.action,
                        "Confirmed signal matches intrabar signal from this scan, not re-executed"
                    );
                } else {
                    result.confirmed_signals.push(signal);
                }
            }
        }

        tracing::info!("{}", result.summary_line());
        result
    }

    /// Intrabar first (when the mode executes intrabar), then confirmed, else nothing
    pub fn get_execution_signal<'a>(&self, result: &'a ScanResult) -> Option<&'a Signal> {
        if self.mode.computes_intrabar() {
            if let Some(signal) = result.intrabar_signals.first() {
                return Some(signal);
            }
        }
        if self.mode.computes_confirmed() {
            return result.confirmed_signals.first();
        }
        None
    }

    pub fn clear_trackers(&mut self, symbol: Option<&str>, timeframe: Option<Timeframe>) {
        if let Err(e) = self.intrabar.clear(symbol, timeframe) {
            tracing::error!("Failed to clear intrabar tracker: {}", e);
        }
        self.confirmed.clear(symbol, timeframe);
    }
}
