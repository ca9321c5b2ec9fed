// Signal generation module
pub mod dual_channel;
pub mod ema_cross;

use serde::{Deserialize, Serialize};

use crate::candles::Timeframe;
use crate::models::{Action, Candle};
use crate::Result;

pub use dual_channel::{
    DualChannelEngine, DualChannelOhlcv, ExecutionMode, ScanResult, ConfirmedSignalTracker,
    IntrabarSignalTracker,
};
pub use ema_cross::EmaCrossStrategy;

/// Raw directional view produced by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Hold,
}

impl Direction {
    /// Order side for an actionable direction
    pub fn action(&self) -> Option<Action> {
        match self {
            Direction::Long => Some(Action::Buy),
            Direction::Short => Some(Action::Sell),
            Direction::Hold => None,
        }
    }
}

/// Strategy output for one (symbol, timeframe) evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub direction: Direction,
    pub confidence: Option<f64>,
    pub kind: String,
    pub reason: String,
}

impl StrategyDecision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            direction: Direction::Hold,
            confidence: None,
            kind: "hold".to_string(),
            reason: reason.into(),
        }
    }
}

/// Base trait for all signal-producing strategies
pub trait Strategy: Send + Sync {
    /// Evaluate candles (oldest first) and return a directional decision
    fn generate_signal(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<StrategyDecision>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}
