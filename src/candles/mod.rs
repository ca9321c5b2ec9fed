// Candle boundary tracking module
pub mod closure_tracker;
pub mod signal_tracker;
pub mod timeframe;

pub use closure_tracker::{
    get_closed_candles, is_candle_closed, latest_closed_candle, CandleClosureTracker, ClosureReason,
};
pub use signal_tracker::{get_current_candle, CandleSignalTracker, TriggerReason, MAX_SIGNAL_HISTORY};
pub use timeframe::Timeframe;
