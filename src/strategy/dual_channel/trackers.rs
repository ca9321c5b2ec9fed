use crate::candles::{CandleClosureTracker, CandleSignalTracker, Timeframe, TriggerReason};
use crate::models::Candle;

/// Forming-candle dedup: one intrabar signal per (symbol, timeframe, forming candle)
#[derive(Clone, Default)]
pub struct IntrabarSignalTracker {
    inner: CandleSignalTracker,
}

impl IntrabarSignalTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: CandleSignalTracker::new(max_history),
        }
    }

    /// Fire-and-record for the forming candle. Returns whether the signal may be emitted.
    pub fn try_fire(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        forming: Candle,
        now: i64,
        signal_detected: bool,
    ) -> Result<(bool, TriggerReason), String> {
        let (fired, _, reason) =
            self.inner
                .should_trigger_signal(symbol, timeframe, &[forming], now, signal_detected)?;
        Ok((fired, reason))
    }

    pub fn has_fired(&self, symbol: &str, timeframe: Timeframe, forming_ts: i64) -> Result<bool, String> {
        self.inner.has_signal_triggered(symbol, timeframe, forming_ts)
    }

    pub fn fired_count(&self) -> Result<usize, String> {
        self.inner.triggered_count()
    }

    pub fn clear(&self, symbol: Option<&str>, timeframe: Option<Timeframe>) -> Result<(), String> {
        self.inner.clear(symbol, timeframe)
    }
}

/// Closed-candle dedup: each closed candle is evaluated once
#[derive(Default)]
pub struct ConfirmedSignalTracker {
    inner: CandleClosureTracker,
}

impl ConfirmedSignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff `closed_ts` is newer than the last evaluated closed candle
    pub fn should_calculate(&self, symbol: &str, timeframe: Timeframe, closed_ts: i64) -> bool {
        let last = self.inner.last_closed_ts(symbol, timeframe);
        if last != 0 && closed_ts < last {
            tracing::warn!(
                symbol,
                timeframe = %timeframe,
                closed_ts,
                last_confirmed = last,
                "Closed candle is older than the last evaluated one, skipping"
            );
            return false;
        }
        self.inner.has_new_closed_candle(symbol, timeframe, closed_ts)
    }

    pub fn record_calculated(&mut self, symbol: &str, timeframe: Timeframe, closed_ts: i64) {
        self.inner.update_last_closed(symbol, timeframe, closed_ts);
    }

    pub fn last_confirmed_ts(&self, symbol: &str, timeframe: Timeframe) -> i64 {
        self.inner.last_closed_ts(symbol, timeframe)
    }

    pub fn clear(&mut self, symbol: Option<&str>, timeframe: Option<Timeframe>) {
        self.inner.clear(symbol, timeframe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_704_067_200_000;

    fn forming(open_ts: i64) -> Candle {
        Candle {
            open_ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }
    }

    #[test]
    fn test_intrabar_fires_once_per_forming_candle() {
        let tracker = IntrabarSignalTracker::default();
        let now = T0 + 1_000;

        let (fired, reason) = tracker.try_fire("BTC", Timeframe::M5, forming(T0), now, true).unwrap();
        assert!(fired);
        assert_eq!(reason, TriggerReason::NewSignal);

        let (fired, reason) = tracker.try_fire("BTC", Timeframe::M5, forming(T0), now + 5, true).unwrap();
        assert!(!fired);
        assert_eq!(reason, TriggerReason::AlreadyTriggered);

        assert!(tracker.has_fired("BTC", Timeframe::M5, T0).unwrap());
        assert_eq!(tracker.fired_count().unwrap(), 1);
    }

    #[test]
    fn test_confirmed_blocks_same_and_older() {
        let mut tracker = ConfirmedSignalTracker::new();
        assert!(tracker.should_calculate("BTC", Timeframe::M5, T0));

        tracker.record_calculated("BTC", Timeframe::M5, T0);
        assert!(!tracker.should_calculate("BTC", Timeframe::M5, T0));
        assert!(!tracker.should_calculate("BTC", Timeframe::M5, T0 - 300_000));
        assert!(tracker.should_calculate("BTC", Timeframe::M5, T0 + 300_000));
        assert_eq!(tracker.last_confirmed_ts("BTC", Timeframe::M5), T0);

        tracker.clear(None, None);
        assert!(tracker.should_calculate("BTC", Timeframe::M5, T0 - 300_000));
    }
}
