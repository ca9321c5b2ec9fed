use std::collections::HashMap;

use crate::candles::Timeframe;
use crate::models::{Candle, SeriesKey};

/// Why `should_calculate_signal` did or did not ask for a recalculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureReason {
    NoClosedCandles,
    NoNewCandle,
    NewCandle,
}

impl ClosureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosureReason::NoClosedCandles => "no_closed_candles",
            ClosureReason::NoNewCandle => "no_new_candle",
            ClosureReason::NewCandle => "new_candle",
        }
    }
}

/// True once `server_time` has reached the candle's close boundary (inclusive)
pub fn is_candle_closed(open_ts: i64, timeframe: Timeframe, server_time: i64) -> bool {
    server_time >= open_ts + timeframe.duration_ms()
}

/// Candles from `ohlcv` that are closed at `server_time`, in feed order
pub fn get_closed_candles(ohlcv: &[Candle], timeframe: Timeframe, server_time: i64) -> Vec<Candle> {
    ohlcv
        .iter()
        .filter(|c| is_candle_closed(c.open_ts, timeframe, server_time))
        .copied()
        .collect()
}

/// Most recent closed candle, if any
pub fn latest_closed_candle(
    ohlcv: &[Candle],
    timeframe: Timeframe,
    server_time: i64,
) -> Option<Candle> {
    ohlcv
        .iter()
        .rev()
        .find(|c| is_candle_closed(c.open_ts, timeframe, server_time))
        .copied()
}

/// Last-closed-candle bookkeeping per (symbol, timeframe)
///
/// Recorded timestamps only move forward; an attempt to record an older candle is
/// ignored until the key is cleared.
#[derive(Debug, Default)]
pub struct CandleClosureTracker {
    last_closed: HashMap<SeriesKey, i64>,
}

impl CandleClosureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only: true iff nothing is recorded yet or `candle_ts` is newer
    pub fn has_new_closed_candle(&self, symbol: &str, timeframe: Timeframe, candle_ts: i64) -> bool {
        match self.last_closed.get(&SeriesKey::new(symbol, timeframe)) {
            Some(&last) => candle_ts > last,
            None => true,
        }
    }

    /// Record `candle_ts` as the last processed closed candle.
    ///
    /// Returns false (and leaves state untouched) when `candle_ts` is older than the record.
    pub fn update_last_closed(&mut self, symbol: &str, timeframe: Timeframe, candle_ts: i64) -> bool {
        let key = SeriesKey::new(symbol, timeframe);
        match self.last_closed.get(&key) {
            Some(&last) if candle_ts < last => {
                tracing::warn!(
                    symbol,
                    timeframe = %timeframe,
                    candle_ts,
                    last_closed = last,
                    "Ignoring closed candle older than the recorded one"
                );
                false
            }
            _ => {
                self.last_closed.insert(key, candle_ts);
                true
            }
        }
    }

    /// Last recorded closed candle, 0 when none
    pub fn last_closed_ts(&self, symbol: &str, timeframe: Timeframe) -> i64 {
        self.last_closed
            .get(&SeriesKey::new(symbol, timeframe))
            .copied()
            .unwrap_or(0)
    }

    /// Decide whether a confirmed-candle computation should run.
    ///
    /// Does not record anything; callers record after acting on the candle.
    pub fn should_calculate_signal(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        ohlcv: &[Candle],
        server_time: i64,
    ) -> (bool, Option<Candle>, ClosureReason) {
        let Some(latest) = latest_closed_candle(ohlcv, timeframe, server_time) else {
            return (false, None, ClosureReason::NoClosedCandles);
        };

        if self.has_new_closed_candle(symbol, timeframe, latest.open_ts) {
            (true, Some(latest), ClosureReason::NewCandle)
        } else {
            (false, Some(latest), ClosureReason::NoNewCandle)
        }
    }

    /// Reset state. `None` for either argument matches everything.
    pub fn clear(&mut self, symbol: Option<&str>, timeframe: Option<Timeframe>) {
        self.last_closed.retain(|key, _| {
            let symbol_match = symbol.map_or(true, |s| key.symbol == s);
            let tf_match = timeframe.map_or(true, |tf| key.timeframe == tf);
            !(symbol_match && tf_match)
        });
    }

    pub fn tracked_count(&self) -> usize {
        self.last_closed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_704_067_200_000;
    const FIVE_MIN: i64 = 300_000;

    fn create_test_candle(open_ts: i64, price: f64) -> Candle {
        Candle {
            open_ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
        }
    }

    #[test]
    fn test_closed_is_inclusive_at_boundary() {
        assert!(!is_candle_closed(T0, Timeframe::M5, T0));
        assert!(!is_candle_closed(T0, Timeframe::M5, T0 + FIVE_MIN - 1));
        assert!(is_candle_closed(T0, Timeframe::M5, T0 + FIVE_MIN));
        assert!(is_candle_closed(T0, Timeframe::M5, T0 + FIVE_MIN + 1));
    }

    #[test]
    fn test_closed_matches_definition_across_timeframes() {
        for tf in Timeframe::ALL {
            for offset in [-1, 0, 1, 17_000] {
                let server_time = T0 + tf.duration_ms() + offset;
                assert_eq!(
                    is_candle_closed(T0, tf, server_time),
                    server_time >= T0 + tf.duration_ms()
                );
            }
        }
    }

    #[test]
    fn test_get_closed_candles_excludes_forming_row() {
        let ohlcv: Vec<Candle> = (0..4)
            .map(|i| create_test_candle(T0 + i * FIVE_MIN, 100.0 + i as f64))
            .collect();
        // Inside the fourth candle
        let now = T0 + 3 * FIVE_MIN + 1_000;

        let closed = get_closed_candles(&ohlcv, Timeframe::M5, now);
        assert_eq!(closed.len(), 3);
        assert_eq!(closed.last().unwrap().open_ts, T0 + 2 * FIVE_MIN);

        // Once the boundary passes the last row is included
        let closed = get_closed_candles(&ohlcv, Timeframe::M5, T0 + 4 * FIVE_MIN);
        assert_eq!(closed.len(), 4);
    }

    #[test]
    fn test_new_candle_sequence() {
        let mut tracker = CandleClosureTracker::new();
        let ts1 = T0;
        let ts2 = T0 + FIVE_MIN;

        assert!(tracker.has_new_closed_candle("BTC-USDT-SWAP", Timeframe::M5, ts1));
        // Reading does not mutate
        assert!(tracker.has_new_closed_candle("BTC-USDT-SWAP", Timeframe::M5, ts1));

        tracker.update_last_closed("BTC-USDT-SWAP", Timeframe::M5, ts1);
        assert!(!tracker.has_new_closed_candle("BTC-USDT-SWAP", Timeframe::M5, ts1));
        assert!(tracker.has_new_closed_candle("BTC-USDT-SWAP", Timeframe::M5, ts2));

        // Other timeframe is independent
        assert!(tracker.has_new_closed_candle("BTC-USDT-SWAP", Timeframe::M15, ts1));
    }

    #[test]
    fn test_update_is_monotonic() {
        let mut tracker = CandleClosureTracker::new();
        assert!(tracker.update_last_closed("ETH-USDT-SWAP", Timeframe::H1, T0 + 3_600_000));
        assert!(!tracker.update_last_closed("ETH-USDT-SWAP", Timeframe::H1, T0));
        assert_eq!(tracker.last_closed_ts("ETH-USDT-SWAP", Timeframe::H1), T0 + 3_600_000);
        assert_eq!(tracker.last_closed_ts("ETH-USDT-SWAP", Timeframe::M1), 0);
    }

    #[test]
    fn test_should_calculate_signal_reasons() {
        let mut tracker = CandleClosureTracker::new();
        let ohlcv = vec![
            create_test_candle(T0, 100.0),
            create_test_candle(T0 + FIVE_MIN, 101.0),
        ];

        // Only the first candle has started; nothing closed
        let (go, candle, reason) =
            tracker.should_calculate_signal("BTC", Timeframe::M5, &ohlcv[..1], T0 + 10);
        assert!(!go);
        assert!(candle.is_none());
        assert_eq!(reason, ClosureReason::NoClosedCandles);

        let now = T0 + FIVE_MIN + 10;
        let (go, candle, reason) = tracker.should_calculate_signal("BTC", Timeframe::M5, &ohlcv, now);
        assert!(go);
        assert_eq!(candle.unwrap().open_ts, T0);
        assert_eq!(reason.as_str(), "new_candle");

        tracker.update_last_closed("BTC", Timeframe::M5, T0);
        let (go, _, reason) = tracker.should_calculate_signal("BTC", Timeframe::M5, &ohlcv, now);
        assert!(!go);
        assert_eq!(reason, ClosureReason::NoNewCandle);
    }

    #[test]
    fn test_clear_scopes() {
        let mut tracker = CandleClosureTracker::new();
        tracker.update_last_closed("BTC", Timeframe::M5, T0);
        tracker.update_last_closed("BTC", Timeframe::H1, T0);
        tracker.update_last_closed("ETH", Timeframe::M5, T0);

        tracker.clear(Some("BTC"), Some(Timeframe::M5));
        assert_eq!(tracker.tracked_count(), 2);
        assert!(tracker.has_new_closed_candle("BTC", Timeframe::M5, T0));

        tracker.clear(Some("BTC"), None);
        assert_eq!(tracker.tracked_count(), 1);

        tracker.clear(None, None);
        assert_eq!(tracker.tracked_count(), 0);
    }
}
