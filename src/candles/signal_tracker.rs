use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::candles::Timeframe;
use crate::models::{Candle, SeriesKey};

/// Default cap on remembered (symbol, timeframe, candle) triggers
pub const MAX_SIGNAL_HISTORY: usize = 100;

/// Outcome of `should_trigger_signal`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    NewSignal,
    AlreadyTriggered,
    NoSignal,
    NoCurrentCandle,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::NewSignal => "new_signal",
            TriggerReason::AlreadyTriggered => "already_triggered",
            TriggerReason::NoSignal => "no_signal",
            TriggerReason::NoCurrentCandle => "no_current_candle",
        }
    }
}

type SignalKey = (SeriesKey, i64);

#[derive(Debug)]
struct TriggerHistory {
    triggered: HashSet<SignalKey>,
    insertion_order: VecDeque<SignalKey>,
    max_history: usize,
}

impl TriggerHistory {
    fn record(&mut self, key: SignalKey) {
        if !self.triggered.insert(key.clone()) {
            return;
        }
        self.insertion_order.push_back(key);

        // Evict oldest inserted, regardless of candle recency
        while self.insertion_order.len() > self.max_history {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.triggered.remove(&oldest);
            }
        }
    }
}

/// Candle the feed is currently inside at `now`.
///
/// Searches newest first. When no row contains `now` (feed lagging behind the clock) the
/// last row is used.
pub fn get_current_candle(ohlcv: &[Candle], timeframe: Timeframe, now: i64) -> Option<Candle> {
    let duration = timeframe.duration_ms();
    ohlcv
        .iter()
        .rev()
        .find(|c| c.open_ts <= now && now < c.open_ts + duration)
        .or_else(|| ohlcv.last())
        .copied()
}

/// Thread-safe dedup of "a signal already fired for this forming candle"
///
/// Cloning shares the underlying history. Check and record happen under one lock so two
/// callers cannot both fire for the same candle.
#[derive(Clone)]
pub struct CandleSignalTracker {
    history: Arc<Mutex<TriggerHistory>>,
}

impl Default for CandleSignalTracker {
    fn default() -> Self {
        Self::new(MAX_SIGNAL_HISTORY)
    }
}

impl CandleSignalTracker {
    /// # Arguments
    /// * `max_history` - Maximum number of trigger records kept (FIFO eviction)
    pub fn new(max_history: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(TriggerHistory {
                triggered: HashSet::new(),
                insertion_order: VecDeque::new(),
                max_history: max_history.max(1),
            })),
        }
    }

    pub fn has_signal_triggered(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candle_ts: i64,
    ) -> Result<bool, String> {
        let history = self.history.lock().map_err(|e| e.to_string())?;
        Ok(history
            .triggered
            .contains(&(SeriesKey::new(symbol, timeframe), candle_ts)))
    }

    pub fn record_signal(&self, symbol: &str, timeframe: Timeframe, candle_ts: i64) -> Result<(), String> {
        let mut history = self.history.lock().map_err(|e| e.to_string())?;
        history.record((SeriesKey::new(symbol, timeframe), candle_ts));
        Ok(())
    }

    /// Fire at most once per (symbol, timeframe, forming candle).
    ///
    /// Returns `(fired, candle_ts, reason)`; a fired signal is recorded before returning.
    pub fn should_trigger_signal(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        ohlcv: &[Candle],
        now: i64,
        signal_detected: bool,
    ) -> Result<(bool, Option<i64>, TriggerReason), String> {
        if !signal_detected {
            return Ok((false, None, TriggerReason::NoSignal));
        }

        let Some(candle) = get_current_candle(ohlcv, timeframe, now) else {
            return Ok((false, None, TriggerReason::NoCurrentCandle));
        };

        let key = (SeriesKey::new(symbol, timeframe), candle.open_ts);
        let mut history = self.history.lock().map_err(|e| e.to_string())?;

        if history.triggered.contains(&key) {
            return Ok((false, Some(candle.open_ts), TriggerReason::AlreadyTriggered));
        }

        history.record(key);
        Ok((true, Some(candle.open_ts), TriggerReason::NewSignal))
    }

    pub fn triggered_count(&self) -> Result<usize, String> {
        let history = self.history.lock().map_err(|e| e.to_string())?;
        Ok(history.triggered.len())
    }

    /// Remove records; `None` matches everything
    pub fn clear(&self, symbol: Option<&str>, timeframe: Option<Timeframe>) -> Result<(), String> {
        let mut history = self.history.lock().map_err(|e| e.to_string())?;
        let matches = |key: &SignalKey| {
            symbol.map_or(true, |s| key.0.symbol == s) && timeframe.map_or(true, |tf| key.0.timeframe == tf)
        };
        history.triggered.retain(|k| !matches(k));
        history.insertion_order.retain(|k| !matches(k));
        Ok(())
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

    fn feed(rows: i64) -> Vec<Candle> {
        (0..rows)
            .map(|i| create_test_candle(T0 + i * FIVE_MIN, 100.0 + i as f64))
            .collect()
    }

    #[test]
    fn test_get_current_candle() {
        let ohlcv = feed(3);
        let current = get_current_candle(&ohlcv, Timeframe::M5, T0 + FIVE_MIN + 5).unwrap();
        assert_eq!(current.open_ts, T0 + FIVE_MIN);

        // Clock ahead of the feed falls back to the last row
        let lagging = get_current_candle(&ohlcv, Timeframe::M5, T0 + 10 * FIVE_MIN).unwrap();
        assert_eq!(lagging.open_ts, T0 + 2 * FIVE_MIN);

        assert!(get_current_candle(&[], Timeframe::M5, T0).is_none());
    }

    #[test]
    fn test_fires_once_per_candle() {
        let tracker = CandleSignalTracker::default();
        let ohlcv = feed(2);
        let now = T0 + FIVE_MIN + 1_000;

        let (fired, ts, reason) = tracker
            .should_trigger_signal("BTC", Timeframe::M5, &ohlcv, now, true)
            .unwrap();
        assert!(fired);
        assert_eq!(ts, Some(T0 + FIVE_MIN));
        assert_eq!(reason, TriggerReason::NewSignal);

        let (fired, ts, reason) = tracker
            .should_trigger_signal("BTC", Timeframe::M5, &ohlcv, now + 60_000, true)
            .unwrap();
        assert!(!fired);
        assert_eq!(ts, Some(T0 + FIVE_MIN));
        assert_eq!(reason.as_str(), "already_triggered");

        // Next candle fires again
        let ohlcv = feed(3);
        let (fired, _, _) = tracker
            .should_trigger_signal("BTC", Timeframe::M5, &ohlcv, T0 + 2 * FIVE_MIN + 1, true)
            .unwrap();
        assert!(fired);
    }

    #[test]
    fn test_no_signal_and_no_candle() {
        let tracker = CandleSignalTracker::default();
        let (fired, ts, reason) = tracker
            .should_trigger_signal("BTC", Timeframe::M5, &feed(2), T0, false)
            .unwrap();
        assert!(!fired);
        assert!(ts.is_none());
        assert_eq!(reason, TriggerReason::NoSignal);

        let (fired, _, reason) = tracker
            .should_trigger_signal("BTC", Timeframe::M5, &[], T0, true)
            .unwrap();
        assert!(!fired);
        assert_eq!(reason, TriggerReason::NoCurrentCandle);
        assert_eq!(tracker.triggered_count().unwrap(), 0);
    }

    #[test]
    fn test_fifo_eviction_by_insertion() {
        let tracker = CandleSignalTracker::new(3);

        // Insert a newer candle first, then older ones
        tracker.record_signal("BTC", Timeframe::M5, T0 + 10 * FIVE_MIN).unwrap();
        tracker.record_signal("BTC", Timeframe::M5, T0).unwrap();
        tracker.record_signal("BTC", Timeframe::M5, T0 + FIVE_MIN).unwrap();
        tracker.record_signal("BTC", Timeframe::M5, T0 + 2 * FIVE_MIN).unwrap();

        assert_eq!(tracker.triggered_count().unwrap(), 3);
        // First inserted is evicted even though it is the most recent candle
        assert!(!tracker
            .has_signal_triggered("BTC", Timeframe::M5, T0 + 10 * FIVE_MIN)
            .unwrap());
        assert!(tracker.has_signal_triggered("BTC", Timeframe::M5, T0).unwrap());
    }

    #[test]
    fn test_clear() {
        let tracker = CandleSignalTracker::default();
        tracker.record_signal("BTC", Timeframe::M5, T0).unwrap();
        tracker.record_signal("ETH", Timeframe::M5, T0).unwrap();

        tracker.clear(Some("BTC"), None).unwrap();
        assert!(!tracker.has_signal_triggered("BTC", Timeframe::M5, T0).unwrap());
        assert!(tracker.has_signal_triggered("ETH", Timeframe::M5, T0).unwrap());

        tracker.clear(None, None).unwrap();
        assert_eq!(tracker.triggered_count().unwrap(), 0);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let tracker = CandleSignalTracker::default();
        let ohlcv = feed(2);
        let now = T0 + FIVE_MIN + 1;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                let ohlcv = ohlcv.clone();
                thread::spawn(move || {
                    tracker
                        .should_trigger_signal("BTC", Timeframe::M5, &ohlcv, now, true)
                        .unwrap()
                        .0
                })
            })
            .collect();

        let fired: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(fired, 1);
    }
}
