use crate::candles::Timeframe;
use crate::error::DataError;
use crate::models::Candle;

// 2001-09-09 .. 2286-11-20 in ms
const MIN_VALID_TS: i64 = 1_000_000_000_000;
const MAX_VALID_TS: i64 = 9_999_999_999_999;

/// One fetch of OHLCV split into its forming (last) and last-closed (second-to-last) rows
#[derive(Debug, Clone)]
pub struct DualChannelOhlcv {
    pub symbol: String,
    pub timeframe: Timeframe,
    candles: Vec<Candle>,
    pub fetch_time: i64,
}

impl DualChannelOhlcv {
    /// # Errors
    /// `DataError::InsufficientCandles` when fewer than two rows are supplied
    pub fn from_candles(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        candles: Vec<Candle>,
        fetch_time: i64,
    ) -> Result<Self, DataError> {
        let symbol = symbol.into();
        if candles.len() < 2 {
            return Err(DataError::InsufficientCandles {
                symbol,
                needed: 2,
                got: candles.len(),
            });
        }

        let forming_ts = candles[candles.len() - 1].open_ts;
        let closed_ts = candles[candles.len() - 2].open_ts;
        for ts in [forming_ts, closed_ts] {
            if !(MIN_VALID_TS..=MAX_VALID_TS).contains(&ts) {
                tracing::warn!(symbol = %symbol, ts, "Candle timestamp is not in UTC milliseconds");
            }
        }

        Ok(Self {
            symbol,
            timeframe,
            candles,
            fetch_time,
        })
    }

    pub fn forming_candle(&self) -> Candle {
        self.candles[self.candles.len() - 1]
    }

    pub fn last_closed_candle(&self) -> Candle {
        self.candles[self.candles.len() - 2]
    }

    pub fn forming_ts(&self) -> i64 {
        self.forming_candle().open_ts
    }

    pub fn closed_ts(&self) -> i64 {
        self.last_closed_candle().open_ts
    }

    /// Every row except the forming one
    pub fn closed_candles(&self) -> &[Candle] {
        &self.candles[..self.candles.len() - 1]
    }

    /// Every row including the forming one
    pub fn candles_with_forming(&self) -> &[Candle] {
        &self.candles
    }

    /// Last `n` closed rows
    pub fn recent_closed(&self, n: usize) -> &[Candle] {
        let closed = self.closed_candles();
        &closed[closed.len().saturating_sub(n)..]
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}
