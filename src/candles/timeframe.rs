use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DataError;

/// Supported candle durations
///
/// Daily and weekly candles use UTC boundaries. `1d`, `1D` and `1Dutc` all parse to
/// [`Timeframe::D1`], whose canonical token is `1Dutc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    W1,
}

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

impl Timeframe {
    pub const ALL: [Timeframe; 12] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => MINUTE_MS,
            Timeframe::M3 => 3 * MINUTE_MS,
            Timeframe::M5 => 5 * MINUTE_MS,
            Timeframe::M15 => 15 * MINUTE_MS,
            Timeframe::M30 => 30 * MINUTE_MS,
            Timeframe::H1 => HOUR_MS,
            Timeframe::H2 => 2 * HOUR_MS,
            Timeframe::H4 => 4 * HOUR_MS,
            Timeframe::H6 => 6 * HOUR_MS,
            Timeframe::H12 => 12 * HOUR_MS,
            Timeframe::D1 => DAY_MS,
            Timeframe::W1 => 7 * DAY_MS,
        }
    }

    /// Canonical token
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1Dutc",
            Timeframe::W1 => "1W",
        }
    }

    /// Bar token for the OKX candles endpoint (UTC-aligned where OKX distinguishes)
    pub fn okx_bar(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1H",
            Timeframe::H2 => "2H",
            Timeframe::H4 => "4H",
            Timeframe::H6 => "6Hutc",
            Timeframe::H12 => "12Hutc",
            Timeframe::D1 => "1Dutc",
            Timeframe::W1 => "1Wutc",
        }
    }

    /// Open timestamp of the candle containing `ts_ms`
    pub fn align(&self, ts_ms: i64) -> i64 {
        let duration = self.duration_ms();
        if *self == Timeframe::W1 {
            // Unix epoch is a Thursday; weekly bars open on Monday 00:00 UTC
            let monday_offset = 4 * DAY_MS;
            return (ts_ms - monday_offset).div_euclid(duration) * duration + monday_offset;
        }
        ts_ms.div_euclid(duration) * duration
    }
}

impl FromStr for Timeframe {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" | "1H" => Ok(Timeframe::H1),
            "2h" | "2H" => Ok(Timeframe::H2),
            "4h" | "4H" => Ok(Timeframe::H4),
            "6h" | "6H" => Ok(Timeframe::H6),
            "12h" | "12H" => Ok(Timeframe::H12),
            "1d" | "1D" | "1Dutc" => Ok(Timeframe::D1),
            "1w" | "1W" => Ok(Timeframe::W1),
            other => Err(DataError::UnknownTimeframe(other.to_string())),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_aliases_normalize() {
        for token in ["1d", "1D", "1Dutc"] {
            let tf: Timeframe = token.parse().unwrap();
            assert_eq!(tf, Timeframe::D1);
            assert_eq!(tf.as_str(), "1Dutc");
        }
        assert_eq!("1w".parse::<Timeframe>().unwrap(), Timeframe::W1);
    }

    #[test]
    fn test_unknown_timeframe_rejected() {
        assert!(matches!(
            "7m".parse::<Timeframe>(),
            Err(DataError::UnknownTimeframe(_))
        ));
        assert!("".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_canonical_tokens_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn test_durations() {
        assert_eq!(Timeframe::M1.duration_ms(), 60_000);
        assert_eq!(Timeframe::M5.duration_ms(), 300_000);
        assert_eq!(Timeframe::H4.duration_ms(), 14_400_000);
        assert_eq!(Timeframe::D1.duration_ms(), 86_400_000);
        assert_eq!(Timeframe::W1.duration_ms(), 604_800_000);
    }

    #[test]
    fn test_align() {
        // 2024-01-01T00:07:30Z
        let ts = 1_704_067_650_000;
        assert_eq!(Timeframe::M5.align(ts), 1_704_067_500_000);
        assert_eq!(Timeframe::H1.align(ts), 1_704_067_200_000);
        // 2024-01-01 is a Monday
        assert_eq!(Timeframe::W1.align(ts), 1_704_067_200_000);
    }

    #[test]
    fn test_serde_uses_tokens() {
        let json = serde_json::to_string(&Timeframe::D1).unwrap();
        assert_eq!(json, "\"1Dutc\"");
        let tf: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(tf, Timeframe::D1);
    }
}
