use super::{Direction, Strategy, StrategyDecision};
use crate::candles::Timeframe;
use crate::models::Candle;
use crate::Result;

/// Fast/slow EMA crossover
///
/// Emits Long when the fast EMA crosses above the slow EMA on the last bar, Short on the
/// opposite cross and Hold otherwise.
#[derive(Debug, Clone)]
pub struct EmaCrossStrategy {
    fast_period: usize,
    slow_period: usize,
}

impl EmaCrossStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast_period: fast_period.max(1),
            slow_period: slow_period.max(fast_period + 1),
        }
    }
}

impl Default for EmaCrossStrategy {
    fn default() -> Self {
        Self::new(9, 21)
    }
}

fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
    }

    Some(ema)
}

impl Strategy for EmaCrossStrategy {
    fn generate_signal(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<StrategyDecision> {
        if candles.len() < self.min_candles_required() {
            return Err(format!(
                "Insufficient data: {} candles, need {}",
                candles.len(),
                self.min_candles_required()
            )
            .into());
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let prev = &closes[..closes.len() - 1];

        let (Some(fast), Some(slow), Some(prev_fast), Some(prev_slow)) = (
            calculate_ema(&closes, self.fast_period),
            calculate_ema(&closes, self.slow_period),
            calculate_ema(prev, self.fast_period),
            calculate_ema(prev, self.slow_period),
        ) else {
            return Ok(StrategyDecision::hold("EMA unavailable"));
        };

        let direction = if prev_fast <= prev_slow && fast > slow {
            Direction::Long
        } else if prev_fast >= prev_slow && fast < slow {
            Direction::Short
        } else {
            return Ok(StrategyDecision::hold("no crossover"));
        };

        Ok(StrategyDecision {
            direction,
            confidence: Some(((fast - slow).abs() / slow).min(1.0)),
            kind: "ema_cross".to_string(),
            reason: format!(
                "EMA{} {:.4} crossed EMA{} {:.4}",
                self.fast_period, fast, self.slow_period, slow
            ),
        })
    }

    fn name(&self) -> &str {
        "ema_cross"
    }

    fn min_candles_required(&self) -> usize {
        self.slow_period + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_ts: i as i64 * 60_000,
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_ema() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = calculate_ema(&prices, 5).unwrap();
        assert!(ema > 104.0);
        assert!(calculate_ema(&prices[..2], 5).is_none());
    }

    #[test]
    fn test_insufficient_data_errors() {
        let strategy = EmaCrossStrategy::new(2, 4);
        let result = strategy.generate_signal("BTC", Timeframe::M5, &candles_from(&[1.0, 2.0]));
        assert!(result.is_err());
    }

    #[test]
    fn test_cross_up_is_long() {
        let strategy = EmaCrossStrategy::new(2, 4);
        // Falling then a sharp jump on the last bar
        let candles = candles_from(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 20.0]);
        let decision = strategy.generate_signal("BTC", Timeframe::M5, &candles).unwrap();
        assert_eq!(decision.direction, Direction::Long);
        assert_eq!(decision.direction.action(), Some(crate::models::Action::Buy));
    }

    #[test]
    fn test_flat_is_hold() {
        let strategy = EmaCrossStrategy::new(2, 4);
        let candles = candles_from(&[5.0; 8]);
        let decision = strategy.generate_signal("BTC", Timeframe::M5, &candles).unwrap();
        assert_eq!(decision.direction, Direction::Hold);
    }
}
