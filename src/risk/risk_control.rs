use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Order-size and daily-loss limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Largest order notional accepted, in USDT
    pub max_order_size: f64,
    /// Fraction of equity that may be lost in one UTC day
    pub daily_loss_limit_pct: f64,
    pub enable_order_validation: bool,
    pub enable_daily_loss_limit: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_order_size: 1000.0,
            daily_loss_limit_pct: 0.10, // -10% daily
            enable_order_validation: true,
            enable_daily_loss_limit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    OrderSizeExceeded,
    InvalidAmount,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::OrderSizeExceeded => "ORDER_SIZE_EXCEEDED",
            ValidationCode::InvalidAmount => "INVALID_AMOUNT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error_code: Option<ValidationCode>,
    pub error_message: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error_code: None,
            error_message: None,
        }
    }

    fn invalid(code: ValidationCode, message: String) -> Self {
        Self {
            is_valid: false,
            error_code: Some(code),
            error_message: Some(message),
        }
    }
}

/// Stateless order-size check
#[derive(Debug, Clone)]
pub struct OrderValidator {
    pub max_order_size: f64,
}

impl OrderValidator {
    pub fn new(max_order_size: f64) -> Self {
        Self { max_order_size }
    }

    pub fn validate(&self, amount: f64, symbol: &str) -> ValidationResult {
        if amount.is_nan() || amount <= 0.0 {
            return ValidationResult::invalid(
                ValidationCode::InvalidAmount,
                format!("Order amount must be positive, got {}", amount),
            );
        }

        if amount > self.max_order_size {
            let message = format!(
                "Order amount {:.2} USDT for {} exceeds max order size {:.2} USDT",
                amount, symbol, self.max_order_size
            );
            tracing::warn!("{}", message);
            return ValidationResult::invalid(ValidationCode::OrderSizeExceeded, message);
        }

        ValidationResult::valid()
    }
}

/// Accumulated realized losses for the current UTC day
///
/// Rollover is driven by the caller through `reset_if_new_day`.
#[derive(Debug, Clone)]
pub struct DailyLossTracker {
    loss_limit_pct: f64,
    daily_loss: f64,
    current_date: NaiveDate,
}

impl DailyLossTracker {
    pub fn new(loss_limit_pct: f64) -> Self {
        Self::starting_on(loss_limit_pct, Utc::now().date_naive())
    }

    pub fn starting_on(loss_limit_pct: f64, date: NaiveDate) -> Self {
        Self {
            loss_limit_pct,
            daily_loss: 0.0,
            current_date: date,
        }
    }

    /// Zero the loss counter when `now` falls on a later UTC date. Returns true on reset.
    pub fn reset_if_new_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today != self.current_date {
            tracing::info!(
                "📅 New trading day {} (previous loss {:.2} USDT reset)",
                today,
                self.daily_loss
            );
            self.current_date = today;
            self.daily_loss = 0.0;
            return true;
        }
        false
    }

    /// Only losses count; profits never offset them
    pub fn record_loss(&mut self, pnl: f64) {
        if pnl < 0.0 {
            self.daily_loss += pnl.abs();
            tracing::debug!(pnl, daily_loss = self.daily_loss, "Recorded realized loss");
        }
    }

    /// `daily_loss > equity * loss_limit_pct`; non-positive equity always counts as exceeded
    pub fn is_limit_exceeded(&self, equity: f64) -> bool {
        if equity <= 0.0 {
            return true;
        }
        let exceeded = self.daily_loss > equity * self.loss_limit_pct;
        if exceeded {
            tracing::warn!(
                "Daily loss {:.2} exceeds limit {:.2} ({}% of {:.2})",
                self.daily_loss,
                equity * self.loss_limit_pct,
                self.loss_limit_pct * 100.0,
                equity
            );
        }
        exceeded
    }

    pub fn remaining_allowance(&self, equity: f64) -> f64 {
        (equity * self.loss_limit_pct - self.daily_loss).max(0.0)
    }

    pub fn daily_loss(&self) -> f64 {
        self.daily_loss
    }

    pub fn current_date(&self) -> NaiveDate {
        self.current_date
    }
}

/// Order validator plus daily-loss gate
#[derive(Debug, Clone)]
pub struct RiskControl {
    limits: RiskLimits,
    validator: OrderValidator,
    daily_loss: DailyLossTracker,
}

impl RiskControl {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            validator: OrderValidator::new(limits.max_order_size),
            daily_loss: DailyLossTracker::new(limits.daily_loss_limit_pct),
            limits,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn validate_order(&self, amount: f64, symbol: &str) -> ValidationResult {
        if !self.limits.enable_order_validation {
            return ValidationResult::valid();
        }
        self.validator.validate(amount, symbol)
    }

    pub fn record_trade_pnl(&mut self, pnl: f64) {
        if self.limits.enable_daily_loss_limit {
            self.daily_loss.record_loss(pnl);
        }
    }

    pub fn reset_if_new_day(&mut self, now: DateTime<Utc>) -> bool {
        self.daily_loss.reset_if_new_day(now)
    }

    pub fn daily_loss_tracker(&self) -> &DailyLossTracker {
        &self.daily_loss
    }

    /// `Err` carries a human-readable reason
    pub fn can_trade(&self, equity: f64) -> Result<(), String> {
        if !self.limits.enable_daily_loss_limit {
            return Ok(());
        }
        if equity <= 0.0 {
            return Err(format!("Trading halted: equity is {:.2}", equity));
        }
        if self.daily_loss.is_limit_exceeded(equity) {
            return Err(format!(
                "Daily loss limit reached: lost {:.2} USDT today, limit {:.2} USDT ({}% of equity)",
                self.daily_loss.daily_loss(),
                equity * self.limits.daily_loss_limit_pct,
                self.limits.daily_loss_limit_pct * 100.0
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validator_codes() {
        let validator = OrderValidator::new(1000.0);

        let ok = validator.validate(500.0, "BTC-USDT-SWAP");
        assert!(ok.is_valid);
        assert!(ok.error_code.is_none());

        let boundary = validator.validate(1000.0, "BTC-USDT-SWAP");
        assert!(boundary.is_valid);

        let too_big = validator.validate(1000.01, "BTC-USDT-SWAP");
        assert!(!too_big.is_valid);
        assert_eq!(too_big.error_code, Some(ValidationCode::OrderSizeExceeded));
        assert_eq!(too_big.error_code.unwrap().as_str(), "ORDER_SIZE_EXCEEDED");

        for bad in [0.0, -5.0, f64::NAN] {
            let result = validator.validate(bad, "BTC-USDT-SWAP");
            assert_eq!(result.error_code, Some(ValidationCode::InvalidAmount));
        }
    }

    #[test]
    fn test_daily_loss_ignores_profits() {
        let mut tracker = DailyLossTracker::new(0.10);
        tracker.record_loss(-5.0);
        tracker.record_loss(20.0);
        tracker.record_loss(-3.0);
        assert_eq!(tracker.daily_loss(), 8.0);
    }

    #[test]
    fn test_limit_is_strictly_greater() {
        let mut tracker = DailyLossTracker::new(0.10);
        tracker.record_loss(-20.0);

        // 20 == 200 * 0.10, not exceeded
        assert!(!tracker.is_limit_exceeded(200.0));
        assert_eq!(tracker.remaining_allowance(200.0), 0.0);

        tracker.record_loss(-0.01);
        assert!(tracker.is_limit_exceeded(200.0));
        assert!(tracker.is_limit_exceeded(0.0));
        assert!((tracker.remaining_allowance(1000.0) - 79.99).abs() < 1e-9);
    }

    #[test]
    fn test_reset_on_new_utc_day() {
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap();
        let mut tracker = DailyLossTracker::starting_on(0.10, day1.date_naive());

        tracker.record_loss(-50.0);
        assert!(!tracker.reset_if_new_day(day1));
        assert_eq!(tracker.daily_loss(), 50.0);

        assert!(tracker.reset_if_new_day(day2));
        assert_eq!(tracker.daily_loss(), 0.0);
        assert_eq!(tracker.current_date(), day2.date_naive());
    }

    #[test]
    fn test_can_trade_reasons() {
        let mut risk = RiskControl::new(RiskLimits::default());
        assert!(risk.can_trade(200.0).is_ok());

        risk.record_trade_pnl(-25.0);
        let reason = risk.can_trade(200.0).unwrap_err();
        assert!(reason.contains("Daily loss limit"));

        let reason = risk.can_trade(0.0).unwrap_err();
        assert!(reason.contains("equity"));
    }

    #[test]
    fn test_disabled_checks_pass() {
        let limits = RiskLimits {
            enable_order_validation: false,
            enable_daily_loss_limit: false,
            ..Default::default()
        };
        let mut risk = RiskControl::new(limits);
        risk.record_trade_pnl(-1_000_000.0);
        assert!(risk.can_trade(10.0).is_ok());
        assert!(risk.validate_order(1e9, "BTC").is_valid);
    }
}
