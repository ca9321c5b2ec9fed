// Risk management module
pub mod risk_control;
pub mod sizing;

pub use risk_control::{
    DailyLossTracker, OrderValidator, RiskControl, RiskLimits, ValidationCode, ValidationResult,
};
pub use sizing::{OrderSizeCalculator, OrderSizeResult};
