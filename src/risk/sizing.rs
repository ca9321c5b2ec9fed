use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::ExchangeError;
use crate::exchange::{with_retry, ExchangeApi, RetryConfig};
use crate::models::{normalize_symbol, InstrumentInfo};

/// Result of converting risk parameters into an exchange-legal contract quantity
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSizeResult {
    pub is_valid: bool,
    pub contracts: f64,
    pub base_qty: f64,
    pub margin: f64,
    pub notional: f64,
    pub error: Option<String>,
    /// Single-line audit record of every input and derived value
    pub log_line: String,
}

impl OrderSizeResult {
    fn rejected(error: String, log_line: String) -> Self {
        Self {
            is_valid: false,
            contracts: 0.0,
            base_qty: 0.0,
            margin: 0.0,
            notional: 0.0,
            error: Some(error),
            log_line,
        }
    }
}

/// Sizing formula:
/// - margin = equity * risk_pct
/// - notional = margin * leverage
/// - base_qty = notional / price
/// - contracts = floor(notional / (price * ct_val) / lot_sz) * lot_sz
pub struct OrderSizeCalculator {
    instruments: RwLock<HashMap<String, InstrumentInfo>>,
}

impl Default for OrderSizeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shortest decimal form of `x`, so 0.24_f64 becomes exactly 0.24
fn to_decimal(x: f64) -> Option<Decimal> {
    if !x.is_finite() {
        return None;
    }
    x.to_string().parse().ok()
}

/// Round down to a whole number of lots, in exact decimal arithmetic
fn floor_to_lot(contracts_raw: f64, lot_sz: f64) -> Option<f64> {
    let raw = to_decimal(contracts_raw)?;
    let lot = to_decimal(lot_sz)?;
    if lot <= Decimal::ZERO {
        return None;
    }
    let lots = raw.checked_div(lot)?.floor();
    lots.checked_mul(lot)?.normalize().to_f64()
}

impl OrderSizeCalculator {
    pub fn new() -> Self {
        Self {
            instruments: RwLock::new(HashMap::new()),
        }
    }

    /// Cache an instrument under its own symbol and its normalized form
    pub fn insert_instrument(&self, mut info: InstrumentInfo) -> Result<(), String> {
        // Some feeds report amount precision as decimal places rather than a step size
        if info.lot_sz < 0.0001 {
            tracing::warn!(symbol = %info.symbol, lot_sz = info.lot_sz, "Implausible lot size, using 1");
            info.lot_sz = 1.0;
        }

        let mut cache = self.instruments.write().map_err(|e| e.to_string())?;
        let normalized = normalize_symbol(&info.symbol);
        if normalized != info.symbol {
            cache.insert(normalized, info.clone());
        }
        cache.insert(info.symbol.clone(), info);
        Ok(())
    }

    pub fn get_instrument(&self, symbol: &str) -> Option<InstrumentInfo> {
        let cache = self.instruments.read().ok()?;
        cache
            .get(symbol)
            .or_else(|| cache.get(&normalize_symbol(symbol)))
            .cloned()
    }

    /// Fetch all swap instruments (idempotent read, retried) and cache them
    pub async fn load_instruments(
        &self,
        exchange: &dyn ExchangeApi,
        retry: &RetryConfig,
    ) -> Result<usize, ExchangeError> {
        let instruments = with_retry(retry, || exchange.load_markets()).await?;
        let count = instruments.len();
        for info in instruments {
            self.insert_instrument(info).map_err(ExchangeError::Decode)?;
        }
        tracing::info!("📐 Cached {} instruments", count);
        Ok(count)
    }

    /// Make sure `symbol` is cached, loading markets once if it is not
    pub async fn ensure_instrument(
        &self,
        exchange: &dyn ExchangeApi,
        symbol: &str,
        retry: &RetryConfig,
    ) -> Result<InstrumentInfo, ExchangeError> {
        if let Some(info) = self.get_instrument(symbol) {
            return Ok(info);
        }
        self.load_instruments(exchange, retry).await?;
        self.get_instrument(symbol)
            .ok_or_else(|| ExchangeError::UnknownInstrument(symbol.to_string()))
    }

    /// Drop one symbol (both forms) or everything
    pub fn clear_cache(&self, symbol: Option<&str>) {
        let Ok(mut cache) = self.instruments.write() else {
            return;
        };
        match symbol {
            Some(symbol) => {
                cache.remove(symbol);
                cache.remove(&normalize_symbol(symbol));
                tracing::info!("Cleared instrument cache for {}", symbol);
            }
            None => {
                cache.clear();
                tracing::info!("Cleared all instrument cache");
            }
        }
    }

    pub fn calculate(
        &self,
        symbol: &str,
        equity: f64,
        risk_pct: f64,
        leverage: u32,
        price: f64,
    ) -> OrderSizeResult {
        let result = self.compute(symbol, equity, risk_pct, leverage, price);
        if result.is_valid {
            tracing::info!("{}", result.log_line);
        } else {
            tracing::warn!("{}", result.log_line);
        }
        result
    }

    fn compute(&self, symbol: &str, equity: f64, risk_pct: f64, leverage: u32, price: f64) -> OrderSizeResult {
        let inputs = format!(
            "[size] symbol={} equity={:.2} risk={:.4} lev={} price={:.4}",
            symbol, equity, risk_pct, leverage, price
        );

        let input_error = if !price.is_finite() || price <= 0.0 {
            Some(format!("price must be positive, got {}", price))
        } else if !equity.is_finite() || equity <= 0.0 {
            Some(format!("equity must be positive, got {}", equity))
        } else if !risk_pct.is_finite() || risk_pct <= 0.0 {
            Some(format!("risk_pct must be positive, got {}", risk_pct))
        } else if leverage == 0 {
            Some("leverage must be at least 1".to_string())
        } else {
            None
        };
        if let Some(error) = input_error {
            let line = format!("{} [REJECTED: {}]", inputs, error);
            return OrderSizeResult::rejected(error, line);
        }

        let Some(inst) = self.get_instrument(symbol) else {
            let error = format!("instrument info unavailable for {}", symbol);
            let line = format!("{} [REJECTED: {}]", inputs, error);
            return OrderSizeResult::rejected(error, line);
        };

        let margin = equity * risk_pct;
        let notional = margin * leverage as f64;
        let base_qty = notional / price;

        let contracts = if inst.ct_val > 0.0 {
            floor_to_lot(notional / (price * inst.ct_val), inst.lot_sz)
        } else {
            None
        };

        let Some(contracts) = contracts else {
            let error = format!(
                "cannot size {}: ctVal={} lot={} are not usable",
                symbol, inst.ct_val, inst.lot_sz
            );
            let line = format!("{} [REJECTED: {}]", inputs, error);
            return OrderSizeResult::rejected(error, line);
        };

        let log_line = format!(
            "[size] symbol={} equity={:.2} risk={:.4} lev={} margin={:.2} notional={:.2} price={:.4} \
             ctVal={} lot={} minSz={} -> sz={} (contracts) / base={:.6}",
            symbol,
            equity,
            risk_pct,
            leverage,
            margin,
            notional,
            price,
            inst.ct_val,
            inst.lot_sz,
            inst.min_sz,
            contracts,
            base_qty
        );

        if contracts < inst.min_sz {
            return OrderSizeResult {
                is_valid: false,
                contracts,
                base_qty,
                margin,
                notional,
                error: Some(format!("contracts {} below minimum size {}", contracts, inst.min_sz)),
                log_line: format!("{} [REJECTED: sz < minSz({})]", log_line, inst.min_sz),
            };
        }

        OrderSizeResult {
            is_valid: true,
            contracts,
            base_qty,
            margin,
            notional,
            error: None,
            log_line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> InstrumentInfo {
        InstrumentInfo {
            symbol: "BTC-USDT-SWAP".to_string(),
            ct_val: 0.01,
            lot_sz: 0.01,
            min_sz: 0.01,
            tick_sz: 0.1,
        }
    }

    fn calculator() -> OrderSizeCalculator {
        let calc = OrderSizeCalculator::new();
        calc.insert_instrument(btc()).unwrap();
        calc
    }

    #[test]
    fn test_reference_example() {
        let result = calculator().calculate("BTC-USDT-SWAP", 200.0, 0.03, 20, 50_000.0);
        assert!(result.is_valid, "{:?}", result.error);
        assert!((result.margin - 6.0).abs() < 1e-9);
        assert!((result.notional - 120.0).abs() < 1e-9);
        assert_eq!(result.contracts, 0.24);
        assert!((result.base_qty - 0.0024).abs() < 1e-12);
        assert!(result.log_line.contains("-> sz=0.24 (contracts)"));
        assert!(result.log_line.contains("ctVal=0.01"));
    }

    #[test]
    fn test_zero_equity_rejected() {
        let result = calculator().calculate("BTC-USDT-SWAP", 0.0, 0.03, 20, 50_000.0);
        assert!(!result.is_valid);
        assert!(result.error.unwrap().contains("equity"));
        assert!(result.log_line.contains("REJECTED"));
        assert_eq!(result.contracts, 0.0);
    }

    #[test]
    fn test_bad_price_and_leverage_rejected() {
        let calc = calculator();
        assert!(!calc.calculate("BTC-USDT-SWAP", 200.0, 0.03, 20, 0.0).is_valid);
        assert!(!calc.calculate("BTC-USDT-SWAP", 200.0, 0.03, 20, -1.0).is_valid);
        assert!(!calc.calculate("BTC-USDT-SWAP", 200.0, 0.03, 0, 50_000.0).is_valid);
        assert!(!calc.calculate("BTC-USDT-SWAP", 200.0, 0.0, 20, 50_000.0).is_valid);
    }

    #[test]
    fn test_missing_instrument_rejected() {
        let result = calculator().calculate("ETH-USDT-SWAP", 200.0, 0.03, 20, 3_000.0);
        assert!(!result.is_valid);
        assert!(result.error.unwrap().contains("ETH-USDT-SWAP"));
    }

    #[test]
    fn test_below_min_size_rejected() {
        // notional 1.2 -> 0.0024 contracts -> floors to 0
        let result = calculator().calculate("BTC-USDT-SWAP", 2.0, 0.03, 20, 50_000.0);
        assert!(!result.is_valid);
        assert_eq!(result.contracts, 0.0);
        assert!(result.log_line.ends_with("[REJECTED: sz < minSz(0.01)]"));
    }

    #[test]
    fn test_rounding_is_exact_lot_multiple_and_never_up() {
        let calc = calculator();
        for (equity, price) in [(137.0, 43_210.5), (999.99, 61_234.7), (55.5, 27_000.0), (10_000.0, 101.3)] {
            let result = calc.calculate("BTC-USDT-SWAP", equity, 0.05, 10, price);
            let raw = result.notional / (price * 0.01);
            assert!(result.contracts <= raw + 1e-12);
            let lots = result.contracts / 0.01;
            assert!((lots - lots.round()).abs() < 1e-9, "{} not a lot multiple", result.contracts);
        }
    }

    #[test]
    fn test_cache_by_normalized_symbol_and_clear() {
        let calc = calculator();
        assert!(calc.get_instrument("BTC/USDT:USDT").is_some());

        calc.clear_cache(Some("BTC/USDT:USDT"));
        assert!(calc.get_instrument("BTC-USDT-SWAP").is_none());

        calc.insert_instrument(btc()).unwrap();
        calc.clear_cache(None);
        assert!(calc.get_instrument("BTC-USDT-SWAP").is_none());
    }

    #[test]
    fn test_ensure_instrument_loads_markets_once() {
        use crate::exchange::fake::FakeExchange;

        let exchange = FakeExchange::new().with_instrument("ETH-USDT-SWAP", 0.1, 0.01, 0.01);
        let calc = OrderSizeCalculator::new();
        let retry = RetryConfig::no_retry();

        let info = tokio_test::block_on(calc.ensure_instrument(&exchange, "ETH/USDT:USDT", &retry)).unwrap();
        assert_eq!(info.ct_val, 0.1);
        assert!(calc.get_instrument("ETH-USDT-SWAP").is_some());

        let missing = tokio_test::block_on(calc.ensure_instrument(&exchange, "XRP-USDT-SWAP", &retry));
        assert!(matches!(missing, Err(ExchangeError::UnknownInstrument(_))));
    }

    #[test]
    fn test_floor_to_lot() {
        assert_eq!(floor_to_lot(0.24, 0.01), Some(0.24));
        assert_eq!(floor_to_lot(0.2499, 0.01), Some(0.24));
        assert_eq!(floor_to_lot(7.9, 1.0), Some(7.0));
        assert_eq!(floor_to_lot(1.0, 0.0), None);
    }
}
