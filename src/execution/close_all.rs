use serde::{Deserialize, Serialize};
use std::fmt;

use super::router::ExecutionRouter;
use crate::models::PositionSide;
use crate::persistence::PaperStore;

const TABLE_WIDTH: usize = 80;
const TABLE_TITLE: &str = "Close-all result";
const ERROR_ANNOTATION: &str = "error:";
const WARNING_ANNOTATION: &str = "warning:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseStatus {
    Success,
    Failed,
    Skipped,
}

impl CloseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseStatus::Success => "success",
            CloseStatus::Failed => "failed",
            CloseStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(CloseStatus::Success),
            "failed" => Some(CloseStatus::Failed),
            "skipped" => Some(CloseStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of closing one (symbol, side) position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosePositionResult {
    pub symbol: String,
    pub pos_side: PositionSide,
    pub before_sz: f64,
    pub after_sz: f64,
    pub order_id: Option<String>,
    pub status: CloseStatus,
    pub error: Option<String>,
    /// Residual size found by the verification pass
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseAllResult {
    pub success: bool,
    pub cancelled_orders: Vec<String>,
    pub closed_positions: Vec<ClosePositionResult>,
    pub errors: Vec<String>,
}

impl Default for CloseAllResult {
    fn default() -> Self {
        Self {
            success: true,
            cancelled_orders: Vec::new(),
            closed_positions: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Flatten the whole workflow in scope (`symbol`, or every symbol when `None`).
///
/// 1. Cancel open orders. Failures are recorded, never fatal.
/// 2. Fetch non-zero positions. Failure aborts with `success = false`.
/// 3. Reduce-only market close per position, each isolated from the others.
/// 4. Re-fetch and attach any residual size as a warning.
pub async fn close_all_positions(router: &ExecutionRouter, symbol: Option<&str>) -> CloseAllResult {
    let mut result = CloseAllResult::default();
    let scope = symbol.unwrap_or("all");

    tracing::info!("🔻 Step 1: cancelling open orders (symbol={})", scope);
    match router.fetch_open_orders(symbol).await {
        Ok(orders) => {
            for order in orders {
                match router.cancel_order(&order.id, &order.symbol).await {
                    Ok(()) => result.cancelled_orders.push(order.id),
                    Err(e) => {
                        tracing::warn!("⚠️ Failed to cancel order {}: {}", order.id, e);
                        result.errors.push(format!("cancel {} failed: {}", order.id, e));
                    }
                }
            }
            tracing::info!("✅ Cancelled {} orders", result.cancelled_orders.len());
        }
        Err(e) => {
            tracing::warn!("⚠️ Failed to fetch open orders: {}", e);
            result.errors.push(format!("fetch open orders failed: {}", e));
        }
    }

    tracing::info!("🔻 Step 2: fetching positions");
    let positions = match router.fetch_positions(symbol).await {
        Ok(positions) => positions,
        Err(e) => {
            tracing::error!("❌ Failed to fetch positions: {}", e);
            result.errors.push(format!("fetch positions failed: {}", e));
            result.success = false;
            return result;
        }
    };
    if positions.is_empty() {
        tracing::info!("ℹ️ No positions to close");
        return result;
    }

    tracing::info!("🔻 Step 3: closing {} positions", positions.len());
    for position in positions {
        let mut item = ClosePositionResult {
            symbol: position.symbol.clone(),
            pos_side: position.side,
            before_sz: position.contracts,
            after_sz: 0.0,
            order_id: None,
            status: CloseStatus::Skipped,
            error: None,
            warning: None,
        };

        if position.contracts <= 0.0 {
            item.error = Some("no position to close".to_string());
            result.closed_positions.push(item);
            continue;
        }

        match router
            .close_position(&position.symbol, position.side, position.contracts)
            .await
        {
            Ok(order) => {
                tracing::info!("✅ Closed {} {} order_id={}", position.symbol, position.side, order.id);
                item.order_id = Some(order.id);
                item.status = CloseStatus::Success;
            }
            Err(e) => {
                tracing::error!("❌ Failed to close {} {}: {}", position.symbol, position.side, e);
                item.status = CloseStatus::Failed;
                item.after_sz = position.contracts;
                item.error = Some(e.to_string());
                result.success = false;
                result.errors.push(format!("close {} {} failed: {}", position.symbol, position.side, e));
            }
        }
        result.closed_positions.push(item);
    }

    tracing::info!("🔻 Step 4: verifying positions");
    match router.fetch_positions(symbol).await {
        Ok(remaining) => {
            for position in remaining.iter().filter(|p| p.contracts > 0.0) {
                tracing::warn!(
                    "⚠️ Residual position: {} {} size {}",
                    position.symbol,
                    position.side,
                    position.contracts
                );
                if let Some(item) = result
                    .closed_positions
                    .iter_mut()
                    .find(|r| r.symbol == position.symbol && r.pos_side == position.side)
                {
                    item.after_sz = position.contracts;
                    item.warning = Some(format!("residual size {} after close", position.contracts));
                }
            }
        }
        Err(e) => {
            tracing::warn!("⚠️ Verification fetch failed: {}", e);
            result.errors.push(format!("verify positions failed: {}", e));
        }
    }

    tracing::info!(
        "✅ Close-all finished: success={}, closed={}",
        result.success,
        result.closed_positions.len()
    );
    result
}

/// `close_all_positions` against the stored paper ledger: restore it first, save it after.
/// Live mode goes straight to the exchange.
pub async fn close_all_persisted(
    router: &ExecutionRouter,
    store: &dyn PaperStore,
    symbol: Option<&str>,
) -> crate::Result<CloseAllResult> {
    router.load_paper_state(store).await?;
    let result = close_all_positions(router, symbol).await;
    router.save_paper_state(store).await?;
    Ok(result)
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl CloseAllResult {
    /// Fixed-width audit table. `from_table` reads it back without loss.
    pub fn to_table(&self) -> String {
        let rule = "=".repeat(TABLE_WIDTH);
        let thin = "-".repeat(TABLE_WIDTH);
        let mut lines = vec![
            rule.clone(),
            TABLE_TITLE.to_string(),
            rule.clone(),
            format!(
                "{:<20} {:<8} {:<12} {:<12} {:<10} {}",
                "Symbol", "PosSide", "Before", "After", "Status", "OrderID"
            ),
            thin.clone(),
        ];

        for p in &self.closed_positions {
            lines.push(format!(
                "{:<20} {:<8} {:<12} {:<12} {:<10} {}",
                p.symbol,
                p.pos_side.as_str(),
                p.before_sz,
                p.after_sz,
                p.status.as_str(),
                p.order_id.as_deref().unwrap_or("-")
            ));
            if let Some(error) = &p.error {
                lines.push(format!("  {} {}", ERROR_ANNOTATION, escape(error)));
            }
            if let Some(warning) = &p.warning {
                lines.push(format!("  {} {}", WARNING_ANNOTATION, escape(warning)));
            }
        }

        lines.push(thin);
        let cancelled = if self.cancelled_orders.is_empty() {
            "-".to_string()
        } else {
            self.cancelled_orders.join(" ")
        };
        lines.push(format!("Cancelled orders: {} {}", self.cancelled_orders.len(), cancelled));
        lines.push(format!("Closed positions: {}", self.closed_positions.len()));
        lines.push(format!("Success: {}", self.success));
        for error in &self.errors {
            lines.push(format!("Error: {}", escape(error)));
        }
        lines.push(rule);
        lines.join("\n")
    }

    /// Parse a table produced by `to_table`
    pub fn from_table(table: &str) -> Result<Self, String> {
        let mut result = CloseAllResult::default();
        let mut in_rows = false;
        let mut saw_success = false;

        for raw in table.lines() {
            // Message-carrying lines keep their trailing text untouched
            let content = raw.trim_start();
            let trimmed = raw.trim();

            if trimmed.is_empty() || trimmed == TABLE_TITLE {
                continue;
            }
            if trimmed.starts_with('=') || (trimmed.starts_with('-') && trimmed.chars().all(|c| c == '-')) {
                in_rows = false;
                continue;
            }
            if trimmed.starts_with("Symbol") && trimmed.contains("PosSide") {
                in_rows = true;
                continue;
            }

            if in_rows {
                if let Some(rest) = content.strip_prefix(ERROR_ANNOTATION) {
                    let last = result
                        .closed_positions
                        .last_mut()
                        .ok_or("error annotation before any row")?;
                    last.error = Some(unescape(rest.strip_prefix(' ').unwrap_or(rest)));
                    continue;
                }
                if let Some(rest) = content.strip_prefix(WARNING_ANNOTATION) {
                    let last = result
                        .closed_positions
                        .last_mut()
                        .ok_or("warning annotation before any row")?;
                    last.warning = Some(unescape(rest.strip_prefix(' ').unwrap_or(rest)));
                    continue;
                }
                result.closed_positions.push(parse_row(trimmed)?);
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("Cancelled orders:") {
                let mut parts = rest.split_whitespace();
                let count: usize = parts
                    .next()
                    .ok_or("missing cancelled order count")?
                    .parse()
                    .map_err(|e| format!("bad cancelled order count: {}", e))?;
                let ids: Vec<String> = parts.filter(|id| *id != "-").map(str::to_string).collect();
                if ids.len() != count {
                    return Err(format!("cancelled order count {} does not match {} ids", count, ids.len()));
                }
                result.cancelled_orders = ids;
            } else if trimmed.starts_with("Closed positions:") {
                continue;
            } else if let Some(rest) = trimmed.strip_prefix("Success:") {
                result.success = rest
                    .trim()
                    .parse()
                    .map_err(|e| format!("bad success flag: {}", e))?;
                saw_success = true;
            } else if let Some(rest) = content.strip_prefix("Error:") {
                result.errors.push(unescape(rest.strip_prefix(' ').unwrap_or(rest)));
            } else {
                return Err(format!("unrecognized line: {}", trimmed));
            }
        }

        if !saw_success {
            return Err("missing success line".to_string());
        }
        Ok(result)
    }
}

fn parse_row(line: &str) -> Result<ClosePositionResult, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 6 {
        return Err(format!("expected 6 columns, got {}: {}", parts.len(), line));
    }
    let pos_side = PositionSide::parse(parts[1]).ok_or_else(|| format!("bad side: {}", parts[1]))?;
    let before_sz = parts[2].parse().map_err(|e| format!("bad before size: {}", e))?;
    let after_sz = parts[3].parse().map_err(|e| format!("bad after size: {}", e))?;
    let status = CloseStatus::parse(parts[4]).ok_or_else(|| format!("bad status: {}", parts[4]))?;
    let order_id = match parts[5] {
        "-" => None,
        id => Some(id.to_string()),
    };

    Ok(ClosePositionResult {
        symbol: parts[0].to_string(),
        pos_side,
        before_sz,
        after_sz,
        order_id,
        status,
        error: None,
        warning: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::fake::FakeExchange;
    use crate::execution::ledger::SimulatedAccount;
    use crate::execution::router::RunMode;
    use crate::models::Action;
    use crate::risk::OrderSizeCalculator;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn live_router(exchange: Arc<FakeExchange>) -> ExecutionRouter {
        ExecutionRouter::new(
            exchange,
            RunMode::Live,
            SimulatedAccount::default(),
            Arc::new(OrderSizeCalculator::new()),
        )
        .unwrap()
    }

    fn sample_result() -> CloseAllResult {
        CloseAllResult {
            success: false,
            cancelled_orders: vec!["123".into(), "456".into()],
            closed_positions: vec![
                ClosePositionResult {
                    symbol: "BTC-USDT-SWAP".into(),
                    pos_side: PositionSide::Long,
                    before_sz: 0.37,
                    after_sz: 0.01,
                    order_id: Some("paper_1700000000000_12".into()),
                    status: CloseStatus::Success,
                    error: None,
                    warning: Some("residual size 0.01 after close".into()),
                },
                ClosePositionResult {
                    symbol: "ETH-USDT-SWAP".into(),
                    pos_side: PositionSide::Short,
                    before_sz: 12.5,
                    after_sz: 12.5,
                    order_id: None,
                    status: CloseStatus::Failed,
                    error: Some("exchange rejected request [51000]: bad\nsecond line".into()),
                    warning: None,
                },
            ],
            errors: vec!["close ETH-USDT-SWAP short failed: rejected; retry later".into()],
        }
    }

    #[test]
    fn test_table_round_trip() {
        let original = sample_result();
        let table = original.to_table();
        assert!(table.contains("BTC-USDT-SWAP"));
        assert_eq!(CloseAllResult::from_table(&table).unwrap(), original);

        let empty = CloseAllResult::default();
        assert_eq!(CloseAllResult::from_table(&empty.to_table()).unwrap(), empty);
    }

    #[test]
    fn test_table_parse_rejects_garbage() {
        assert!(CloseAllResult::from_table("hello").is_err());
        assert!(CloseAllResult::from_table("").is_err());
    }

    #[tokio::test]
    async fn test_closes_in_correct_direction() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.add_position("BTC-USDT-SWAP", PositionSide::Long, 2.0, 50_000.0);
        exchange.add_position("ETH-USDT-SWAP", PositionSide::Short, 5.0, 3_000.0);
        let router = live_router(exchange.clone());

        let result = close_all_positions(&router, None).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.closed_positions.len(), 2);

        let created = exchange.created.lock().unwrap();
        let btc = created.iter().find(|o| o.symbol == "BTC-USDT-SWAP").unwrap();
        let eth = created.iter().find(|o| o.symbol == "ETH-USDT-SWAP").unwrap();
        assert_eq!(btc.side, Action::Sell);
        assert_eq!(eth.side, Action::Buy);
        assert!(btc.reduce_only && eth.reduce_only);
        assert_eq!(btc.amount, 2.0);
    }

    #[tokio::test]
    async fn test_zero_size_position_skipped() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.add_position("BTC-USDT-SWAP", PositionSide::Long, 0.0, 50_000.0);
        let router = live_router(exchange.clone());

        let result = close_all_positions(&router, None).await;
        assert!(result.success);
        assert!(result.closed_positions.is_empty());
        assert!(exchange.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_position_fetch_failure_aborts() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.fail_positions.store(true, Ordering::SeqCst);
        let router = live_router(exchange.clone());

        let result = close_all_positions(&router, None).await;
        assert!(!result.success);
        assert!(result.closed_positions.is_empty());
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.add_position("BTC-USDT-SWAP", PositionSide::Long, 1.0, 50_000.0);
        exchange.add_position("ETH-USDT-SWAP", PositionSide::Long, 1.0, 3_000.0);
        exchange.fail_create_for.lock().unwrap().insert("BTC-USDT-SWAP".into());
        let router = live_router(exchange.clone());

        let result = close_all_positions(&router, None).await;
        assert!(!result.success);
        let btc = result.closed_positions.iter().find(|p| p.symbol == "BTC-USDT-SWAP").unwrap();
        let eth = result.closed_positions.iter().find(|p| p.symbol == "ETH-USDT-SWAP").unwrap();
        assert_eq!(btc.status, CloseStatus::Failed);
        assert_eq!(btc.after_sz, 1.0);
        assert_eq!(eth.status, CloseStatus::Success);
    }

    #[tokio::test]
    async fn test_cancel_failure_and_residual_are_non_fatal() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.add_position("BTC-USDT-SWAP", PositionSide::Long, 1.0, 50_000.0);
        exchange.fail_cancel.store(true, Ordering::SeqCst);
        exchange.ignore_closes.store(true, Ordering::SeqCst);
        let mut open = exchange.open_orders.lock().unwrap();
        open.push(crate::models::OrderResponse {
            id: "o-1".into(),
            client_order_id: None,
            symbol: "BTC-USDT-SWAP".into(),
            side: Action::Buy,
            order_type: crate::models::OrderType::Limit,
            amount: 1.0,
            price: Some(40_000.0),
            filled: 0.0,
            remaining: 1.0,
            status: crate::models::OrderStatus::Open,
            timestamp: chrono::Utc::now(),
            pos_side: Some(PositionSide::Long),
            reduce_only: false,
            realized_pnl: None,
        });
        drop(open);
        let router = live_router(exchange.clone());

        let result = close_all_positions(&router, Some("BTC-USDT-SWAP")).await;
        assert!(result.success);
        assert!(result.cancelled_orders.is_empty());
        let btc = &result.closed_positions[0];
        assert_eq!(btc.status, CloseStatus::Success);
        assert_eq!(btc.after_sz, 1.0);
        assert!(btc.warning.as_deref().unwrap().contains("residual"));
        assert!(!result.errors.is_empty());
    }
}
