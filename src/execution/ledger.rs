use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::LedgerError;
use crate::models::{PositionKey, PositionSide};
use crate::persistence::{PaperBalance, PaperStore};

pub const DEFAULT_INITIAL_BALANCE: f64 = 200.0;
pub const DEFAULT_MAX_MARGIN_RATIO: f64 = 0.10;
pub const DEFAULT_LEVERAGE: u32 = 50;

/// Quantities closer than this are treated as equal when closing
const QTY_EPSILON: f64 = 1e-12;

/// Fresh mark prices, symbol -> price
pub type PriceMap = HashMap<String, f64>;

/// Paper position; one per (symbol, side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedPosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Contracts held
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub contract_value: f64,
    pub opened_at: DateTime<Utc>,
}

impl SimulatedPosition {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.symbol.clone(), self.side)
    }

    pub fn notional(&self) -> f64 {
        self.qty.abs() * self.entry_price * self.contract_value
    }

    pub fn margin(&self) -> f64 {
        if self.leverage == 0 {
            return self.notional();
        }
        self.notional() / self.leverage as f64
    }

    pub fn unrealized_pnl_at(&self, price: f64) -> f64 {
        let qty = self.qty.abs() * self.contract_value;
        match self.side {
            PositionSide::Long => (price - self.entry_price) * qty,
            PositionSide::Short => (self.entry_price - price) * qty,
            PositionSide::None => 0.0,
        }
    }
}

/// Account snapshot, derived from the ledger and a price map on every call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountState {
    pub wallet_balance: f64,
    pub unrealized_pnl: f64,
    pub used_margin: f64,
}

impl AccountState {
    pub fn equity(&self) -> f64 {
        self.wallet_balance + self.unrealized_pnl
    }

    pub fn free_margin(&self) -> f64 {
        self.equity() - self.used_margin
    }
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wallet=${:.2} upnl=${:.2} equity=${:.2} used_margin=${:.2} free_margin=${:.2}",
            self.wallet_balance,
            self.unrealized_pnl,
            self.equity(),
            self.used_margin,
            self.free_margin()
        )
    }
}

/// Simulated USDT-margined account
///
/// - equity = wallet_balance + unrealized_pnl
/// - used_margin = sum of position margins
/// - free_margin = equity - used_margin
///
/// Opening earmarks margin without touching the wallet; only realized PnL changes it.
#[derive(Debug, Clone)]
pub struct SimulatedAccount {
    wallet_balance: f64,
    positions: HashMap<PositionKey, SimulatedPosition>,
    max_margin_ratio: f64,
    default_leverage: u32,
    realized_pnl_total: f64,
}

impl Default for SimulatedAccount {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BALANCE, DEFAULT_MAX_MARGIN_RATIO, DEFAULT_LEVERAGE)
    }
}

impl SimulatedAccount {
    pub fn new(initial_balance: f64, max_margin_ratio: f64, default_leverage: u32) -> Self {
        tracing::info!(
            "💼 Simulated account ready | balance ${:.2} | max margin {:.1}% | default leverage {}x",
            initial_balance,
            max_margin_ratio * 100.0,
            default_leverage
        );
        Self {
            wallet_balance: initial_balance,
            positions: HashMap::new(),
            max_margin_ratio,
            default_leverage,
            realized_pnl_total: 0.0,
        }
    }

    pub fn wallet_balance(&self) -> f64 {
        self.wallet_balance
    }

    pub fn realized_pnl_total(&self) -> f64 {
        self.realized_pnl_total
    }

    pub fn max_margin_ratio(&self) -> f64 {
        self.max_margin_ratio
    }

    pub fn default_leverage(&self) -> u32 {
        self.default_leverage
    }

    /// Missing prices fall back to the entry price (zero PnL for that position)
    pub fn unrealized_pnl(&self, prices: &PriceMap) -> f64 {
        self.positions
            .values()
            .map(|p| p.unrealized_pnl_at(prices.get(&p.symbol).copied().unwrap_or(p.entry_price)))
            .sum()
    }

    pub fn used_margin(&self) -> f64 {
        self.positions.values().map(SimulatedPosition::margin).sum()
    }

    pub fn get_state(&self, prices: &PriceMap) -> AccountState {
        AccountState {
            wallet_balance: self.wallet_balance,
            unrealized_pnl: self.unrealized_pnl(prices),
            used_margin: self.used_margin(),
        }
    }

    pub fn equity(&self, prices: &PriceMap) -> f64 {
        self.get_state(prices).equity()
    }

    /// Margin gate for a new open
    pub fn check_can_open(&self, required_margin: f64, prices: &PriceMap) -> Result<(), LedgerError> {
        let state = self.get_state(prices);

        if state.free_margin() < required_margin {
            return Err(LedgerError::InsufficientFreeMargin {
                required: required_margin,
                free: state.free_margin(),
            });
        }

        let projected = state.used_margin + required_margin;
        let limit = state.equity() * self.max_margin_ratio;
        if projected > limit {
            return Err(LedgerError::MarginRatioExceeded { projected, limit });
        }

        Ok(())
    }

    /// `(within_limit, used_margin / equity)`; non-positive equity reports ratio 1.0
    pub fn margin_ratio(&self, prices: &PriceMap) -> (bool, f64) {
        let state = self.get_state(prices);
        if state.equity() <= 0.0 {
            return (false, 1.0);
        }
        let ratio = state.used_margin / state.equity();
        (ratio <= self.max_margin_ratio, ratio)
    }

    /// Open or add to a position.
    ///
    /// The gate is evaluated against `prices` with `entry_price` substituted for `symbol`.
    /// Adding to an existing (symbol, side) merges at the quantity-weighted average entry and
    /// re-margins the whole position at `leverage`; the gate is charged the margin difference.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        entry_price: f64,
        leverage: Option<u32>,
        contract_value: f64,
        prices: &PriceMap,
    ) -> Result<SimulatedPosition, LedgerError> {
        if side == PositionSide::None {
            return Err(LedgerError::InvalidInput("position side must be long or short".into()));
        }
        if !(qty.is_finite() && qty > 0.0) {
            return Err(LedgerError::InvalidInput(format!("quantity must be positive, got {}", qty)));
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(LedgerError::InvalidInput(format!(
                "entry price must be positive, got {}",
                entry_price
            )));
        }
        if !(contract_value.is_finite() && contract_value > 0.0) {
            return Err(LedgerError::InvalidInput(format!(
                "contract value must be positive, got {}",
                contract_value
            )));
        }
        let leverage = leverage.unwrap_or(self.default_leverage);
        if leverage == 0 {
            return Err(LedgerError::InvalidInput("leverage must be at least 1".into()));
        }

        let candidate = SimulatedPosition {
            symbol: symbol.to_string(),
            side,
            qty,
            entry_price,
            leverage,
            contract_value,
            opened_at: Utc::now(),
        };
        let key = candidate.key();
        let adding = self.positions.contains_key(&key);

        // The merged position takes the new leverage; the gate sees the margin change
        let (position, required_margin) = match self.positions.get(&key) {
            Some(existing) => {
                if (existing.contract_value - contract_value).abs() > QTY_EPSILON {
                    return Err(LedgerError::InvalidInput(format!(
                        "contract value {} does not match open {} {} position ({})",
                        contract_value, symbol, side, existing.contract_value
                    )));
                }
                let total_qty = existing.qty + qty;
                let merged = SimulatedPosition {
                    qty: total_qty,
                    entry_price: (existing.qty * existing.entry_price + qty * entry_price) / total_qty,
                    opened_at: existing.opened_at,
                    ..candidate
                };
                let delta = merged.margin() - existing.margin();
                (merged, delta)
            }
            None => {
                let margin = candidate.margin();
                (candidate, margin)
            }
        };

        let mut gate_prices = prices.clone();
        gate_prices.insert(symbol.to_string(), entry_price);
        if let Err(e) = self.check_can_open(required_margin, &gate_prices) {
            tracing::warn!("Open rejected for {} {}: {}", symbol, side, e);
            return Err(e);
        }

        if adding {
            tracing::info!(
                "➕ Added to {} {} | +{} @ {} | total {} @ {:.4} | {}x | margin ${:.2}",
                symbol,
                side,
                qty,
                entry_price,
                position.qty,
                position.entry_price,
                position.leverage,
                position.margin()
            );
        } else {
            tracing::info!(
                "📈 Opened {} {} | {} @ {} | margin ${:.2}",
                symbol,
                side,
                qty,
                entry_price,
                required_margin
            );
        }
        self.positions.insert(key, position.clone());

        Ok(position)
    }

    /// Close some or all of a position and book the realized PnL into the wallet.
    ///
    /// Returns the realized PnL net of `fee`.
    pub fn close_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        close_price: f64,
        fee: f64,
    ) -> Result<f64, LedgerError> {
        if !(qty.is_finite() && qty > 0.0) {
            return Err(LedgerError::InvalidInput(format!("quantity must be positive, got {}", qty)));
        }
        if !(close_price.is_finite() && close_price > 0.0) {
            return Err(LedgerError::InvalidInput(format!(
                "close price must be positive, got {}",
                close_price
            )));
        }
        if !(fee.is_finite() && fee >= 0.0) {
            return Err(LedgerError::InvalidInput(format!("fee must be non-negative, got {}", fee)));
        }

        let key = PositionKey::new(symbol, side);
        let Some(position) = self.positions.get_mut(&key) else {
            return Err(LedgerError::PositionNotFound {
                symbol: symbol.to_string(),
                side,
            });
        };

        let held = position.qty;
        if qty > held + QTY_EPSILON {
            return Err(LedgerError::CloseExceedsPosition { requested: qty, held });
        }
        let full_close = held - qty <= QTY_EPSILON;
        let closed_qty = if full_close { held } else { qty };

        let realized_pnl = position.unrealized_pnl_at(close_price) * (closed_qty / held) - fee;
        self.wallet_balance += realized_pnl;
        self.realized_pnl_total += realized_pnl;

        if full_close {
            self.positions.remove(&key);
            tracing::info!(
                "📉 Closed {} {} | {} @ {} | realized ${:.2}",
                symbol,
                side,
                closed_qty,
                close_price,
                realized_pnl
            );
        } else {
            position.qty = held - qty;
            tracing::info!(
                "📉 Partially closed {} {} | {} @ {} | remaining {} | realized ${:.2}",
                symbol,
                side,
                qty,
                close_price,
                position.qty,
                realized_pnl
            );
        }

        Ok(realized_pnl)
    }

    pub fn get_position(&self, symbol: &str, side: PositionSide) -> Option<&SimulatedPosition> {
        self.positions.get(&PositionKey::new(symbol, side))
    }

    /// Any side when `side` is `None`
    pub fn has_position(&self, symbol: &str, side: Option<PositionSide>) -> bool {
        match side {
            Some(side) => self.positions.contains_key(&PositionKey::new(symbol, side)),
            None => self.positions.values().any(|p| p.symbol == symbol),
        }
    }

    /// All positions, ordered by symbol then side
    pub fn positions(&self) -> Vec<SimulatedPosition> {
        let mut positions: Vec<SimulatedPosition> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.side.as_str().cmp(b.side.as_str()))
        });
        positions
    }

    /// Multi-line human-readable account summary
    pub fn status_report(&self, prices: &PriceMap) -> String {
        let state = self.get_state(prices);
        let rule = "=".repeat(60);
        let thin = "-".repeat(60);
        let mut lines = vec![
            rule.clone(),
            "📊 Simulated account".to_string(),
            rule.clone(),
            format!("💰 Wallet balance:  ${:.2}", state.wallet_balance),
            format!("📈 Unrealized PnL:  ${:.2}", state.unrealized_pnl),
            format!("💎 Equity:          ${:.2}", state.equity()),
            format!("🔒 Used margin:     ${:.2}", state.used_margin),
            format!("✅ Free margin:     ${:.2}", state.free_margin()),
            thin.clone(),
        ];

        if state.equity() > 0.0 {
            let (ok, ratio) = self.margin_ratio(prices);
            lines.push(format!(
                "📊 Margin ratio: {:.2}% / {:.0}% {}",
                ratio * 100.0,
                self.max_margin_ratio * 100.0,
                if ok { "✅" } else { "❌" }
            ));
        }

        let positions = self.positions();
        if positions.is_empty() {
            lines.push("📋 No positions".to_string());
        } else {
            lines.push(thin);
            lines.push("📋 Positions:".to_string());
            for p in positions {
                let price = prices.get(&p.symbol).copied().unwrap_or(p.entry_price);
                lines.push(format!(
                    "  {} {} | qty={:.6} @ {:.2} | margin=${:.2} | upnl=${:.2}",
                    p.symbol,
                    p.side.as_str().to_uppercase(),
                    p.qty,
                    p.entry_price,
                    p.margin(),
                    p.unrealized_pnl_at(price)
                ));
            }
        }
        lines.push(rule);
        lines.join("\n")
    }

    /// Replace local state with what the store holds. An empty store leaves the wallet as is.
    pub async fn sync_from_store(&mut self, store: &dyn PaperStore) -> crate::Result<()> {
        if let Some(balance) = store.load_balance().await? {
            self.wallet_balance = balance.wallet_balance;
        }

        let stored = store.load_positions().await?;
        self.positions.clear();
        for position in stored {
            if position.qty > 0.0 && position.entry_price > 0.0 && position.side != PositionSide::None {
                self.positions.insert(position.key(), position);
            } else {
                tracing::warn!(
                    "Skipping invalid stored position {} {} qty={} entry={}",
                    position.symbol,
                    position.side,
                    position.qty,
                    position.entry_price
                );
            }
        }

        tracing::info!(
            "📂 Paper state restored: wallet=${:.2}, positions={}",
            self.wallet_balance,
            self.positions.len()
        );
        Ok(())
    }

    pub async fn sync_to_store(&self, store: &dyn PaperStore, prices: &PriceMap) -> crate::Result<()> {
        let state = self.get_state(prices);
        store
            .save_balance(&PaperBalance {
                wallet_balance: state.wallet_balance,
                equity: state.equity(),
                available: state.free_margin(),
                updated_at: Utc::now(),
            })
            .await?;
        store.save_positions(&self.positions()).await?;

        tracing::debug!(
            "Paper state saved: equity=${:.2}, free_margin=${:.2}",
            state.equity(),
            state.free_margin()
        );
        Ok(())
    }
}
