//! Matched round-trip trades derived from legs.

use super::snapshot::{PositionSide, WalletId};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTrade {
    pub wallet_id: WalletId,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub avg_entry_price: f64,
    pub avg_exit_price: f64,
    pub total_pnl: f64,
    pub fees: f64,
    pub leverage: Option<f64>,
    pub equity_used: Option<f64>,
    pub strategy_id: Option<i64>,
    pub fill_count: u32,
    /// Closing-leg timestamp; part of the natural key.
    pub timestamp: DateTime<Utc>,
    /// Opening-leg timestamp, used to locate the lifecycle row to close.
    pub opened_at: DateTime<Utc>,
}

impl AggregatedTrade {
    /// Key of the trade within its wallet.
    pub fn natural_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.symbol.as_str())
    }

    pub fn needs_leverage(&self) -> bool {
        self.leverage.is_none() || self.equity_used.is_none()
    }

    pub fn is_win(&self) -> bool {
        self.total_pnl > 0.0
    }
}

/// Gross round-trip P&L before fees.
pub fn gross_pnl(side: PositionSide, entry: f64, exit: f64, size: f64) -> f64 {
    match side {
        PositionSide::Long => (exit - entry) * size,
        PositionSide::Short => (entry - exit) * size,
    }
}
