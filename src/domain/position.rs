//! Position lifecycle records (open -> closed).

use super::snapshot::{PositionSide, WalletId};
use super::trade::AggregatedTrade;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: Option<i64>,
    pub wallet_id: WalletId,
    pub symbol: String,
    pub side: PositionSide,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    pub fn open(
        wallet_id: WalletId,
        symbol: &str,
        side: PositionSide,
        entry_price: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Position {
            id: None,
            wallet_id,
            symbol: symbol.to_string(),
            side,
            opened_at,
            closed_at: None,
            entry_price,
            exit_price: None,
            realized_pnl: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Whether `trade` closed this lifecycle: same symbol and side, opened
    /// between the trade's opening and closing fills.
    pub fn closed_by(&self, trade: &AggregatedTrade) -> bool {
        self.wallet_id == trade.wallet_id
            && self.symbol == trade.symbol
            && self.side == trade.side
            && self.opened_at >= trade.opened_at
            && self.opened_at <= trade.timestamp
    }

    pub fn settled_as(&self, trade: &AggregatedTrade) -> bool {
        self.exit_price == Some(trade.avg_exit_price) && self.realized_pnl == Some(trade.total_pnl)
    }
}

/// The lifecycle row `trade` settles: the most recently opened candidate not
/// already taken by an earlier trade in the same pass.
pub fn settlement_target<'a>(
    positions: &'a [Position],
    taken: &HashSet<i64>,
    trade: &AggregatedTrade,
) -> Option<&'a Position> {
    positions
        .iter()
        .filter(|p| p.id.is_some_and(|id| !taken.contains(&id)) && p.closed_by(trade))
        .max_by_key(|p| p.opened_at)
}

/// An open position as handed to the reporting side, with its resolved
/// strategy name.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPositionView {
    pub wallet_id: WalletId,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub leverage: Option<f64>,
    pub equity_used: Option<f64>,
    pub opened_at: Option<DateTime<Utc>>,
    pub strategy_name: Option<String>,
}
