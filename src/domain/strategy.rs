//! Strategy catalog and time-bounded assignments.

use super::snapshot::WalletId;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

/// Operator-managed binding of a strategy to (wallet, symbol) over
/// `[start_at, end_at]`. An open-ended assignment has `end_at == None`.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyAssignment {
    pub id: Option<i64>,
    pub wallet_id: WalletId,
    pub symbol: String,
    pub strategy_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl StrategyAssignment {
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        self.start_at <= ts && self.end_at.is_none_or(|end| end >= ts)
    }
}

/// Strategy catalog entries and assignments read from an operator export.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentImport {
    pub strategies: Vec<Strategy>,
    pub assignments: Vec<StrategyAssignment>,
}
