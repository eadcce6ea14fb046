//! Persistence port for the reconciliation ledger.
//!
//! Every write is an upsert on a natural business key so a replayed cycle
//! converges on the same rows.

use crate::domain::error::ReconError;
use crate::domain::leg::TradeLeg;
use crate::domain::position::Position;
use crate::domain::snapshot::{
    EquitySnapshot, LeverageEstimate, PositionSnapshot, SnapshotId, WalletId,
};
use crate::domain::strategy::{Strategy, StrategyAssignment};
use crate::domain::trade::AggregatedTrade;
use chrono::{DateTime, Utc};

/// Whether an upsert created a row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Historical account-wide margin, read by the leverage estimator.
pub trait MarginHistory {
    /// Most recent `total_margin_used` recorded strictly before `before` and
    /// no earlier than `not_before`.
    fn margin_before(
        &self,
        wallet_id: WalletId,
        before: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<Option<f64>, ReconError>;
}

pub trait LedgerStore: MarginHistory {
    // Equity
    fn upsert_equity_snapshot(&self, snapshot: &EquitySnapshot) -> Result<(), ReconError>;

    // Position snapshots
    fn upsert_position_snapshot(&self, snapshot: &PositionSnapshot) -> Result<SnapshotId, ReconError>;

    /// Latest snapshot for (wallet, symbol) strictly before `before`.
    fn latest_snapshot_before(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshot>, ReconError>;

    /// First snapshot of the session that opened at `opened_at`.
    fn session_head(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        opened_at: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshot>, ReconError>;

    /// Write leverage into a snapshot only while its leverage is still null.
    fn fill_pending_leverage(
        &self,
        id: SnapshotId,
        estimate: &LeverageEstimate,
    ) -> Result<bool, ReconError>;

    /// Latest snapshot per (wallet, symbol) where that snapshot has size > 0.
    fn latest_open_snapshots(
        &self,
        wallet_id: Option<WalletId>,
    ) -> Result<Vec<PositionSnapshot>, ReconError>;

    /// Earliest snapshot with size > 0 inside `[from, to]`.
    fn first_open_snapshot_between(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshot>, ReconError>;

    // Position lifecycle
    fn open_position(&self, position: &Position) -> Result<i64, ReconError>;

    fn close_position(&self, id: i64, closed_at: DateTime<Utc>) -> Result<(), ReconError>;

    fn settle_position(
        &self,
        id: i64,
        closed_at: DateTime<Utc>,
        exit_price: f64,
        realized_pnl: f64,
    ) -> Result<(), ReconError>;

    /// Drop exit price and realized P&L; the close time is kept.
    fn clear_settlement(&self, id: i64) -> Result<(), ReconError>;

    fn positions(&self, wallet_id: Option<WalletId>) -> Result<Vec<Position>, ReconError>;

    // Legs and trades
    fn upsert_leg(&self, leg: &TradeLeg) -> Result<UpsertOutcome, ReconError>;

    fn legs_for_wallet(&self, wallet_id: WalletId) -> Result<Vec<TradeLeg>, ReconError>;

    fn upsert_aggregated_trade(&self, trade: &AggregatedTrade) -> Result<UpsertOutcome, ReconError>;

    /// Delete the wallet's trades whose (closing timestamp, symbol) is not in
    /// `keep`. Returns how many were removed.
    fn retain_aggregated_trades(
        &self,
        wallet_id: WalletId,
        keep: &[(DateTime<Utc>, &str)],
    ) -> Result<usize, ReconError>;

    /// Trades closed in `[start, end)`, newest first.
    fn aggregated_trades(
        &self,
        wallet_id: Option<WalletId>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AggregatedTrade>, ReconError>;

    fn wallet_ids(&self) -> Result<Vec<WalletId>, ReconError>;

    // Strategies
    fn upsert_strategy(&self, strategy: &Strategy) -> Result<(), ReconError>;

    fn strategies(&self) -> Result<Vec<Strategy>, ReconError>;

    fn insert_assignment(&self, assignment: &StrategyAssignment) -> Result<i64, ReconError>;

    fn assignments(&self, wallet_id: Option<WalletId>) -> Result<Vec<StrategyAssignment>, ReconError>;

    fn assignments_for(
        &self,
        wallet_id: WalletId,
        symbol: &str,
    ) -> Result<Vec<StrategyAssignment>, ReconError>;

    /// Returns false when no assignment has that id.
    fn end_assignment(&self, id: i64, at: DateTime<Utc>) -> Result<bool, ReconError>;
}
