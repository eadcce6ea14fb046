//! Strategy attribution: which strategy owned (wallet, symbol) at a moment.

use super::error::ReconError;
use super::snapshot::WalletId;
use super::strategy::StrategyAssignment;
use super::symbol::normalize_symbol;
use crate::ports::store_port::LedgerStore;
use chrono::{DateTime, Utc};

/// Pick the assignment covering `ts`. When windows overlap the latest
/// `start_at` wins and the overlap is logged.
pub fn resolve_from(
    assignments: &[StrategyAssignment],
    wallet_id: WalletId,
    symbol: &str,
    ts: DateTime<Utc>,
) -> Option<i64> {
    let symbol = normalize_symbol(symbol);
    let mut covering: Vec<&StrategyAssignment> = assignments
        .iter()
        .filter(|a| a.wallet_id == wallet_id && normalize_symbol(&a.symbol) == symbol && a.covers(ts))
        .collect();
    covering.sort_by(|a, b| b.start_at.cmp(&a.start_at));

    if covering.len() > 1 {
        tracing::warn!(
            wallet = wallet_id,
            symbol = %symbol,
            %ts,
            overlapping = covering.len(),
            chosen = covering[0].strategy_id,
            "overlapping strategy assignments"
        );
    }
    covering.first().map(|a| a.strategy_id)
}

pub struct StrategyAttributor<'a> {
    store: &'a dyn LedgerStore,
}

impl<'a> StrategyAttributor<'a> {
    pub fn new(store: &'a dyn LedgerStore) -> Self {
        Self { store }
    }

    pub fn resolve(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<i64>, ReconError> {
        let normalized = normalize_symbol(symbol);
        let assignments = self.store.assignments_for(wallet_id, &normalized)?;
        Ok(resolve_from(&assignments, wallet_id, &normalized, ts))
    }

    /// Strategy name for a live position, or `None` when unassigned.
    pub fn strategy_name(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, ReconError> {
        let Some(strategy_id) = self.resolve(wallet_id, symbol, at)? else {
            return Ok(None);
        };
        let name = self
            .store
            .strategies()?
            .into_iter()
            .find(|s| s.id == strategy_id)
            .map(|s| s.name);
        Ok(name)
    }
}
