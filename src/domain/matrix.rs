//! Wallet × symbol strategy matrix for operators.

use super::snapshot::WalletId;
use super::strategy::{Strategy, StrategyAssignment};
use super::symbol::{merge_symbol, same_instrument};
use super::trade::AggregatedTrade;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixCell {
    pub symbol: String,
    pub strategy_id: Option<i64>,
    pub strategy_name: Option<String>,
    pub assignment_id: Option<i64>,
    pub trade_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixRow {
    pub wallet_id: WalletId,
    pub cells: Vec<MatrixCell>,
}

/// Trades closed under `assignment`: same wallet and strategy, equivalent
/// symbol, timestamp inside the assignment window.
pub fn count_trades_for_assignment(
    assignment: &StrategyAssignment,
    trades: &[AggregatedTrade],
) -> usize {
    trades
        .iter()
        .filter(|t| {
            t.wallet_id == assignment.wallet_id
                && t.strategy_id == Some(assignment.strategy_id)
                && same_instrument(&t.symbol, &assignment.symbol)
                && assignment.covers(t.timestamp)
        })
        .count()
}

/// One row per wallet that has ever had an assignment. Symbols are
/// everything the wallet traded plus symbols with a live assignment, merged
/// so `BTC` and `BTC-USDT` share a row.
pub fn build_strategy_matrix(
    traded: &BTreeMap<WalletId, BTreeSet<String>>,
    assignments: &[StrategyAssignment],
    strategies: &[Strategy],
    trades: &[AggregatedTrade],
    now: DateTime<Utc>,
) -> Vec<MatrixRow> {
    let live: Vec<&StrategyAssignment> = assignments
        .iter()
        .filter(|a| a.active && a.covers(now))
        .collect();

    let mut wallets: BTreeMap<WalletId, BTreeSet<String>> = traded.clone();
    wallets.retain(|w, _| assignments.iter().any(|a| a.wallet_id == *w));
    for a in &live {
        merge_symbol(wallets.entry(a.wallet_id).or_default(), &a.symbol);
    }

    wallets
        .into_iter()
        .map(|(wallet_id, symbols)| {
            let cells = symbols
                .into_iter()
                .map(|symbol| {
                    let assignment = live
                        .iter()
                        .filter(|a| a.wallet_id == wallet_id && same_instrument(&a.symbol, &symbol))
                        .max_by_key(|a| a.start_at);
                    match assignment {
                        Some(a) => MatrixCell {
                            strategy_name: strategies
                                .iter()
                                .find(|s| s.id == a.strategy_id)
                                .map(|s| s.name.clone()),
                            strategy_id: Some(a.strategy_id),
                            assignment_id: a.id,
                            trade_count: count_trades_for_assignment(a, trades),
                            symbol,
                        },
                        None => MatrixCell {
                            symbol,
                            strategy_id: None,
                            strategy_name: None,
                            assignment_id: None,
                            trade_count: 0,
                        },
                    }
                })
                .collect();
            MatrixRow { wallet_id, cells }
        })
        .collect()
}
