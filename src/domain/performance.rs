//! Realized-trade statistics and per-strategy / per-symbol breakdowns.

use super::strategy::Strategy;
use super::symbol::normalize_symbol;
use super::trade::AggregatedTrade;
use std::collections::{BTreeMap, HashMap};

pub const UNASSIGNED: &str = "Unassigned";

#[derive(Debug, Clone, PartialEq)]
pub struct TradeStats {
    pub total_pnl: f64,
    pub total_fees: f64,
    pub trades_won: usize,
    pub trades_lost: usize,
    pub trades_breakeven: usize,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub avg_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_leverage: Option<f64>,
}

impl TradeStats {
    pub fn compute(trades: &[AggregatedTrade]) -> Self {
        let mut trades_won = 0usize;
        let mut trades_lost = 0usize;
        let mut trades_breakeven = 0usize;
        let mut total_wins = 0.0_f64;
        let mut total_losses = 0.0_f64;
        let mut largest_win = 0.0_f64;
        let mut largest_loss = 0.0_f64;
        let mut total_fees = 0.0_f64;
        let mut leverage_sum = 0.0_f64;
        let mut leverage_n = 0usize;

        for trade in trades {
            let pnl = trade.total_pnl;
            if trade.is_win() {
                trades_won += 1;
                total_wins += pnl;
                largest_win = largest_win.max(pnl);
            } else if pnl < 0.0 {
                trades_lost += 1;
                total_losses += pnl.abs();
                largest_loss = largest_loss.max(pnl.abs());
            } else {
                trades_breakeven += 1;
            }
            total_fees += trade.fees;
            if let Some(lev) = trade.leverage {
                leverage_sum += lev;
                leverage_n += 1;
            }
        }

        let total = trades.len();
        let total_pnl = total_wins - total_losses;
        let ratio = |num: f64, den: usize| if den > 0 { num / den as f64 } else { 0.0 };

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        TradeStats {
            total_pnl,
            total_fees,
            trades_won,
            trades_lost,
            trades_breakeven,
            win_rate_pct: ratio(trades_won as f64 * 100.0, total),
            profit_factor,
            avg_pnl: ratio(total_pnl, total),
            avg_win: ratio(total_wins, trades_won),
            avg_loss: ratio(total_losses, trades_lost),
            largest_win,
            largest_loss,
            avg_leverage: (leverage_n > 0).then(|| leverage_sum / leverage_n as f64),
        }
    }

    pub fn trade_count(&self) -> usize {
        self.trades_won + self.trades_lost + self.trades_breakeven
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupPerformance {
    pub label: String,
    pub stats: TradeStats,
}

/// Groups on the key half of `key`; the label half names the group.
fn grouped<K, F>(trades: &[AggregatedTrade], key: F) -> Vec<GroupPerformance>
where
    K: Ord,
    F: Fn(&AggregatedTrade) -> (K, String),
{
    let mut groups: BTreeMap<K, (String, Vec<AggregatedTrade>)> = BTreeMap::new();
    for trade in trades {
        let (k, label) = key(trade);
        groups
            .entry(k)
            .or_insert_with(|| (label, Vec::new()))
            .1
            .push(trade.clone());
    }
    let mut out: Vec<GroupPerformance> = groups
        .into_values()
        .map(|(label, members)| GroupPerformance {
            label,
            stats: TradeStats::compute(&members),
        })
        .collect();
    out.sort_by(|a, b| {
        b.stats
            .total_pnl
            .total_cmp(&a.stats.total_pnl)
            .then_with(|| a.label.cmp(&b.label))
    });
    out
}

/// P&L per strategy id, best first, labelled with the strategy name. Trades
/// without a strategy, or whose strategy no longer exists, fall under
/// [`UNASSIGNED`].
pub fn strategy_performance(
    trades: &[AggregatedTrade],
    strategies: &[Strategy],
) -> Vec<GroupPerformance> {
    let names: HashMap<i64, &str> = strategies.iter().map(|s| (s.id, s.name.as_str())).collect();
    grouped(trades, |t| {
        match t.strategy_id.and_then(|id| names.get(&id).map(|name| (id, *name))) {
            Some((id, name)) => (Some(id), name.to_string()),
            None => (None, UNASSIGNED.to_string()),
        }
    })
}

/// P&L per normalized symbol, best first.
pub fn symbol_performance(trades: &[AggregatedTrade]) -> Vec<GroupPerformance> {
    grouped(trades, |t| {
        let symbol = normalize_symbol(&t.symbol);
        (symbol.clone(), symbol)
    })
}
