//! Pairs opening and closing legs into round-trip trades.
//!
//! Closers are walked oldest first. Each one takes the most recent earlier
//! opener on the same (wallet, instrument), on the opposite fill side, whose
//! size is within the relative tolerance. An opener is consumed at most once.

use super::leg::TradeLeg;
use super::snapshot::{PositionSnapshot, WalletId};
use super::symbol::normalize_symbol;
use super::trade::{gross_pnl, AggregatedTrade};
use chrono::Duration;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    /// Max `|opener - closer| / opener` for a pair.
    pub size_tolerance: f64,
    /// How far after a close a snapshot may be borrowed for leverage.
    pub borrow_window: Duration,
    /// Max `|snapshot - trade| / trade` for a borrowed snapshot.
    pub borrow_size_tolerance: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            size_tolerance: 0.001,
            borrow_window: Duration::minutes(5),
            borrow_size_tolerance: 0.10,
        }
    }
}

pub fn sizes_match(opener: f64, closer: f64, tolerance: f64) -> bool {
    opener > 0.0 && (opener - closer).abs() / opener <= tolerance
}

fn by_time_then_size(a: &TradeLeg, b: &TradeLeg) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.size.total_cmp(&b.size))
}

/// Match legs into trades. Unmatched legs are left for a later pass.
pub fn aggregate(legs: &[TradeLeg], config: &MatchConfig) -> Vec<AggregatedTrade> {
    let mut openers: HashMap<(WalletId, String), Vec<&TradeLeg>> = HashMap::new();
    let mut closers: Vec<&TradeLeg> = Vec::new();
    for leg in legs {
        if leg.reduce_only.is_closing_candidate() {
            closers.push(leg);
        } else {
            openers
                .entry((leg.wallet_id, normalize_symbol(&leg.symbol)))
                .or_default()
                .push(leg);
        }
    }
    for pool in openers.values_mut() {
        pool.sort_by(|a, b| by_time_then_size(b, a));
    }
    closers.sort_by(|a, b| by_time_then_size(a, b));

    let mut consumed: HashSet<(WalletId, String, usize)> = HashSet::new();
    let mut trades = Vec::new();
    let mut unmatched = 0usize;

    for closer in closers {
        let key = (closer.wallet_id, normalize_symbol(&closer.symbol));
        let found = openers.get(&key).and_then(|pool| {
            pool.iter().enumerate().find(|(idx, opener)| {
                opener.timestamp < closer.timestamp
                    && opener.side != closer.side
                    && !consumed.contains(&(key.0, key.1.clone(), *idx))
                    && sizes_match(opener.size, closer.size, config.size_tolerance)
            })
        });
        match found {
            Some((idx, opener)) => {
                consumed.insert((key.0, key.1.clone(), idx));
                trades.push(pair(opener, closer, key.1));
            }
            None => unmatched += 1,
        }
    }

    if unmatched > 0 {
        tracing::debug!(unmatched, matched = trades.len(), "closing legs without opener");
    }
    trades
}

fn pair(opener: &TradeLeg, closer: &TradeLeg, symbol: String) -> AggregatedTrade {
    let side = opener.side.opened_side();
    let exit = if closer.exit_price > 0.0 {
        closer.exit_price
    } else {
        closer.entry_price
    };
    let entry = opener.entry_price;
    let fees = opener.total_fees() + closer.total_fees();
    let (leverage, equity_used) = if opener.leverage.is_some() {
        (opener.leverage, opener.equity_used)
    } else {
        (closer.leverage, closer.equity_used)
    };

    AggregatedTrade {
        wallet_id: closer.wallet_id,
        symbol,
        side,
        size: closer.size,
        avg_entry_price: entry,
        avg_exit_price: exit,
        total_pnl: gross_pnl(side, entry, exit, closer.size) - fees,
        fees,
        leverage,
        equity_used,
        strategy_id: opener.strategy_id.or(closer.strategy_id),
        fill_count: 2,
        timestamp: closer.timestamp,
        opened_at: opener.timestamp,
    }
}

/// Fill missing leverage from a snapshot taken shortly after the close, if
/// its size shows it is the same position.
pub fn borrow_leverage(
    trade: AggregatedTrade,
    snapshot: Option<&PositionSnapshot>,
    config: &MatchConfig,
) -> AggregatedTrade {
    let Some(snap) = snapshot else {
        return trade;
    };
    if trade.size <= 0.0
        || (snap.size - trade.size).abs() / trade.size >= config.borrow_size_tolerance
    {
        return trade;
    }
    let equity_missing = trade.equity_used.is_none_or(|e| e == 0.0);
    AggregatedTrade {
        leverage: trade.leverage.or(snap.leverage),
        equity_used: if equity_missing {
            snap.equity_used.or(trade.equity_used)
        } else {
            trade.equity_used
        },
        ..trade
    }
}
