//! Refresh-cycle orchestration.
//!
//! One cycle per wallet: record equity, snapshot every pushed position, close
//! sessions that disappeared from the push, store fills as legs, then
//! re-derive round-trip trades from the wallet's full leg history.
//!
//! Failures on one symbol are logged and reported but do not stop the rest
//! of the cycle; failures on one wallet do not stop the batch.

use super::attribution::StrategyAttributor;
use super::config_validation::EngineConfig;
use super::error::ReconError;
use super::leg::ReduceOnly;
use super::leverage::LeverageEstimator;
use super::matcher::{aggregate, borrow_leverage};
use super::payload::{fill_to_leg, CycleInput, FillEvent};
use super::position::{settlement_target, OpenPositionView, Position};
use super::session::{PositionObservation, SessionTracker};
use super::snapshot::{LeverageEstimate, WalletId};
use super::trade::{gross_pnl, AggregatedTrade};
use crate::ports::store_port::{LedgerStore, UpsertOutcome};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFailure {
    pub symbol: String,
    pub stage: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationReport {
    pub trades_inserted: usize,
    pub trades_updated: usize,
    pub trades_removed: usize,
    pub leverage_borrowed: usize,
    pub positions_settled: usize,
    pub positions_unsettled: usize,
    pub failures: Vec<SymbolFailure>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub wallet_id: WalletId,
    pub snapshots_recorded: usize,
    pub sessions_closed: usize,
    pub legs_upserted: usize,
    pub aggregation: AggregationReport,
    pub failures: Vec<SymbolFailure>,
}

impl CycleReport {
    pub fn failure_count(&self) -> usize {
        self.failures.len() + self.aggregation.failures.len()
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub cycles: Vec<CycleReport>,
    pub failed_wallets: Vec<(WalletId, ReconError)>,
}

fn failure(symbol: &str, stage: &'static str, err: &ReconError) -> SymbolFailure {
    tracing::warn!(symbol, stage, error = %err, "symbol skipped");
    SymbolFailure {
        symbol: symbol.to_string(),
        stage,
        reason: err.to_string(),
    }
}

pub fn reconcile_wallet(
    config: &EngineConfig,
    store: &dyn LedgerStore,
    cycle: &CycleInput,
) -> Result<CycleReport, ReconError> {
    let wallet_id = cycle.wallet_id;
    let span = tracing::info_span!("reconcile", wallet = wallet_id);
    let _guard = span.enter();

    let mut report = CycleReport {
        wallet_id,
        ..CycleReport::default()
    };

    if let Some(equity) = &cycle.equity {
        store.upsert_equity_snapshot(equity)?;
    }

    let tracker = SessionTracker::new(store, LeverageEstimator::new(store, &config.leverage));
    let total_margin = cycle.total_margin();
    let mut pushed: HashSet<&str> = HashSet::new();

    for push in cycle.positions.iter().filter(|p| p.size > 0.0) {
        pushed.insert(push.symbol.as_str());
        let obs = PositionObservation {
            wallet_id,
            symbol: push.symbol.clone(),
            side: push.side,
            size: push.size,
            entry_price: push.entry_price,
            mark_price: push.mark_price,
            timestamp: cycle.cycle_time,
            total_margin,
            margin_rate: push.margin_rate,
        };
        match tracker.record_snapshot(&obs) {
            Ok(_) => report.snapshots_recorded += 1,
            Err(e) => report.failures.push(failure(&push.symbol, "snapshot", &e)),
        }
    }

    for open in store.latest_open_snapshots(Some(wallet_id))? {
        if pushed.contains(open.symbol.as_str()) || open.timestamp >= cycle.cycle_time {
            continue;
        }
        let sentinel = PositionObservation::closed(wallet_id, &open, cycle.cycle_time);
        match tracker.record_snapshot(&sentinel) {
            Ok(_) => report.sessions_closed += 1,
            Err(e) => report.failures.push(failure(&open.symbol, "close", &e)),
        }
    }

    let attributor = StrategyAttributor::new(store);
    for fill in &cycle.fills {
        let stored = attributor
            .resolve(wallet_id, &fill.symbol, fill.timestamp)
            .and_then(|strategy_id| {
                let leverage = closing_fill_leverage(store, wallet_id, fill)?;
                store.upsert_leg(&fill_to_leg(wallet_id, fill, strategy_id, leverage))
            });
        match stored {
            Ok(_) => report.legs_upserted += 1,
            Err(e) => report.failures.push(failure(&fill.symbol, "leg", &e)),
        }
    }

    report.aggregation = aggregate_wallet(config, store, wallet_id)?;

    tracing::info!(
        snapshots = report.snapshots_recorded,
        closed = report.sessions_closed,
        legs = report.legs_upserted,
        trades_inserted = report.aggregation.trades_inserted,
        failures = report.failure_count(),
        "cycle reconciled"
    );
    Ok(report)
}

/// Leverage for a closing fill, read from the head of the session the fill
/// reduces: the one open just before it. Opening fills carry none; their
/// trade picks leverage up from the closer or the next session snapshot.
fn closing_fill_leverage(
    store: &dyn LedgerStore,
    wallet_id: WalletId,
    fill: &FillEvent,
) -> Result<Option<LeverageEstimate>, ReconError> {
    if !ReduceOnly::from_flag(fill.reduce_only).is_closing_candidate() {
        return Ok(None);
    }
    let Some(prior) = store.latest_snapshot_before(wallet_id, &fill.symbol, fill.timestamp)? else {
        return Ok(None);
    };
    let Some(opened_at) = prior.opened_at.filter(|_| prior.size > 0.0) else {
        return Ok(None);
    };
    Ok(store
        .session_head(wallet_id, &fill.symbol, opened_at)?
        .filter(|head| head.has_resolved_leverage())
        .map(|head| head.estimate()))
}

/// Rebuild a wallet's aggregated trades and position settlements from all
/// stored legs. Trades whose closer no longer matches are removed, and a
/// settlement no recomputed trade claims is cleared.
pub fn aggregate_wallet(
    config: &EngineConfig,
    store: &dyn LedgerStore,
    wallet_id: WalletId,
) -> Result<AggregationReport, ReconError> {
    let legs = store.legs_for_wallet(wallet_id)?;
    let trades = aggregate(&legs, &config.matching);
    let attributor = StrategyAttributor::new(store);
    let mut report = AggregationReport::default();

    report.trades_removed = {
        let keep: Vec<(DateTime<Utc>, &str)> = trades.iter().map(AggregatedTrade::natural_key).collect();
        store.retain_aggregated_trades(wallet_id, &keep)?
    };
    if report.trades_removed > 0 {
        tracing::info!(
            wallet = wallet_id,
            removed = report.trades_removed,
            "removed trades no longer matched by leg history"
        );
    }

    let positions = store.positions(Some(wallet_id))?;
    let mut taken: HashSet<i64> = HashSet::new();
    for trade in trades {
        let target = settlement_target(&positions, &taken, &trade);
        if let Some(id) = target.and_then(|p| p.id) {
            taken.insert(id);
        }
        let symbol = trade.symbol.clone();
        if let Err(e) = persist_trade(config, store, &attributor, trade, target, &mut report) {
            report.failures.push(failure(&symbol, "trade", &e));
        }
    }

    for position in positions.iter().filter(|p| p.realized_pnl.is_some()) {
        let Some(id) = position.id.filter(|id| !taken.contains(id)) else {
            continue;
        };
        match store.clear_settlement(id) {
            Ok(()) => {
                tracing::info!(wallet = wallet_id, symbol = %position.symbol, "settlement cleared");
                report.positions_unsettled += 1;
            }
            Err(e) => report.failures.push(failure(&position.symbol, "settlement", &e)),
        }
    }
    Ok(report)
}

fn persist_trade(
    config: &EngineConfig,
    store: &dyn LedgerStore,
    attributor: &StrategyAttributor<'_>,
    mut trade: AggregatedTrade,
    settles: Option<&Position>,
    report: &mut AggregationReport,
) -> Result<(), ReconError> {
    if let Some(strategy_id) = attributor.resolve(trade.wallet_id, &trade.symbol, trade.timestamp)? {
        trade.strategy_id = Some(strategy_id);
    }

    if trade.needs_leverage() {
        let window_end = trade
            .timestamp
            .checked_add_signed(config.matching.borrow_window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let snapshot =
            store.first_open_snapshot_between(trade.wallet_id, &trade.symbol, trade.timestamp, window_end)?;
        let had_leverage = trade.leverage.is_some();
        trade = borrow_leverage(trade, snapshot.as_ref(), &config.matching);
        if !had_leverage && trade.leverage.is_some() {
            report.leverage_borrowed += 1;
        }
    }

    match store.upsert_aggregated_trade(&trade)? {
        UpsertOutcome::Inserted => report.trades_inserted += 1,
        UpsertOutcome::Updated => report.trades_updated += 1,
    }

    if let Some(position) = settles.filter(|p| !p.settled_as(&trade)) {
        if let Some(id) = position.id {
            store.settle_position(id, trade.timestamp, trade.avg_exit_price, trade.total_pnl)?;
            report.positions_settled += 1;
        }
    }
    Ok(())
}

pub fn reconcile_all(config: &EngineConfig, store: &dyn LedgerStore, cycles: &[CycleInput]) -> BatchReport {
    let mut batch = BatchReport::default();
    for cycle in cycles {
        match reconcile_wallet(config, store, cycle) {
            Ok(report) => batch.cycles.push(report),
            Err(e) => {
                tracing::error!(wallet = cycle.wallet_id, error = %e, "wallet cycle failed");
                batch.failed_wallets.push((cycle.wallet_id, e));
            }
        }
    }
    batch
}

/// Currently open positions with their latest snapshot values.
pub fn open_positions(
    store: &dyn LedgerStore,
    wallet_id: Option<WalletId>,
    now: DateTime<Utc>,
) -> Result<Vec<OpenPositionView>, ReconError> {
    let attributor = StrategyAttributor::new(store);
    let mut views = Vec::new();
    for snap in store.latest_open_snapshots(wallet_id)? {
        let strategy_name = attributor
            .strategy_name(snap.wallet_id, &snap.symbol, now)
            .unwrap_or_else(|e| {
                tracing::warn!(symbol = %snap.symbol, error = %e, "strategy lookup failed");
                None
            });
        views.push(OpenPositionView {
            unrealized_pnl: snap
                .mark_price
                .map(|mark| gross_pnl(snap.side, snap.entry_price, mark, snap.size)),
            wallet_id: snap.wallet_id,
            symbol: snap.symbol,
            side: snap.side,
            size: snap.size,
            entry_price: snap.entry_price,
            mark_price: snap.mark_price,
            leverage: snap.leverage,
            equity_used: snap.equity_used,
            opened_at: snap.opened_at,
            strategy_name,
        });
    }
    Ok(views)
}
