//! Position session tracking.
//!
//! A session is the run of consecutive snapshots in which a (wallet, symbol)
//! position stays open. Leverage is decided once, at the session's first
//! snapshot, and every later snapshot carries that same value. If the first
//! estimate is unknown, later cycles re-run the estimate against the session
//! head's margin reading and, on success, fill the head in place.

use super::error::ReconError;
use super::leverage::{EstimateRequest, LeverageEstimator};
use super::position::Position;
use super::snapshot::{LeverageEstimate, PositionSide, PositionSnapshot, SnapshotId, WalletId};
use crate::ports::store_port::LedgerStore;
use chrono::{DateTime, Utc};

/// One position as pushed by the exchange for a refresh cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionObservation {
    pub wallet_id: WalletId,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Account-wide margin in use at `timestamp`.
    pub total_margin: Option<f64>,
    pub margin_rate: Option<f64>,
}

impl PositionObservation {
    /// Closing sentinel for a symbol missing from the push.
    pub fn closed(wallet_id: WalletId, prior: &PositionSnapshot, timestamp: DateTime<Utc>) -> Self {
        PositionObservation {
            wallet_id,
            symbol: prior.symbol.clone(),
            side: prior.side,
            size: 0.0,
            entry_price: prior.entry_price,
            mark_price: None,
            timestamp,
            total_margin: None,
            margin_rate: None,
        }
    }

    fn notional(&self) -> f64 {
        self.size * self.mark_price.unwrap_or(self.entry_price)
    }
}

/// What a new observation means relative to the previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStep {
    /// Size zero: write a sentinel and close any open session.
    Close { position_id: Option<i64> },
    /// First open snapshot of a new session. `flipped_from` is set when the
    /// previous session was still open on the opposite side.
    Open { flipped_from: Option<i64> },
    Continue {
        opened_at: DateTime<Utc>,
        position_id: Option<i64>,
    },
}

pub fn classify(prior: Option<&PositionSnapshot>, obs: &PositionObservation) -> SessionStep {
    let open_prior = prior.filter(|p| p.is_open());
    if obs.size <= 0.0 {
        return SessionStep::Close {
            position_id: open_prior.and_then(|p| p.position_id),
        };
    }
    match open_prior {
        None => SessionStep::Open { flipped_from: None },
        Some(p) if p.side != obs.side => SessionStep::Open {
            flipped_from: p.position_id,
        },
        Some(p) => SessionStep::Continue {
            opened_at: p.opened_at.unwrap_or(p.timestamp),
            position_id: p.position_id,
        },
    }
}

pub struct SessionTracker<'a> {
    store: &'a dyn LedgerStore,
    estimator: LeverageEstimator<'a>,
}

impl<'a> SessionTracker<'a> {
    pub fn new(store: &'a dyn LedgerStore, estimator: LeverageEstimator<'a>) -> Self {
        Self { store, estimator }
    }

    /// Persist one observation as a snapshot and return its id.
    pub fn record_snapshot(&self, obs: &PositionObservation) -> Result<SnapshotId, ReconError> {
        let prior = self
            .store
            .latest_snapshot_before(obs.wallet_id, &obs.symbol, obs.timestamp)?;

        match classify(prior.as_ref(), obs) {
            SessionStep::Close { position_id } => {
                if let Some(id) = position_id {
                    self.store.close_position(id, obs.timestamp)?;
                    tracing::info!(wallet = obs.wallet_id, symbol = %obs.symbol, "session closed");
                }
                let snapshot = base_snapshot(obs, None, None, LeverageEstimate::unknown());
                self.store.upsert_position_snapshot(&snapshot)
            }
            SessionStep::Open { flipped_from } => {
                if let Some(id) = flipped_from {
                    tracing::info!(
                        wallet = obs.wallet_id,
                        symbol = %obs.symbol,
                        side = %obs.side,
                        "side flipped, starting new session"
                    );
                    self.store.close_position(id, obs.timestamp)?;
                }
                let position_id = self.store.open_position(&Position::open(
                    obs.wallet_id,
                    &obs.symbol,
                    obs.side,
                    obs.entry_price,
                    obs.timestamp,
                ))?;
                let estimate = self.estimator.estimate(&EstimateRequest {
                    wallet_id: obs.wallet_id,
                    symbol: &obs.symbol,
                    notional: obs.notional(),
                    current_total_margin: obs.total_margin,
                    timestamp: obs.timestamp,
                    margin_rate: obs.margin_rate,
                });
                let snapshot = base_snapshot(obs, Some(position_id), Some(obs.timestamp), estimate);
                self.store.upsert_position_snapshot(&snapshot)
            }
            SessionStep::Continue {
                opened_at,
                position_id,
            } => {
                let estimate = self.session_estimate(obs, opened_at)?;
                let snapshot = base_snapshot(obs, position_id, Some(opened_at), estimate);
                self.store.upsert_position_snapshot(&snapshot)
            }
        }
    }

    /// Leverage for a continuing snapshot: the head's value when resolved,
    /// otherwise a retry pinned to the head's margin reading.
    fn session_estimate(
        &self,
        obs: &PositionObservation,
        opened_at: DateTime<Utc>,
    ) -> Result<LeverageEstimate, ReconError> {
        let Some(head) = self
            .store
            .session_head(obs.wallet_id, &obs.symbol, opened_at)?
        else {
            tracing::warn!(
                wallet = obs.wallet_id,
                symbol = %obs.symbol,
                %opened_at,
                "session head missing, leaving leverage unknown"
            );
            return Ok(LeverageEstimate::unknown());
        };

        if head.has_resolved_leverage() {
            return Ok(head.estimate());
        }

        let retry = self.estimator.estimate(&EstimateRequest {
            wallet_id: obs.wallet_id,
            symbol: &obs.symbol,
            notional: head.notional(),
            current_total_margin: head.margin_total_at_snapshot,
            timestamp: head.timestamp,
            margin_rate: obs.margin_rate,
        });
        if !retry.is_resolved() {
            return Ok(LeverageEstimate::unknown());
        }
        if let Some(head_id) = head.id {
            if self.store.fill_pending_leverage(head_id, &retry)? {
                tracing::info!(
                    wallet = obs.wallet_id,
                    symbol = %obs.symbol,
                    leverage = retry.leverage,
                    method = %retry.method,
                    "filled pending session leverage"
                );
            }
        }
        Ok(retry)
    }
}

fn base_snapshot(
    obs: &PositionObservation,
    position_id: Option<i64>,
    opened_at: Option<DateTime<Utc>>,
    estimate: LeverageEstimate,
) -> PositionSnapshot {
    let open = obs.size > 0.0;
    let estimate = if open {
        estimate
    } else {
        LeverageEstimate::unknown()
    };
    PositionSnapshot {
        id: None,
        wallet_id: obs.wallet_id,
        position_id,
        symbol: obs.symbol.clone(),
        side: obs.side,
        size: obs.size.max(0.0),
        entry_price: obs.entry_price,
        mark_price: obs.mark_price,
        leverage: estimate.leverage,
        equity_used: estimate.equity_used,
        calculation_method: estimate.method,
        margin_total_at_snapshot: obs.total_margin,
        timestamp: obs.timestamp,
        opened_at: if open { opened_at } else { None },
    }
}
