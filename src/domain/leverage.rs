//! Leverage inference for newly opened positions.
//!
//! The exchange does not report per-position leverage, so it is inferred
//! from how much account margin the open consumed:
//!
//! 1. **margin_delta**: `equity_used = margin_now - margin_before`,
//!    `leverage = notional / equity_used`. The baseline is the latest margin
//!    reading inside a lookback window that depends on the wallet's margin
//!    mode (1h isolated, 24h cross).
//! 2. **margin_rate**: fallback from the exchange's initial margin rate `r`:
//!    `leverage = 1 / r`, `equity_used = notional * r`.
//! 3. Otherwise the estimate is unknown and the caller retries later.
//!
//! Estimation never fails; storage errors while reading margin history are
//! logged and treated as missing history.

use super::snapshot::{CalculationMethod, LeverageEstimate, WalletId};
use crate::ports::store_port::MarginHistory;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl FromStr for MarginMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "isolated" => Ok(MarginMode::Isolated),
            "cross" => Ok(MarginMode::Cross),
            other => Err(format!("unknown margin mode {other:?}, expected isolated or cross")),
        }
    }
}

impl fmt::Display for MarginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarginMode::Isolated => f.write_str("isolated"),
            MarginMode::Cross => f.write_str("cross"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeverageConfig {
    pub isolated_lookback: Duration,
    pub cross_lookback: Duration,
    pub default_margin_mode: MarginMode,
    pub wallet_margin_modes: HashMap<WalletId, MarginMode>,
    /// Margin-delta results above this are rejected as implausible.
    pub max_leverage: Option<f64>,
}

impl Default for LeverageConfig {
    fn default() -> Self {
        LeverageConfig {
            isolated_lookback: Duration::minutes(60),
            cross_lookback: Duration::hours(24),
            default_margin_mode: MarginMode::Isolated,
            wallet_margin_modes: HashMap::new(),
            max_leverage: None,
        }
    }
}

impl LeverageConfig {
    pub fn margin_mode_for(&self, wallet_id: WalletId) -> MarginMode {
        self.wallet_margin_modes
            .get(&wallet_id)
            .copied()
            .unwrap_or(self.default_margin_mode)
    }

    pub fn lookback_for(&self, wallet_id: WalletId) -> Duration {
        match self.margin_mode_for(wallet_id) {
            MarginMode::Isolated => self.isolated_lookback,
            MarginMode::Cross => self.cross_lookback,
        }
    }
}

/// Inputs for one estimate: the position at the moment it was first seen.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateRequest<'a> {
    pub wallet_id: WalletId,
    pub symbol: &'a str,
    pub notional: f64,
    pub current_total_margin: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Initial margin rate from the raw exchange payload, if reported.
    pub margin_rate: Option<f64>,
}

/// Pure margin-delta rule. `None` when the delta cannot explain the open.
pub fn margin_delta_estimate(
    notional: f64,
    margin_before: f64,
    margin_now: f64,
) -> Option<LeverageEstimate> {
    let delta = margin_now - margin_before;
    if !delta.is_finite() || delta <= 0.0 || notional <= 0.0 {
        return None;
    }
    Some(LeverageEstimate::resolved(
        notional / delta,
        delta,
        CalculationMethod::MarginDelta,
    ))
}

/// Pure margin-rate rule.
pub fn margin_rate_estimate(notional: f64, rate: f64) -> Option<LeverageEstimate> {
    if !rate.is_finite() || rate <= 0.0 || notional <= 0.0 {
        return None;
    }
    Some(LeverageEstimate::resolved(
        1.0 / rate,
        notional * rate,
        CalculationMethod::MarginRate,
    ))
}

pub struct LeverageEstimator<'a> {
    history: &'a dyn MarginHistory,
    config: &'a LeverageConfig,
}

impl<'a> LeverageEstimator<'a> {
    pub fn new(history: &'a dyn MarginHistory, config: &'a LeverageConfig) -> Self {
        Self { history, config }
    }

    pub fn estimate(&self, req: &EstimateRequest<'_>) -> LeverageEstimate {
        if let Some(est) = self.try_margin_delta(req) {
            return est;
        }
        if let Some(est) = req
            .margin_rate
            .and_then(|rate| margin_rate_estimate(req.notional, rate))
        {
            tracing::debug!(
                wallet = req.wallet_id,
                symbol = req.symbol,
                leverage = est.leverage,
                "leverage from margin rate"
            );
            return est;
        }
        tracing::info!(
            wallet = req.wallet_id,
            symbol = req.symbol,
            "leverage unresolved, will retry on a later snapshot"
        );
        LeverageEstimate::unknown()
    }

    fn try_margin_delta(&self, req: &EstimateRequest<'_>) -> Option<LeverageEstimate> {
        let margin_now = req.current_total_margin?;
        let lookback = self.config.lookback_for(req.wallet_id);
        let not_before = req
            .timestamp
            .checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let margin_before = match self.history.margin_before(req.wallet_id, req.timestamp, not_before) {
            Ok(Some(m)) => m,
            Ok(None) => {
                tracing::debug!(
                    wallet = req.wallet_id,
                    symbol = req.symbol,
                    "no margin history inside lookback"
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(wallet = req.wallet_id, error = %e, "margin history lookup failed");
                return None;
            }
        };

        let est = margin_delta_estimate(req.notional, margin_before, margin_now)?;
        let delta = margin_now - margin_before;
        if delta > req.notional {
            tracing::warn!(
                wallet = req.wallet_id,
                symbol = req.symbol,
                delta,
                notional = req.notional,
                "margin delta exceeds notional, another position likely moved margin"
            );
        }
        if let (Some(cap), Some(lev)) = (self.config.max_leverage, est.leverage) {
            if lev > cap {
                tracing::warn!(
                    wallet = req.wallet_id,
                    symbol = req.symbol,
                    leverage = lev,
                    max_leverage = cap,
                    "margin delta leverage above cap, discarding"
                );
                return None;
            }
        }
        Some(est)
    }
}
