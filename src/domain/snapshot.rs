//! Per-cycle position and equity snapshots.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

pub type WalletId = i64;
pub type SnapshotId = i64;

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" | "b" | "bid" => Ok(PositionSide::Long),
            "short" | "sell" | "a" | "ask" => Ok(PositionSide::Short),
            other => Err(format!("unknown position side: {other:?}")),
        }
    }
}

/// How a snapshot's leverage/equity_used was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalculationMethod {
    MarginDelta,
    MarginRate,
    Unknown,
}

impl CalculationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationMethod::MarginDelta => "margin_delta",
            CalculationMethod::MarginRate => "margin_rate",
            CalculationMethod::Unknown => "unknown",
        }
    }

    /// Lenient decode for stored values; anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "margin_delta" => CalculationMethod::MarginDelta,
            "margin_rate" => CalculationMethod::MarginRate,
            _ => CalculationMethod::Unknown,
        }
    }
}

impl fmt::Display for CalculationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a leverage inference. Either both values are present or neither.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeverageEstimate {
    pub leverage: Option<f64>,
    pub equity_used: Option<f64>,
    pub method: CalculationMethod,
}

impl LeverageEstimate {
    pub fn unknown() -> Self {
        LeverageEstimate {
            leverage: None,
            equity_used: None,
            method: CalculationMethod::Unknown,
        }
    }

    pub fn resolved(leverage: f64, equity_used: f64, method: CalculationMethod) -> Self {
        LeverageEstimate {
            leverage: Some(leverage),
            equity_used: Some(equity_used),
            method,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.leverage.is_some() && self.equity_used.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub id: Option<SnapshotId>,
    pub wallet_id: WalletId,
    /// Lifecycle row this snapshot belongs to; `None` for closing sentinels
    /// with no open position.
    pub position_id: Option<i64>,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub leverage: Option<f64>,
    pub equity_used: Option<f64>,
    pub calculation_method: CalculationMethod,
    pub margin_total_at_snapshot: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// First timestamp of the session. `None` on closing sentinels.
    pub opened_at: Option<DateTime<Utc>>,
}

impl PositionSnapshot {
    /// `size == 0` marks "no open position this cycle".
    pub fn is_sentinel(&self) -> bool {
        self.size <= 0.0
    }

    pub fn is_open(&self) -> bool {
        !self.is_sentinel()
    }

    pub fn estimate(&self) -> LeverageEstimate {
        LeverageEstimate {
            leverage: self.leverage,
            equity_used: self.equity_used,
            method: self.calculation_method,
        }
    }

    pub fn has_resolved_leverage(&self) -> bool {
        self.estimate().is_resolved()
    }

    /// Notional at the best known price (mark, else entry).
    pub fn notional(&self) -> f64 {
        self.size * self.mark_price.unwrap_or(self.entry_price)
    }

    /// Copy with leverage fields replaced. Snapshots are never mutated in place.
    pub fn with_estimate(&self, estimate: LeverageEstimate) -> Self {
        PositionSnapshot {
            leverage: estimate.leverage,
            equity_used: estimate.equity_used,
            calculation_method: estimate.method,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquitySnapshot {
    pub wallet_id: WalletId,
    pub timestamp: DateTime<Utc>,
    pub total_equity: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub total_margin_used: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> PositionSnapshot {
        PositionSnapshot {
            id: None,
            wallet_id: 1,
            position_id: None,
            symbol: "BTC-USDT".into(),
            side: PositionSide::Long,
            size: 0.5,
            entry_price: 60_000.0,
            mark_price: Some(62_000.0),
            leverage: None,
            equity_used: None,
            calculation_method: CalculationMethod::Unknown,
            margin_total_at_snapshot: Some(100.0),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            opened_at: None,
        }
    }

    #[test]
    fn notional_prefers_mark_price() {
        let snap = sample();
        assert!((snap.notional() - 31_000.0).abs() < f64::EPSILON);

        let no_mark = PositionSnapshot {
            mark_price: None,
            ..sample()
        };
        assert!((no_mark.notional() - 30_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn with_estimate_leaves_original_untouched() {
        let snap = sample();
        let annotated =
            snap.with_estimate(LeverageEstimate::resolved(10.0, 3_100.0, CalculationMethod::MarginRate));
        assert!(snap.leverage.is_none());
        assert_eq!(annotated.leverage, Some(10.0));
        assert_eq!(annotated.calculation_method, CalculationMethod::MarginRate);
        assert!(annotated.has_resolved_leverage());
    }

    #[test]
    fn zero_size_is_sentinel() {
        let snap = PositionSnapshot {
            size: 0.0,
            ..sample()
        };
        assert!(snap.is_sentinel());
        assert!(!snap.is_open());
    }

    #[test]
    fn side_parses_exchange_spellings() {
        assert_eq!("b".parse::<PositionSide>(), Ok(PositionSide::Long));
        assert_eq!("SHORT".parse::<PositionSide>(), Ok(PositionSide::Short));
        assert!("flat".parse::<PositionSide>().is_err());
    }

    #[test]
    fn calculation_method_round_trip() {
        for m in [
            CalculationMethod::MarginDelta,
            CalculationMethod::MarginRate,
            CalculationMethod::Unknown,
        ] {
            assert_eq!(CalculationMethod::parse(m.as_str()), m);
        }
        assert_eq!(CalculationMethod::parse("pending"), CalculationMethod::Unknown);
    }
}
