//! Raw executed fills ("legs").

use super::snapshot::{PositionSide, WalletId};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Direction of a single fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillSide {
    Buy,
    Sell,
}

impl FillSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillSide::Buy => "BUY",
            FillSide::Sell => "SELL",
        }
    }

    /// Position direction implied when this fill opens a position.
    pub fn opened_side(&self) -> PositionSide {
        match self {
            FillSide::Buy => PositionSide::Long,
            FillSide::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for FillSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FillSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "b" | "bid" | "long" => Ok(FillSide::Buy),
            "sell" | "a" | "ask" | "short" => Ok(FillSide::Sell),
            other => Err(format!("unknown fill side: {other:?}")),
        }
    }
}

/// Exchange `reduce_only` flag. Older fills were stored without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOnly {
    Opening,
    Closing,
    Unknown,
}

impl ReduceOnly {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(false) => ReduceOnly::Opening,
            Some(true) => ReduceOnly::Closing,
            None => ReduceOnly::Unknown,
        }
    }

    pub fn to_flag(self) -> Option<bool> {
        match self {
            ReduceOnly::Opening => Some(false),
            ReduceOnly::Closing => Some(true),
            ReduceOnly::Unknown => None,
        }
    }

    /// Legs with no flag are matched as closers. Legacy fills predate the
    /// flag and were overwhelmingly closing fills; they can still only pair
    /// with an explicit opener inside the size tolerance.
    pub fn is_closing_candidate(self) -> bool {
        matches!(self, ReduceOnly::Closing | ReduceOnly::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeLeg {
    pub wallet_id: WalletId,
    pub symbol: String,
    pub side: FillSide,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub open_fee: Option<f64>,
    pub close_fee: Option<f64>,
    pub liquidate_fee: Option<f64>,
    pub reduce_only: ReduceOnly,
    pub timestamp: DateTime<Utc>,
    pub strategy_id: Option<i64>,
    pub leverage: Option<f64>,
    pub equity_used: Option<f64>,
}

impl TradeLeg {
    pub fn total_fees(&self) -> f64 {
        self.open_fee.unwrap_or(0.0) + self.close_fee.unwrap_or(0.0) + self.liquidate_fee.unwrap_or(0.0)
    }
}
