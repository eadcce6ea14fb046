#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use posrecon::adapters::sqlite_adapter::SqliteAdapter;
use posrecon::domain::config_validation::EngineConfig;
use posrecon::domain::payload::{CycleInput, RawCycle};
use posrecon::domain::snapshot::WalletId;
use serde_json::{json, Value};

pub const WALLET: WalletId = 11;

pub fn store() -> SqliteAdapter {
    let store = SqliteAdapter::in_memory().unwrap();
    store.initialize_schema().unwrap();
    store
}

pub fn engine() -> EngineConfig {
    EngineConfig::default()
}

/// Minutes after a fixed base time.
pub fn t(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap() + Duration::minutes(min)
}

pub fn position(symbol: &str, side: &str, size: f64, entry: f64, mark: f64) -> Value {
    json!({
        "symbol": symbol,
        "side": side,
        "size": size,
        "entryPrice": entry,
        "markPrice": mark,
    })
}

pub fn with_margin_rate(mut position: Value, rate: f64) -> Value {
    position["initialMarginRate"] = json!(rate.to_string());
    position
}

pub fn fill(
    symbol: &str,
    side: &str,
    size: f64,
    price: f64,
    reduce_only: bool,
    fee: f64,
    at: DateTime<Utc>,
) -> Value {
    json!({
        "symbol": symbol,
        "side": side,
        "size": size,
        "price": price,
        "reduceOnly": reduce_only,
        "fee": fee,
        "timestamp": at.to_rfc3339(),
    })
}

pub struct CycleBuilder {
    raw: RawCycle,
}

impl CycleBuilder {
    pub fn new(wallet_id: WalletId, at: DateTime<Utc>) -> Self {
        Self {
            raw: RawCycle {
                wallet_id,
                cycle_time: json!(at.to_rfc3339()),
                equity: None,
                positions: Vec::new(),
                fills: Vec::new(),
            },
        }
    }

    pub fn margin(mut self, total_margin_used: f64) -> Self {
        self.raw.equity = Some(json!({
            "totalEquity": 10_000.0,
            "availableBalance": 10_000.0 - total_margin_used,
            "unrealizedPnl": 0.0,
            "realizedPnl": 0.0,
            "totalMarginUsed": total_margin_used,
        }));
        self
    }

    pub fn position(mut self, position: Value) -> Self {
        self.raw.positions.push(position);
        self
    }

    pub fn fill(mut self, fill: Value) -> Self {
        self.raw.fills.push(fill);
        self
    }

    pub fn raw(self) -> RawCycle {
        self.raw
    }

    pub fn build(self) -> CycleInput {
        CycleInput::from_raw(&self.raw, Utc::now())
    }
}
