//! Exchange payload decoding.
//!
//! Feeds disagree on key spelling and on whether numbers arrive as JSON
//! numbers or strings. Decoding is lenient: a malformed numeric field falls
//! back to its default with a warning, and an entry that cannot be
//! interpreted at all is skipped with a warning. One bad entry never aborts
//! the cycle.

use super::leg::{FillSide, ReduceOnly, TradeLeg};
use super::snapshot::{EquitySnapshot, LeverageEstimate, PositionSide, WalletId};
use super::symbol::normalize_symbol;
use super::timeutil::{from_millis, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Keys carrying the initial margin rate on position payloads.
const MARGIN_RATE_KEYS: [&str; 3] = ["customInitialMarginRate", "initialMarginRate", "marginRate"];
const MARK_PRICE_KEYS: [&str; 3] = ["markPx", "markPrice", "mark_price"];

/// One wallet's refresh as delivered by the feed, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCycle {
    pub wallet_id: WalletId,
    #[serde(default)]
    pub cycle_time: Value,
    #[serde(default)]
    pub equity: Option<Value>,
    #[serde(default)]
    pub positions: Vec<Value>,
    #[serde(default)]
    pub fills: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionPush {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub margin_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub symbol: String,
    pub side: FillSide,
    pub size: f64,
    pub price: f64,
    /// Position entry price reported on closing fills, if any.
    pub entry_price: Option<f64>,
    pub fee: Option<f64>,
    pub reduce_only: Option<bool>,
    pub trade_type: String,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    pub fn is_liquidation(&self) -> bool {
        self.trade_type.eq_ignore_ascii_case("liquidation")
    }
}

/// Validated input for one reconciliation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleInput {
    pub wallet_id: WalletId,
    pub cycle_time: DateTime<Utc>,
    pub equity: Option<EquitySnapshot>,
    pub positions: Vec<PositionPush>,
    pub fills: Vec<FillEvent>,
}

impl CycleInput {
    /// Decode a raw cycle. The cycle time is the feed's own timestamp when
    /// present, else the equity timestamp, else `ingested_at`.
    pub fn from_raw(raw: &RawCycle, ingested_at: DateTime<Utc>) -> Self {
        let wallet_id = raw.wallet_id;
        let cycle_time = timestamp_value(&raw.cycle_time)
            .or_else(|| {
                raw.equity
                    .as_ref()
                    .and_then(|e| field(e, &["timestamp", "time"]))
                    .and_then(timestamp_value)
            })
            .unwrap_or(ingested_at);

        let equity = raw
            .equity
            .as_ref()
            .map(|e| decode_equity(wallet_id, e, cycle_time));
        let positions = raw
            .positions
            .iter()
            .filter_map(|p| decode_position(wallet_id, p))
            .collect();
        let fills = raw
            .fills
            .iter()
            .filter_map(|f| decode_fill(wallet_id, f, cycle_time))
            .collect();

        CycleInput {
            wallet_id,
            cycle_time,
            equity,
            positions,
            fills,
        }
    }

    pub fn total_margin(&self) -> Option<f64> {
        self.equity.as_ref().and_then(|e| e.total_margin_used)
    }
}

fn field<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null())
}

fn parse_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// Lenient float: absent is `default` silently, malformed is `default` with
/// a warning.
pub fn sanitize_float(value: Option<&Value>, default: f64, name: &str) -> f64 {
    match value {
        None => default,
        Some(v) => parse_number(v).unwrap_or_else(|| {
            tracing::warn!(field = name, raw = %v, "malformed number, using default");
            default
        }),
    }
}

/// Like [`sanitize_float`] for nullable fields.
pub fn optional_float(value: Option<&Value>, name: &str) -> Option<f64> {
    let v = value?;
    let parsed = parse_number(v);
    if parsed.is_none() {
        tracing::warn!(field = name, raw = %v, "malformed number, treating as missing");
    }
    parsed
}

fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_millis),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    match field(value, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Initial margin rate from a raw position payload.
pub fn margin_rate(raw: &Value) -> Option<f64> {
    optional_float(field(raw, &MARGIN_RATE_KEYS), "margin_rate").filter(|r| *r > 0.0)
}

/// Mark price from a raw position payload, else `positionValue / size`.
pub fn mark_price(raw: &Value, size: f64) -> Option<f64> {
    if let Some(px) = optional_float(field(raw, &MARK_PRICE_KEYS), "mark_price") {
        return Some(px);
    }
    let value = optional_float(field(raw, &["positionValue", "position_value"]), "position_value")?;
    (size > 0.0).then(|| value.abs() / size)
}

fn decode_equity(wallet_id: WalletId, raw: &Value, timestamp: DateTime<Utc>) -> EquitySnapshot {
    EquitySnapshot {
        wallet_id,
        timestamp,
        total_equity: sanitize_float(
            field(raw, &["totalEquity", "total_equity", "accountValue"]),
            0.0,
            "total_equity",
        ),
        available_balance: sanitize_float(
            field(raw, &["availableBalance", "available_balance", "withdrawable"]),
            0.0,
            "available_balance",
        ),
        unrealized_pnl: sanitize_float(
            field(raw, &["unrealizedPnl", "unrealized_pnl"]),
            0.0,
            "unrealized_pnl",
        ),
        realized_pnl: sanitize_float(
            field(raw, &["realizedPnl", "realized_pnl"]),
            0.0,
            "realized_pnl",
        ),
        total_margin_used: optional_float(
            field(raw, &["totalMarginUsed", "total_margin_used"]),
            "total_margin_used",
        ),
    }
}

fn decode_position(wallet_id: WalletId, raw: &Value) -> Option<PositionPush> {
    let Some(symbol) = string_field(raw, &["symbol", "coin"]) else {
        tracing::warn!(wallet = wallet_id, raw = %raw, "position without symbol, skipping");
        return None;
    };
    let symbol = normalize_symbol(&symbol);
    let signed_size = sanitize_float(field(raw, &["size", "szi", "contracts"]), 0.0, "size");
    let side = match string_field(raw, &["side", "holdSide"]) {
        Some(s) => match s.parse::<PositionSide>() {
            Ok(side) => side,
            Err(e) => {
                tracing::warn!(wallet = wallet_id, symbol = %symbol, error = %e, "skipping position");
                return None;
            }
        },
        None if signed_size < 0.0 => PositionSide::Short,
        None => PositionSide::Long,
    };
    let size = signed_size.abs();

    Some(PositionPush {
        entry_price: sanitize_float(
            field(raw, &["entryPrice", "entry_price", "entryPx"]),
            0.0,
            "entry_price",
        ),
        mark_price: mark_price(raw, size),
        margin_rate: margin_rate(raw),
        symbol,
        side,
        size,
    })
}

fn decode_fill(wallet_id: WalletId, raw: &Value, cycle_time: DateTime<Utc>) -> Option<FillEvent> {
    let Some(symbol) = string_field(raw, &["symbol", "coin"]) else {
        tracing::warn!(wallet = wallet_id, raw = %raw, "fill without symbol, skipping");
        return None;
    };
    let symbol = normalize_symbol(&symbol);
    let side = match string_field(raw, &["side", "dir"]).map(|s| s.parse::<FillSide>()) {
        Some(Ok(side)) => side,
        Some(Err(e)) => {
            tracing::warn!(wallet = wallet_id, symbol = %symbol, error = %e, "skipping fill");
            return None;
        }
        None => {
            tracing::warn!(wallet = wallet_id, symbol = %symbol, "fill without side, skipping");
            return None;
        }
    };
    let size = sanitize_float(field(raw, &["size", "sz", "qty"]), 0.0, "size").abs();
    if size <= 0.0 {
        tracing::warn!(wallet = wallet_id, symbol = %symbol, "fill with zero size, skipping");
        return None;
    }
    let timestamp = field(raw, &["timestamp", "time", "createdAt"])
        .and_then(timestamp_value)
        .unwrap_or_else(|| {
            tracing::warn!(wallet = wallet_id, symbol = %symbol, "fill without timestamp, using cycle time");
            cycle_time
        });
    let reduce_only = match field(raw, &["reduceOnly", "reduce_only"]) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    };

    Some(FillEvent {
        price: sanitize_float(field(raw, &["price", "px", "execPrice"]), 0.0, "price"),
        entry_price: optional_float(field(raw, &["entryPrice", "entry_price"]), "entry_price"),
        fee: optional_float(field(raw, &["fee", "fees"]), "fee"),
        trade_type: string_field(raw, &["tradeType", "trade_type"]).unwrap_or_default(),
        symbol,
        side,
        size,
        reduce_only,
        timestamp,
    })
}

/// Convert a fill into a stored leg. Fees land in the open, close or
/// liquidation bucket depending on what the fill did.
pub fn fill_to_leg(
    wallet_id: WalletId,
    fill: &FillEvent,
    strategy_id: Option<i64>,
    leverage: Option<LeverageEstimate>,
) -> TradeLeg {
    let reduce_only = ReduceOnly::from_flag(fill.reduce_only);
    let opening = reduce_only == ReduceOnly::Opening;
    let (open_fee, close_fee, liquidate_fee) = if opening {
        (fill.fee, None, None)
    } else if fill.is_liquidation() {
        (None, None, fill.fee)
    } else {
        (None, fill.fee, None)
    };
    let (entry_price, exit_price) = if opening {
        (fill.price, 0.0)
    } else {
        (fill.entry_price.unwrap_or(fill.price), fill.price)
    };

    TradeLeg {
        wallet_id,
        symbol: fill.symbol.clone(),
        side: fill.side,
        size: fill.size,
        entry_price,
        exit_price,
        open_fee,
        close_fee,
        liquidate_fee,
        reduce_only,
        timestamp: fill.timestamp,
        strategy_id,
        leverage: leverage.and_then(|e| e.leverage),
        equity_used: leverage.and_then(|e| e.equity_used),
    }
}
