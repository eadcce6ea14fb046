//! SQLite ledger adapter.
//!
//! Timestamps are stored as epoch milliseconds. Derived rows are written with
//! `INSERT ... ON CONFLICT ... DO UPDATE` on their natural keys.

use crate::domain::config_validation::database_pool_size;
use crate::domain::error::ReconError;
use crate::domain::leg::{FillSide, ReduceOnly, TradeLeg};
use crate::domain::position::Position;
use crate::domain::snapshot::{
    CalculationMethod, EquitySnapshot, LeverageEstimate, PositionSide, PositionSnapshot,
    SnapshotId, WalletId,
};
use crate::domain::strategy::{Strategy, StrategyAssignment};
use crate::domain::timeutil::from_millis;
use crate::domain::trade::AggregatedTrade;
use crate::ports::config_port::ConfigPort;
use crate::ports::store_port::{LedgerStore, MarginHistory, UpsertOutcome};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashSet;
use std::str::FromStr;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS equity_snapshots (
    wallet_id INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    total_equity REAL NOT NULL,
    available_balance REAL NOT NULL,
    unrealized_pnl REAL NOT NULL,
    realized_pnl REAL NOT NULL,
    total_margin_used REAL,
    PRIMARY KEY (wallet_id, timestamp)
);

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    opened_at INTEGER NOT NULL,
    closed_at INTEGER,
    entry_price REAL NOT NULL,
    exit_price REAL,
    realized_pnl REAL,
    UNIQUE (wallet_id, symbol, opened_at)
);

CREATE TABLE IF NOT EXISTS position_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL,
    position_id INTEGER REFERENCES positions(id),
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    entry_price REAL NOT NULL,
    mark_price REAL,
    leverage REAL,
    equity_used REAL,
    calculation_method TEXT NOT NULL,
    margin_total_at_snapshot REAL,
    timestamp INTEGER NOT NULL,
    opened_at INTEGER,
    UNIQUE (wallet_id, symbol, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_wallet_ts ON position_snapshots(wallet_id, timestamp);

CREATE TABLE IF NOT EXISTS trade_legs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL NOT NULL,
    open_fee REAL,
    close_fee REAL,
    liquidate_fee REAL,
    reduce_only INTEGER,
    timestamp INTEGER NOT NULL,
    strategy_id INTEGER,
    leverage REAL,
    equity_used REAL,
    UNIQUE (wallet_id, symbol, timestamp, size)
);

CREATE TABLE IF NOT EXISTS aggregated_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    avg_entry_price REAL NOT NULL,
    avg_exit_price REAL NOT NULL,
    total_pnl REAL NOT NULL,
    fees REAL NOT NULL,
    leverage REAL,
    equity_used REAL,
    strategy_id INTEGER,
    fill_count INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    opened_at INTEGER NOT NULL,
    UNIQUE (wallet_id, timestamp, symbol)
);
CREATE INDEX IF NOT EXISTS idx_trades_ts ON aggregated_trades(timestamp);

CREATE TABLE IF NOT EXISTS strategies (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS strategy_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    strategy_id INTEGER NOT NULL REFERENCES strategies(id),
    start_at INTEGER NOT NULL,
    end_at INTEGER,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (wallet_id, symbol, strategy_id, start_at)
);
CREATE INDEX IF NOT EXISTS idx_assignments_wallet_symbol ON strategy_assignments(wallet_id, symbol);
";

const SNAPSHOT_COLUMNS: &str = "id, wallet_id, position_id, symbol, side, size, entry_price, \
     mark_price, leverage, equity_used, calculation_method, margin_total_at_snapshot, timestamp, opened_at";

const POSITION_COLUMNS: &str =
    "id, wallet_id, symbol, side, opened_at, closed_at, entry_price, exit_price, realized_pnl";

const LEG_COLUMNS: &str = "wallet_id, symbol, side, size, entry_price, exit_price, open_fee, \
     close_fee, liquidate_fee, reduce_only, timestamp, strategy_id, leverage, equity_used";

const TRADE_COLUMNS: &str = "wallet_id, symbol, side, size, avg_entry_price, avg_exit_price, \
     total_pnl, fees, leverage, equity_used, strategy_id, fill_count, timestamp, opened_at";

const ASSIGNMENT_COLUMNS: &str = "id, wallet_id, symbol, strategy_id, start_at, end_at, active";

type Conn = PooledConnection<SqliteConnectionManager>;

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, ReconError> {
        let db_path =
            config
                .get_string("database", "path")
                .ok_or_else(|| ReconError::ConfigMissing {
                    section: "database".into(),
                    key: "path".into(),
                })?;

        let pool_size = database_pool_size(config)?;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(ReconError::db)?;

        tracing::debug!(path = %db_path, pool_size, "opened sqlite ledger");
        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, ReconError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(ReconError::db)?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), ReconError> {
        self.conn()?.execute_batch(SCHEMA).map_err(ReconError::query)
    }

    fn conn(&self) -> Result<Conn, ReconError> {
        self.pool.get().map_err(ReconError::db)
    }

    fn query_snapshot(
        &self,
        sql_where: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<PositionSnapshot>, ReconError> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM position_snapshots WHERE {sql_where}");
        self.conn()?
            .query_row(&sql, args, snapshot_from_row)
            .optional()
            .map_err(ReconError::query)
    }
}

fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    from_millis(raw).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(raw) => from_millis(raw)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, raw)),
        None => Ok(None),
    }
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<PositionSnapshot> {
    let method: String = row.get(10)?;
    Ok(PositionSnapshot {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        position_id: row.get(2)?,
        symbol: row.get(3)?,
        side: parsed_col(row, 4)?,
        size: row.get(5)?,
        entry_price: row.get(6)?,
        mark_price: row.get(7)?,
        leverage: row.get(8)?,
        equity_used: row.get(9)?,
        calculation_method: CalculationMethod::parse(&method),
        margin_total_at_snapshot: row.get(11)?,
        timestamp: ts_col(row, 12)?,
        opened_at: opt_ts_col(row, 13)?,
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        symbol: row.get(2)?,
        side: parsed_col(row, 3)?,
        opened_at: ts_col(row, 4)?,
        closed_at: opt_ts_col(row, 5)?,
        entry_price: row.get(6)?,
        exit_price: row.get(7)?,
        realized_pnl: row.get(8)?,
    })
}

fn leg_from_row(row: &Row<'_>) -> rusqlite::Result<TradeLeg> {
    Ok(TradeLeg {
        wallet_id: row.get(0)?,
        symbol: row.get(1)?,
        side: parsed_col::<FillSide>(row, 2)?,
        size: row.get(3)?,
        entry_price: row.get(4)?,
        exit_price: row.get(5)?,
        open_fee: row.get(6)?,
        close_fee: row.get(7)?,
        liquidate_fee: row.get(8)?,
        reduce_only: ReduceOnly::from_flag(row.get(9)?),
        timestamp: ts_col(row, 10)?,
        strategy_id: row.get(11)?,
        leverage: row.get(12)?,
        equity_used: row.get(13)?,
    })
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<AggregatedTrade> {
    Ok(AggregatedTrade {
        wallet_id: row.get(0)?,
        symbol: row.get(1)?,
        side: parsed_col(row, 2)?,
        size: row.get(3)?,
        avg_entry_price: row.get(4)?,
        avg_exit_price: row.get(5)?,
        total_pnl: row.get(6)?,
        fees: row.get(7)?,
        leverage: row.get(8)?,
        equity_used: row.get(9)?,
        strategy_id: row.get(10)?,
        fill_count: row.get(11)?,
        timestamp: ts_col(row, 12)?,
        opened_at: ts_col(row, 13)?,
    })
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<StrategyAssignment> {
    Ok(StrategyAssignment {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        symbol: row.get(2)?,
        strategy_id: row.get(3)?,
        start_at: ts_col(row, 4)?,
        end_at: opt_ts_col(row, 5)?,
        active: row.get(6)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>, ReconError> {
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(ReconError::query)
}

fn outcome(existed: bool) -> UpsertOutcome {
    if existed {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    }
}

impl MarginHistory for SqliteAdapter {
    fn margin_before(
        &self,
        wallet_id: WalletId,
        before: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<Option<f64>, ReconError> {
        self.conn()?
            .query_row(
                "SELECT total_margin_used FROM equity_snapshots
                 WHERE wallet_id = ?1 AND timestamp < ?2 AND timestamp >= ?3
                   AND total_margin_used IS NOT NULL
                 ORDER BY timestamp DESC LIMIT 1",
                params![wallet_id, ms(before), ms(not_before)],
                |row| row.get(0),
            )
            .optional()
            .map_err(ReconError::query)
    }
}

impl LedgerStore for SqliteAdapter {
    fn upsert_equity_snapshot(&self, s: &EquitySnapshot) -> Result<(), ReconError> {
        self.conn()?
            .execute(
                "INSERT INTO equity_snapshots (wallet_id, timestamp, total_equity, available_balance,
                     unrealized_pnl, realized_pnl, total_margin_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (wallet_id, timestamp) DO UPDATE SET
                     total_equity = excluded.total_equity,
                     available_balance = excluded.available_balance,
                     unrealized_pnl = excluded.unrealized_pnl,
                     realized_pnl = excluded.realized_pnl,
                     total_margin_used = excluded.total_margin_used",
                params![
                    s.wallet_id,
                    ms(s.timestamp),
                    s.total_equity,
                    s.available_balance,
                    s.unrealized_pnl,
                    s.realized_pnl,
                    s.total_margin_used
                ],
            )
            .map_err(ReconError::query)?;
        Ok(())
    }

    fn upsert_position_snapshot(&self, s: &PositionSnapshot) -> Result<SnapshotId, ReconError> {
        // Once a snapshot carries leverage, replays keep it.
        self.conn()?
            .query_row(
                "INSERT INTO position_snapshots (wallet_id, position_id, symbol, side, size,
                     entry_price, mark_price, leverage, equity_used, calculation_method,
                     margin_total_at_snapshot, timestamp, opened_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT (wallet_id, symbol, timestamp) DO UPDATE SET
                     position_id = excluded.position_id,
                     side = excluded.side,
                     size = excluded.size,
                     entry_price = excluded.entry_price,
                     mark_price = excluded.mark_price,
                     leverage = COALESCE(position_snapshots.leverage, excluded.leverage),
                     equity_used = CASE WHEN position_snapshots.leverage IS NULL
                         THEN excluded.equity_used ELSE position_snapshots.equity_used END,
                     calculation_method = CASE WHEN position_snapshots.leverage IS NULL
                         THEN excluded.calculation_method ELSE position_snapshots.calculation_method END,
                     margin_total_at_snapshot = excluded.margin_total_at_snapshot,
                     opened_at = excluded.opened_at
                 RETURNING id",
                params![
                    s.wallet_id,
                    s.position_id,
                    s.symbol,
                    s.side.as_str(),
                    s.size,
                    s.entry_price,
                    s.mark_price,
                    s.leverage,
                    s.equity_used,
                    s.calculation_method.as_str(),
                    s.margin_total_at_snapshot,
                    ms(s.timestamp),
                    s.opened_at.map(ms)
                ],
                |row| row.get(0),
            )
            .map_err(ReconError::query)
    }

    fn latest_snapshot_before(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshot>, ReconError> {
        self.query_snapshot(
            "wallet_id = ?1 AND symbol = ?2 AND timestamp < ?3 ORDER BY timestamp DESC LIMIT 1",
            params![wallet_id, symbol, ms(before)],
        )
    }

    fn session_head(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        opened_at: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshot>, ReconError> {
        self.query_snapshot(
            "wallet_id = ?1 AND symbol = ?2 AND timestamp = ?3 AND size > 0",
            params![wallet_id, symbol, ms(opened_at)],
        )
    }

    fn fill_pending_leverage(
        &self,
        id: SnapshotId,
        estimate: &LeverageEstimate,
    ) -> Result<bool, ReconError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE position_snapshots
                 SET leverage = ?2, equity_used = ?3, calculation_method = ?4
                 WHERE id = ?1 AND leverage IS NULL",
                params![
                    id,
                    estimate.leverage,
                    estimate.equity_used,
                    estimate.method.as_str()
                ],
            )
            .map_err(ReconError::query)?;
        Ok(changed > 0)
    }

    fn latest_open_snapshots(
        &self,
        wallet_id: Option<WalletId>,
    ) -> Result<Vec<PositionSnapshot>, ReconError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM position_snapshots s
             WHERE s.size > 0 AND (?1 IS NULL OR s.wallet_id = ?1)
               AND s.timestamp = (SELECT MAX(l.timestamp) FROM position_snapshots l
                                  WHERE l.wallet_id = s.wallet_id AND l.symbol = s.symbol)
             ORDER BY s.wallet_id, s.symbol"
        );
        let mut stmt = conn.prepare(&sql).map_err(ReconError::query)?;
        let rows = stmt
            .query_map(params![wallet_id], snapshot_from_row)
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn first_open_snapshot_between(
        &self,
        wallet_id: WalletId,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshot>, ReconError> {
        self.query_snapshot(
            "wallet_id = ?1 AND symbol = ?2 AND timestamp >= ?3 AND timestamp <= ?4 AND size > 0
             ORDER BY timestamp ASC LIMIT 1",
            params![wallet_id, symbol, ms(from), ms(to)],
        )
    }

    fn open_position(&self, p: &Position) -> Result<i64, ReconError> {
        self.conn()?
            .query_row(
                "INSERT INTO positions (wallet_id, symbol, side, opened_at, entry_price)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (wallet_id, symbol, opened_at) DO UPDATE SET side = excluded.side
                 RETURNING id",
                params![
                    p.wallet_id,
                    p.symbol,
                    p.side.as_str(),
                    ms(p.opened_at),
                    p.entry_price
                ],
                |row| row.get(0),
            )
            .map_err(ReconError::query)
    }

    fn close_position(&self, id: i64, closed_at: DateTime<Utc>) -> Result<(), ReconError> {
        self.conn()?
            .execute(
                "UPDATE positions SET closed_at = COALESCE(closed_at, ?2) WHERE id = ?1",
                params![id, ms(closed_at)],
            )
            .map_err(ReconError::query)?;
        Ok(())
    }

    fn settle_position(
        &self,
        id: i64,
        closed_at: DateTime<Utc>,
        exit_price: f64,
        realized_pnl: f64,
    ) -> Result<(), ReconError> {
        self.conn()?
            .execute(
                "UPDATE positions
                 SET closed_at = COALESCE(closed_at, ?2), exit_price = ?3, realized_pnl = ?4
                 WHERE id = ?1",
                params![id, ms(closed_at), exit_price, realized_pnl],
            )
            .map_err(ReconError::query)?;
        Ok(())
    }

    fn clear_settlement(&self, id: i64) -> Result<(), ReconError> {
        self.conn()?
            .execute(
                "UPDATE positions SET exit_price = NULL, realized_pnl = NULL WHERE id = ?1",
                params![id],
            )
            .map_err(ReconError::query)?;
        Ok(())
    }

    fn positions(&self, wallet_id: Option<WalletId>) -> Result<Vec<Position>, ReconError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE (?1 IS NULL OR wallet_id = ?1) ORDER BY opened_at"
        );
        let mut stmt = conn.prepare(&sql).map_err(ReconError::query)?;
        let rows = stmt
            .query_map(params![wallet_id], position_from_row)
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn upsert_leg(&self, leg: &TradeLeg) -> Result<UpsertOutcome, ReconError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(ReconError::query)?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM trade_legs
                 WHERE wallet_id = ?1 AND symbol = ?2 AND timestamp = ?3 AND size = ?4",
                params![leg.wallet_id, leg.symbol, ms(leg.timestamp), leg.size],
                |_| Ok(()),
            )
            .optional()
            .map_err(ReconError::query)?
            .is_some();

        tx.execute(
            &format!(
                "INSERT INTO trade_legs ({LEG_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT (wallet_id, symbol, timestamp, size) DO UPDATE SET
                     side = excluded.side,
                     entry_price = excluded.entry_price,
                     exit_price = excluded.exit_price,
                     open_fee = excluded.open_fee,
                     close_fee = excluded.close_fee,
                     liquidate_fee = excluded.liquidate_fee,
                     reduce_only = excluded.reduce_only,
                     strategy_id = COALESCE(excluded.strategy_id, trade_legs.strategy_id),
                     leverage = COALESCE(trade_legs.leverage, excluded.leverage),
                     equity_used = COALESCE(trade_legs.equity_used, excluded.equity_used)"
            ),
            params![
                leg.wallet_id,
                leg.symbol,
                leg.side.as_str(),
                leg.size,
                leg.entry_price,
                leg.exit_price,
                leg.open_fee,
                leg.close_fee,
                leg.liquidate_fee,
                leg.reduce_only.to_flag(),
                ms(leg.timestamp),
                leg.strategy_id,
                leg.leverage,
                leg.equity_used
            ],
        )
        .map_err(ReconError::query)?;
        tx.commit().map_err(ReconError::query)?;
        Ok(outcome(existed))
    }

    fn legs_for_wallet(&self, wallet_id: WalletId) -> Result<Vec<TradeLeg>, ReconError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {LEG_COLUMNS} FROM trade_legs WHERE wallet_id = ?1 ORDER BY timestamp, id"
        );
        let mut stmt = conn.prepare(&sql).map_err(ReconError::query)?;
        let rows = stmt
            .query_map(params![wallet_id], leg_from_row)
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn upsert_aggregated_trade(&self, t: &AggregatedTrade) -> Result<UpsertOutcome, ReconError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(ReconError::query)?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM aggregated_trades
                 WHERE wallet_id = ?1 AND timestamp = ?2 AND symbol = ?3",
                params![t.wallet_id, ms(t.timestamp), t.symbol],
                |_| Ok(()),
            )
            .optional()
            .map_err(ReconError::query)?
            .is_some();

        tx.execute(
            &format!(
                "INSERT INTO aggregated_trades ({TRADE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT (wallet_id, timestamp, symbol) DO UPDATE SET
                     side = excluded.side,
                     size = excluded.size,
                     avg_entry_price = excluded.avg_entry_price,
                     avg_exit_price = excluded.avg_exit_price,
                     total_pnl = excluded.total_pnl,
                     fees = excluded.fees,
                     leverage = COALESCE(excluded.leverage, aggregated_trades.leverage),
                     equity_used = COALESCE(excluded.equity_used, aggregated_trades.equity_used),
                     strategy_id = excluded.strategy_id,
                     fill_count = excluded.fill_count,
                     opened_at = excluded.opened_at"
            ),
            params![
                t.wallet_id,
                t.symbol,
                t.side.as_str(),
                t.size,
                t.avg_entry_price,
                t.avg_exit_price,
                t.total_pnl,
                t.fees,
                t.leverage,
                t.equity_used,
                t.strategy_id,
                t.fill_count,
                ms(t.timestamp),
                ms(t.opened_at)
            ],
        )
        .map_err(ReconError::query)?;
        tx.commit().map_err(ReconError::query)?;
        Ok(outcome(existed))
    }

    fn retain_aggregated_trades(
        &self,
        wallet_id: WalletId,
        keep: &[(DateTime<Utc>, &str)],
    ) -> Result<usize, ReconError> {
        let keep: HashSet<(i64, String)> = keep
            .iter()
            .map(|(ts, symbol)| (ms(*ts), symbol.to_string()))
            .collect();

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(ReconError::query)?;
        let stale: Vec<i64> = {
            let mut stmt = tx
                .prepare("SELECT id, timestamp, symbol FROM aggregated_trades WHERE wallet_id = ?1")
                .map_err(ReconError::query)?;
            let rows = stmt
                .query_map(params![wallet_id], |row| {
                    Ok((row.get::<_, i64>(0)?, (row.get::<_, i64>(1)?, row.get::<_, String>(2)?)))
                })
                .map_err(ReconError::query)?;
            collect(rows)?
                .into_iter()
                .filter(|(_, key)| !keep.contains(key))
                .map(|(id, _)| id)
                .collect()
        };
        for id in &stale {
            tx.execute("DELETE FROM aggregated_trades WHERE id = ?1", params![id])
                .map_err(ReconError::query)?;
        }
        tx.commit().map_err(ReconError::query)?;
        Ok(stale.len())
    }

    fn aggregated_trades(
        &self,
        wallet_id: Option<WalletId>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AggregatedTrade>, ReconError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM aggregated_trades
             WHERE (?1 IS NULL OR wallet_id = ?1)
               AND (?2 IS NULL OR timestamp >= ?2)
               AND (?3 IS NULL OR timestamp < ?3)
             ORDER BY timestamp DESC"
        );
        let mut stmt = conn.prepare(&sql).map_err(ReconError::query)?;
        let rows = stmt
            .query_map(
                params![wallet_id, start.map(ms), end.map(ms)],
                trade_from_row,
            )
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn wallet_ids(&self) -> Result<Vec<WalletId>, ReconError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT wallet_id FROM equity_snapshots
                 UNION SELECT wallet_id FROM position_snapshots
                 UNION SELECT wallet_id FROM trade_legs
                 ORDER BY 1",
            )
            .map_err(ReconError::query)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn upsert_strategy(&self, s: &Strategy) -> Result<(), ReconError> {
        self.conn()?
            .execute(
                "INSERT INTO strategies (id, name, description) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET
                     name = excluded.name,
                     description = excluded.description",
                params![s.id, s.name, s.description],
            )
            .map_err(ReconError::query)?;
        Ok(())
    }

    fn strategies(&self) -> Result<Vec<Strategy>, ReconError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, description FROM strategies ORDER BY name")
            .map_err(ReconError::query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Strategy {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            })
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn insert_assignment(&self, a: &StrategyAssignment) -> Result<i64, ReconError> {
        self.conn()?
            .query_row(
                "INSERT INTO strategy_assignments (wallet_id, symbol, strategy_id, start_at, end_at, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (wallet_id, symbol, strategy_id, start_at) DO UPDATE SET
                     end_at = excluded.end_at,
                     active = excluded.active
                 RETURNING id",
                params![
                    a.wallet_id,
                    a.symbol,
                    a.strategy_id,
                    ms(a.start_at),
                    a.end_at.map(ms),
                    a.active
                ],
                |row| row.get(0),
            )
            .map_err(ReconError::query)
    }

    fn assignments(&self, wallet_id: Option<WalletId>) -> Result<Vec<StrategyAssignment>, ReconError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM strategy_assignments
             WHERE (?1 IS NULL OR wallet_id = ?1)
             ORDER BY wallet_id, symbol, start_at DESC"
        );
        let mut stmt = conn.prepare(&sql).map_err(ReconError::query)?;
        let rows = stmt
            .query_map(params![wallet_id], assignment_from_row)
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn assignments_for(
        &self,
        wallet_id: WalletId,
        symbol: &str,
    ) -> Result<Vec<StrategyAssignment>, ReconError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM strategy_assignments
             WHERE wallet_id = ?1 AND symbol = ?2
             ORDER BY start_at DESC"
        );
        let mut stmt = conn.prepare(&sql).map_err(ReconError::query)?;
        let rows = stmt
            .query_map(params![wallet_id, symbol], assignment_from_row)
            .map_err(ReconError::query)?;
        collect(rows)
    }

    fn end_assignment(&self, id: i64, at: DateTime<Utc>) -> Result<bool, ReconError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE strategy_assignments SET end_at = ?2, active = 0 WHERE id = ?1",
                params![id, ms(at)],
            )
            .map_err(ReconError::query)?;
        Ok(changed > 0)
    }
}
