//! CLI definition and dispatch.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::csv_adapter::CsvAssignmentAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::json_feed_adapter::JsonFeedAdapter;
use crate::adapters::sqlite_adapter::SqliteAdapter;
use crate::domain::attribution::StrategyAttributor;
use crate::domain::config_validation::{build_engine_config, EngineConfig};
use crate::domain::error::ReconError;
use crate::domain::matrix::{build_strategy_matrix, MatrixRow};
use crate::domain::performance::{strategy_performance, symbol_performance, GroupPerformance, TradeStats};
use crate::domain::reconcile::{aggregate_wallet, open_positions, reconcile_all, BatchReport};
use crate::domain::snapshot::WalletId;
use crate::domain::symbol::validate_symbol;
use crate::domain::timeutil::parse_timestamp;
use crate::logging::{init_logging, LoggingConfig};
use crate::ports::feed_port::{AssignmentSource, FeedPort};
use crate::ports::store_port::LedgerStore;

#[derive(Parser, Debug)]
#[command(name = "posrecon", about = "Exchange position and trade reconciliation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the ledger schema
    InitDb {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Reconcile one or more refresh cycles from a JSON feed file
    Refresh {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        feed: PathBuf,
    },
    /// Rebuild aggregated trades from stored legs
    Aggregate {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        wallet: Option<WalletId>,
    },
    /// Show the strategy assigned to a wallet/symbol at a point in time
    Resolve {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        wallet: WalletId,
        #[arg(long)]
        symbol: String,
        #[arg(long, value_parser = parse_time_arg)]
        at: Option<DateTime<Utc>>,
    },
    /// Import strategies and assignments from a CSV export
    ImportAssignments {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Mark an assignment ended
    EndAssignment {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
        #[arg(long, value_parser = parse_time_arg)]
        at: Option<DateTime<Utc>>,
    },
    /// List open positions with their strategy
    Positions {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        wallet: Option<WalletId>,
    },
    /// Realized performance over a period, overall and per strategy/symbol
    Report {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, value_parser = parse_time_arg)]
        start: DateTime<Utc>,
        #[arg(long, value_parser = parse_time_arg)]
        end: DateTime<Utc>,
        #[arg(long)]
        wallet: Option<WalletId>,
    },
    /// Wallet x symbol strategy matrix
    Matrix {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn parse_time_arg(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("invalid timestamp: {raw}"))
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::InitDb { config } => run_init_db(&config),
        Command::Refresh { config, feed } => run_refresh(&config, &feed),
        Command::Aggregate { config, wallet } => run_aggregate(&config, wallet),
        Command::Resolve {
            config,
            wallet,
            symbol,
            at,
        } => run_resolve(&config, wallet, &symbol, at.unwrap_or_else(Utc::now)),
        Command::ImportAssignments { config, csv } => run_import(&config, csv),
        Command::EndAssignment { config, id, at } => {
            run_end_assignment(&config, id, at.unwrap_or_else(Utc::now))
        }
        Command::Positions { config, wallet } => run_positions(&config, wallet),
        Command::Report {
            config,
            start,
            end,
            wallet,
        } => run_report(&config, start, end, wallet),
        Command::Matrix { config } => run_matrix(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ReconError> {
    FileConfigAdapter::from_file(path).map_err(|e| ReconError::ConfigParse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Everything a command needs: validated engine settings and an open,
/// schema-initialized ledger.
pub struct Context {
    pub engine: EngineConfig,
    pub store: SqliteAdapter,
}

pub fn open_context(config_path: &Path) -> Result<Context, ReconError> {
    let adapter = load_config(config_path)?;
    init_logging(&LoggingConfig::from_config(&adapter));
    let engine = build_engine_config(&adapter)?;
    let store = SqliteAdapter::from_config(&adapter)?;
    store.initialize_schema()?;
    Ok(Context { engine, store })
}

fn run_init_db(config_path: &Path) -> Result<ExitCode, ReconError> {
    open_context(config_path)?;
    eprintln!("Ledger schema ready");
    Ok(ExitCode::SUCCESS)
}

fn run_refresh(config_path: &Path, feed_path: &Path) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    let feed = JsonFeedAdapter::new(feed_path.to_path_buf());
    let batch = run_refresh_pipeline(&ctx.engine, &ctx.store, &feed)?;

    for cycle in &batch.cycles {
        println!(
            "wallet {:>6}: {} snapshots, {} closed, {} legs, {} trades new, {} updated, {} failures",
            cycle.wallet_id,
            cycle.snapshots_recorded,
            cycle.sessions_closed,
            cycle.legs_upserted,
            cycle.aggregation.trades_inserted,
            cycle.aggregation.trades_updated,
            cycle.failure_count()
        );
    }
    for (wallet_id, err) in &batch.failed_wallets {
        eprintln!("wallet {wallet_id} failed: {err}");
    }

    Ok(match batch.failed_wallets.first() {
        Some((_, err)) => err.into(),
        None => ExitCode::SUCCESS,
    })
}

pub fn run_refresh_pipeline(
    engine: &EngineConfig,
    store: &dyn LedgerStore,
    feed: &dyn FeedPort,
) -> Result<BatchReport, ReconError> {
    let cycles = feed.load_cycles()?;
    tracing::info!(cycles = cycles.len(), "refresh started");
    Ok(reconcile_all(engine, store, &cycles))
}

fn run_aggregate(config_path: &Path, wallet: Option<WalletId>) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    let known = ctx.store.wallet_ids()?;
    let wallets = match wallet {
        Some(w) if known.contains(&w) => vec![w],
        Some(w) => return Err(ReconError::WalletNotFound(w)),
        None => known,
    };
    for wallet_id in wallets {
        let report = aggregate_wallet(&ctx.engine, &ctx.store, wallet_id)?;
        println!(
            "wallet {:>6}: {} new, {} updated, {} removed, {} leverage borrowed, {} positions settled, {} failures",
            wallet_id,
            report.trades_inserted,
            report.trades_updated,
            report.trades_removed,
            report.leverage_borrowed,
            report.positions_settled,
            report.failures.len()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_resolve(
    config_path: &Path,
    wallet: WalletId,
    symbol: &str,
    at: DateTime<Utc>,
) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    let symbol = validate_symbol(symbol)?;
    let attributor = StrategyAttributor::new(&ctx.store);
    match attributor.resolve(wallet, &symbol, at)? {
        Some(id) => {
            let name = attributor.strategy_name(wallet, &symbol, at)?;
            println!("{symbol} @ {}: strategy {id} ({})", at.to_rfc3339(), name.as_deref().unwrap_or("?"));
        }
        None => println!("{symbol} @ {}: unassigned", at.to_rfc3339()),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_import(config_path: &Path, csv_path: PathBuf) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    let (strategies, assignments) =
        import_assignments(&ctx.store, &CsvAssignmentAdapter::new(csv_path))?;
    println!("Imported {strategies} strategies, {assignments} assignments");
    Ok(ExitCode::SUCCESS)
}

/// Store an operator export. Returns (strategies, assignments) written.
pub fn import_assignments(
    store: &dyn LedgerStore,
    source: &dyn AssignmentSource,
) -> Result<(usize, usize), ReconError> {
    let import = source.load_assignments()?;
    for strategy in &import.strategies {
        store.upsert_strategy(strategy)?;
    }
    for assignment in &import.assignments {
        store.insert_assignment(assignment)?;
    }
    Ok((import.strategies.len(), import.assignments.len()))
}

fn run_end_assignment(config_path: &Path, id: i64, at: DateTime<Utc>) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    if ctx.store.end_assignment(id, at)? {
        tracing::info!(assignment = id, at = %at, "assignment ended");
        println!("Assignment {id} ended at {}", at.to_rfc3339());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("error: no assignment with id {id}");
        Ok(ExitCode::from(5))
    }
}

fn run_positions(config_path: &Path, wallet: Option<WalletId>) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    let views = open_positions(&ctx.store, wallet, Utc::now())?;
    println!(
        "{:>6}  {:<14} {:<5} {:>12} {:>12} {:>12} {:>8} {:>12}  strategy",
        "wallet", "symbol", "side", "size", "entry", "mark", "lev", "upnl"
    );
    for v in views {
        println!(
            "{:>6}  {:<14} {:<5} {:>12.4} {:>12.4} {:>12} {:>8} {:>12}  {}",
            v.wallet_id,
            v.symbol,
            v.side.as_str(),
            v.size,
            v.entry_price,
            fmt_opt(v.mark_price, 4),
            fmt_opt(v.leverage, 2),
            fmt_opt(v.unrealized_pnl, 2),
            v.strategy_name.as_deref().unwrap_or("-")
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.precision$}"))
}

/// Overall stats plus per-strategy and per-symbol breakdowns over `[start, end)`.
pub struct PerformanceReport {
    pub overall: TradeStats,
    pub by_strategy: Vec<GroupPerformance>,
    pub by_symbol: Vec<GroupPerformance>,
}

pub fn build_performance_report(
    store: &dyn LedgerStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    wallet: Option<WalletId>,
) -> Result<PerformanceReport, ReconError> {
    if end <= start {
        return Err(ReconError::ConfigInvalid {
            section: "report".into(),
            key: "end".into(),
            reason: "end must be after start".into(),
        });
    }
    let trades = store.aggregated_trades(wallet, Some(start), Some(end))?;
    let strategies = store.strategies()?;
    Ok(PerformanceReport {
        overall: TradeStats::compute(&trades),
        by_strategy: strategy_performance(&trades, &strategies),
        by_symbol: symbol_performance(&trades),
    })
}

fn run_report(
    config_path: &Path,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    wallet: Option<WalletId>,
) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    let report = build_performance_report(&ctx.store, start, end, wallet)?;

    let o = &report.overall;
    println!("Trades:        {}", o.trade_count());
    println!("Total P&L:     {:.2}", o.total_pnl);
    println!("Total fees:    {:.2}", o.total_fees);
    println!("Win rate:      {:.1}%", o.win_rate_pct);
    println!("Profit factor: {:.2}", o.profit_factor);
    println!("Avg P&L:       {:.2}", o.avg_pnl);
    println!("Avg leverage:  {}", fmt_opt(o.avg_leverage, 2));

    print_groups("Strategy", &report.by_strategy);
    print_groups("Symbol", &report.by_symbol);
    Ok(ExitCode::SUCCESS)
}

fn print_groups(title: &str, groups: &[GroupPerformance]) {
    println!();
    println!("{:<20} {:>7} {:>12} {:>8} {:>10}", title, "trades", "pnl", "win%", "avg");
    for g in groups {
        println!(
            "{:<20} {:>7} {:>12.2} {:>8.1} {:>10.2}",
            g.label,
            g.stats.trade_count(),
            g.stats.total_pnl,
            g.stats.win_rate_pct,
            g.stats.avg_pnl
        );
    }
}

/// Matrix over every wallet's traded symbols and live assignments.
pub fn build_matrix(store: &dyn LedgerStore, now: DateTime<Utc>) -> Result<Vec<MatrixRow>, ReconError> {
    let trades = store.aggregated_trades(None, None, None)?;
    let mut traded: BTreeMap<WalletId, BTreeSet<String>> = BTreeMap::new();
    for t in &trades {
        traded.entry(t.wallet_id).or_default().insert(t.symbol.clone());
    }
    for snap in store.latest_open_snapshots(None)? {
        traded.entry(snap.wallet_id).or_default().insert(snap.symbol);
    }
    Ok(build_strategy_matrix(
        &traded,
        &store.assignments(None)?,
        &store.strategies()?,
        &trades,
        now,
    ))
}

fn run_matrix(config_path: &Path) -> Result<ExitCode, ReconError> {
    let ctx = open_context(config_path)?;
    for row in build_matrix(&ctx.store, Utc::now())? {
        println!("wallet {}", row.wallet_id);
        for cell in &row.cells {
            let strategy = match (&cell.strategy_name, cell.strategy_id) {
                (Some(name), _) => name.clone(),
                (None, Some(id)) => format!("#{id}"),
                (None, None) => "-".to_string(),
            };
            println!("  {:<14} {:<20} {:>5} trades", cell.symbol, strategy, cell.trade_count);
        }
    }
    Ok(ExitCode::SUCCESS)
}
