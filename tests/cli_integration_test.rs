//! CLI integration tests.
//!
//! Tests cover:
//! - Argument parsing for every subcommand
//! - Config loading and validation from real INI files on disk
//! - Refresh pipeline from a JSON feed file into a file-backed ledger
//! - Assignment import, performance report and strategy matrix

mod common;

use approx::assert_relative_eq;
use clap::Parser;
use common::*;
use posrecon::adapters::csv_adapter::CsvAssignmentAdapter;
use posrecon::adapters::json_feed_adapter::JsonFeedAdapter;
use posrecon::cli::{self, Cli, Command};
use posrecon::domain::error::ReconError;
use posrecon::domain::performance::UNASSIGNED;
use posrecon::ports::store_port::LedgerStore;
use std::io::Write;
use std::path::Path;

fn write_temp(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn ini_for(db: &Path) -> String {
    format!(
        r#"
[database]
path = {}
pool_size = 2

[leverage]
isolated_lookback_minutes = 60
default_margin_mode = isolated

[margin_mode]
2 = cross

[matching]
size_tolerance = 0.001

[logging]
level = warn
"#,
        db.display()
    )
}

mod arguments {
    use super::*;

    #[test]
    fn parses_refresh() {
        let cli = Cli::try_parse_from([
            "posrecon", "refresh", "-c", "cfg.ini", "--feed", "cycles.json",
        ])
        .unwrap();
        match cli.command {
            Command::Refresh { config, feed } => {
                assert_eq!(config.to_str(), Some("cfg.ini"));
                assert_eq!(feed.to_str(), Some("cycles.json"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_report_dates() {
        let cli = Cli::try_parse_from([
            "posrecon", "report", "-c", "cfg.ini", "--start", "2024-09-01", "--end",
            "2024-10-01T00:00:00Z", "--wallet", "7",
        ])
        .unwrap();
        match cli.command {
            Command::Report {
                start, end, wallet, ..
            } => {
                assert_eq!(start.to_rfc3339(), "2024-09-01T00:00:00+00:00");
                assert_eq!(end.to_rfc3339(), "2024-10-01T00:00:00+00:00");
                assert_eq!(wallet, Some(7));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_timestamp() {
        assert!(Cli::try_parse_from([
            "posrecon", "resolve", "-c", "cfg.ini", "--wallet", "1", "--symbol", "BTC", "--at",
            "yesterday",
        ])
        .is_err());
    }

    #[test]
    fn config_is_required() {
        assert!(Cli::try_parse_from(["posrecon", "matrix"]).is_err());
        assert!(Cli::try_parse_from(["posrecon", "init-db", "-c", "x.ini"]).is_ok());
        assert!(Cli::try_parse_from(["posrecon", "end-assignment", "-c", "x.ini", "--id", "4"]).is_ok());
    }
}

mod config_loading {
    use super::*;

    #[test]
    fn missing_file_is_config_parse_error() {
        match cli::load_config(Path::new("/nonexistent/posrecon.ini")) {
            Err(ReconError::ConfigParse { file, .. }) => {
                assert_eq!(file, "/nonexistent/posrecon.ini");
            }
            Err(other) => panic!("expected ConfigParse, got {other}"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn context_opens_file_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("ledger.db");
        let ini = write_temp(&ini_for(&db), ".ini");

        let ctx = cli::open_context(ini.path()).unwrap();
        assert!(db.exists());
        assert_eq!(
            ctx.engine.leverage.margin_mode_for(2),
            posrecon::domain::leverage::MarginMode::Cross
        );
        assert!(ctx.store.wallet_ids().unwrap().is_empty());
    }

    #[test]
    fn invalid_engine_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("ledger.db");
        let ini = write_temp(
            &ini_for(&db).replace("size_tolerance = 0.001", "size_tolerance = 2"),
            ".ini",
        );
        assert!(matches!(
            cli::open_context(ini.path()),
            Err(ReconError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn missing_database_path_rejected() {
        let ini = write_temp("[logging]\nlevel = info\n", ".ini");
        assert!(matches!(
            cli::open_context(ini.path()),
            Err(ReconError::ConfigMissing { .. })
        ));
    }
}

mod pipelines {
    use super::*;

    const FEED: &str = r#"[
      {
        "wallet_id": 1,
        "cycle_time": "2024-09-02T08:00:00Z",
        "equity": {"totalEquity": "5000", "availableBalance": "4000", "totalMarginUsed": "1000"},
        "positions": [
          {"symbol": "BTCUSDT", "side": "long", "size": "0.1", "entryPrice": "60000",
           "markPrice": "60500", "initialMarginRate": "0.1"}
        ],
        "fills": [
          {"symbol": "ETH-USDT", "side": "buy", "size": 1, "price": 3000, "reduceOnly": false,
           "fee": 0.5, "timestamp": "2024-09-02T07:00:00Z"},
          {"symbol": "ETH-USDT", "side": "sell", "size": 1, "price": 2900, "reduceOnly": true,
           "fee": 0.5, "timestamp": "2024-09-02T07:30:00Z"}
        ]
      },
      {
        "wallet_id": 2,
        "cycle_time": 1725264000000,
        "positions": [{"coin": "SOL", "szi": "-4", "entryPx": "140", "positionValue": "560"}]
      }
    ]"#;

    const ASSIGNMENTS: &str = "\
wallet_id,symbol,strategy_id,strategy_name,description,start_at,end_at,active
1,ETH-USDT,1,momentum,,2024-09-01,,
1,BTC-USDT,2,carry,,2024-09-01,,
";

    #[test]
    fn refresh_then_report_and_matrix() {
        let store = store();
        let csv = write_temp(ASSIGNMENTS, ".csv");
        let import = cli::import_assignments(
            &store,
            &CsvAssignmentAdapter::new(csv.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(import, (2, 2));

        let feed = write_temp(FEED, ".json");
        let batch = cli::run_refresh_pipeline(
            &engine(),
            &store,
            &JsonFeedAdapter::new(feed.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(batch.cycles.len(), 2);
        assert!(batch.failed_wallets.is_empty());
        assert_eq!(batch.cycles[0].aggregation.trades_inserted, 1);

        let open = store.latest_open_snapshots(None).unwrap();
        assert_eq!(open.len(), 2);
        let sol = open.iter().find(|s| s.wallet_id == 2).unwrap();
        assert_eq!(sol.symbol, "SOL");
        assert_relative_eq!(sol.size, 4.0);
        assert_eq!(sol.mark_price, Some(140.0));

        let report = cli::build_performance_report(&store, t(-24 * 60), t(24 * 60), None).unwrap();
        assert_eq!(report.overall.trade_count(), 1);
        assert_relative_eq!(report.overall.total_pnl, -101.0, epsilon = 1e-9);
        assert_eq!(report.by_strategy.len(), 1);
        assert_eq!(report.by_strategy[0].label, "momentum");
        assert_eq!(report.by_symbol[0].label, "ETH-USDT");

        let rows = cli::build_matrix(&store, t(60)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wallet_id, 1);
        let eth = rows[0].cells.iter().find(|c| c.symbol == "ETH-USDT").unwrap();
        assert_eq!(eth.strategy_name.as_deref(), Some("momentum"));
        assert_eq!(eth.trade_count, 1);
        let btc = rows[0].cells.iter().find(|c| c.symbol == "BTC-USDT").unwrap();
        assert_eq!(btc.trade_count, 0);
    }

    #[test]
    fn report_window_is_half_open() {
        let store = store();
        let feed = write_temp(FEED, ".json");
        cli::run_refresh_pipeline(&engine(), &store, &JsonFeedAdapter::new(feed.path().to_path_buf()))
            .unwrap();

        // The ETH trade closed at 07:30.
        let before = cli::build_performance_report(&store, t(-60), t(-30), None).unwrap();
        assert_eq!(before.overall.trade_count(), 0);
        let at = cli::build_performance_report(&store, t(-30), t(0), None).unwrap();
        assert_eq!(at.overall.trade_count(), 1);
        assert_eq!(at.by_strategy[0].label, UNASSIGNED);

        assert!(cli::build_performance_report(&store, t(0), t(0), None).is_err());
    }
}
