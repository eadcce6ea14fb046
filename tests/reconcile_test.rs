//! End-to-end refresh cycles against an in-memory ledger.

mod common;

use approx::assert_relative_eq;
use common::*;
use posrecon::domain::attribution::StrategyAttributor;
use posrecon::domain::reconcile::{open_positions, reconcile_all, reconcile_wallet};
use posrecon::domain::snapshot::{CalculationMethod, PositionSide};
use posrecon::domain::strategy::{Strategy, StrategyAssignment};
use posrecon::ports::store_port::LedgerStore;

mod leverage_sessions {
    use super::*;

    #[test]
    fn leverage_is_frozen_for_the_session() {
        let store = store();
        let engine = engine();

        reconcile_wallet(&engine, &store, &CycleBuilder::new(WALLET, t(0)).margin(100.0).build())
            .unwrap();
        let opened = CycleBuilder::new(WALLET, t(10))
            .margin(150.0)
            .position(position("BTCUSDT", "long", 0.05, 60_000.0, 60_000.0))
            .build();
        let report = reconcile_wallet(&engine, &store, &opened).unwrap();
        assert_eq!(report.snapshots_recorded, 1);

        let later = CycleBuilder::new(WALLET, t(20))
            .margin(400.0)
            .position(position("BTCUSDT", "long", 0.05, 60_000.0, 61_000.0))
            .build();
        reconcile_wallet(&engine, &store, &later).unwrap();

        let open = store.latest_open_snapshots(Some(WALLET)).unwrap();
        assert_eq!(open.len(), 1);
        let snap = &open[0];
        assert_eq!(snap.symbol, "BTC-USDT");
        assert_eq!(snap.timestamp, t(20));
        assert_eq!(snap.opened_at, Some(t(10)));
        assert_eq!(snap.calculation_method, CalculationMethod::MarginDelta);
        assert_relative_eq!(snap.leverage.unwrap(), 60.0, epsilon = 1e-9);
        assert_relative_eq!(snap.equity_used.unwrap(), 50.0, epsilon = 1e-9);
    }

    #[test]
    fn unknown_head_is_filled_by_a_later_cycle() {
        let store = store();
        let engine = engine();

        let first = CycleBuilder::new(WALLET, t(0))
            .margin(200.0)
            .position(position("ETH-USDT", "long", 2.0, 3_000.0, 3_000.0))
            .build();
        reconcile_wallet(&engine, &store, &first).unwrap();
        let head = store.session_head(WALLET, "ETH-USDT", t(0)).unwrap().unwrap();
        assert_eq!(head.leverage, None);
        assert_eq!(head.calculation_method, CalculationMethod::Unknown);

        let second = CycleBuilder::new(WALLET, t(10))
            .margin(200.0)
            .position(with_margin_rate(
                position("ETH-USDT", "long", 2.0, 3_000.0, 3_050.0),
                0.1,
            ))
            .build();
        reconcile_wallet(&engine, &store, &second).unwrap();

        let head = store.session_head(WALLET, "ETH-USDT", t(0)).unwrap().unwrap();
        assert_eq!(head.calculation_method, CalculationMethod::MarginRate);
        assert_relative_eq!(head.leverage.unwrap(), 10.0);
        assert_relative_eq!(head.equity_used.unwrap(), 600.0, epsilon = 1e-9);

        let latest = &store.latest_open_snapshots(Some(WALLET)).unwrap()[0];
        assert_eq!(latest.timestamp, t(10));
        assert_eq!(latest.leverage, head.leverage);
    }

    #[test]
    fn side_flip_starts_a_new_session() {
        let store = store();
        let engine = engine();

        let long = CycleBuilder::new(WALLET, t(0))
            .position(with_margin_rate(position("SOL-USDT", "long", 10.0, 150.0, 150.0), 0.2))
            .build();
        reconcile_wallet(&engine, &store, &long).unwrap();
        let short = CycleBuilder::new(WALLET, t(5))
            .position(with_margin_rate(position("SOL-USDT", "short", 10.0, 149.0, 149.0), 0.5))
            .build();
        reconcile_wallet(&engine, &store, &short).unwrap();

        let positions = store.positions(Some(WALLET)).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].closed_at, Some(t(5)));
        assert_eq!(positions[1].side, PositionSide::Short);
        assert!(positions[1].is_open());

        let snap = &store.latest_open_snapshots(Some(WALLET)).unwrap()[0];
        assert_eq!(snap.opened_at, Some(t(5)));
        assert_relative_eq!(snap.leverage.unwrap(), 2.0);
    }
}

mod closing {
    use super::*;

    #[test]
    fn missing_symbol_writes_sentinel_once() {
        let store = store();
        let engine = engine();

        let open = CycleBuilder::new(WALLET, t(0))
            .position(position("BTC-USDT", "short", 0.3, 58_000.0, 57_900.0))
            .build();
        reconcile_wallet(&engine, &store, &open).unwrap();

        let empty = CycleBuilder::new(WALLET, t(5)).margin(0.0).build();
        let report = reconcile_wallet(&engine, &store, &empty).unwrap();
        assert_eq!(report.sessions_closed, 1);
        assert!(store.latest_open_snapshots(Some(WALLET)).unwrap().is_empty());

        let sentinel = store
            .latest_snapshot_before(WALLET, "BTC-USDT", t(6))
            .unwrap()
            .unwrap();
        assert_eq!(sentinel.size, 0.0);
        assert_eq!(sentinel.leverage, None);
        assert_eq!(sentinel.opened_at, None);

        let positions = store.positions(Some(WALLET)).unwrap();
        assert_eq!(positions[0].closed_at, Some(t(5)));

        let replay = reconcile_wallet(&engine, &store, &empty).unwrap();
        assert_eq!(replay.sessions_closed, 0);
    }

    #[test]
    fn reopen_after_close_is_a_new_session() {
        let store = store();
        let engine = engine();
        let pos = || with_margin_rate(position("ARB-USDT", "long", 100.0, 1.0, 1.0), 0.05);

        reconcile_wallet(&engine, &store, &CycleBuilder::new(WALLET, t(0)).position(pos()).build())
            .unwrap();
        reconcile_wallet(&engine, &store, &CycleBuilder::new(WALLET, t(5)).build()).unwrap();
        reconcile_wallet(&engine, &store, &CycleBuilder::new(WALLET, t(10)).position(pos()).build())
            .unwrap();

        let snap = &store.latest_open_snapshots(Some(WALLET)).unwrap()[0];
        assert_eq!(snap.opened_at, Some(t(10)));
        assert_eq!(store.positions(Some(WALLET)).unwrap().len(), 2);
    }
}

mod trades {
    use super::*;

    fn open_cycle() -> posrecon::domain::payload::CycleInput {
        CycleBuilder::new(WALLET, t(0))
            .position(with_margin_rate(
                position("ETH-USDT", "long", 2.0, 3_000.0, 3_000.0),
                0.2,
            ))
            .fill(fill("ETHUSDT", "buy", 2.0, 3_000.0, false, 1.0, t(0)))
            .build()
    }

    fn close_cycle() -> posrecon::domain::payload::CycleInput {
        CycleBuilder::new(WALLET, t(30))
            .fill(fill("ETH-USDT", "sell", 2.0, 3_100.0, true, 1.0, t(30)))
            .build()
    }

    #[test]
    fn round_trip_settles_position() {
        let store = store();
        let engine = engine();

        let first = reconcile_wallet(&engine, &store, &open_cycle()).unwrap();
        assert_eq!(first.legs_upserted, 1);
        assert_eq!(first.aggregation.trades_inserted, 0);

        let second = reconcile_wallet(&engine, &store, &close_cycle()).unwrap();
        assert_eq!(second.sessions_closed, 1);
        assert_eq!(second.aggregation.trades_inserted, 1);
        assert_eq!(second.aggregation.positions_settled, 1);

        let trades = store.aggregated_trades(Some(WALLET), None, None).unwrap();
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.side, PositionSide::Long);
        assert_eq!(trade.opened_at, t(0));
        assert_eq!(trade.timestamp, t(30));
        assert_relative_eq!(trade.fees, 2.0);
        assert_relative_eq!(trade.total_pnl, 198.0, epsilon = 1e-9);
        assert_relative_eq!(trade.leverage.unwrap(), 5.0);

        let position = &store.positions(Some(WALLET)).unwrap()[0];
        assert_eq!(position.closed_at, Some(t(30)));
        assert_eq!(position.exit_price, Some(3_100.0));
        assert_relative_eq!(position.realized_pnl.unwrap(), 198.0, epsilon = 1e-9);
    }

    #[test]
    fn replayed_cycles_converge() {
        let store = store();
        let engine = engine();

        reconcile_wallet(&engine, &store, &open_cycle()).unwrap();
        reconcile_wallet(&engine, &store, &close_cycle()).unwrap();
        let replay = reconcile_wallet(&engine, &store, &close_cycle()).unwrap();

        assert_eq!(replay.aggregation.trades_inserted, 0);
        assert_eq!(replay.aggregation.trades_updated, 1);
        assert_eq!(replay.aggregation.positions_settled, 0);
        assert_eq!(store.legs_for_wallet(WALLET).unwrap().len(), 2);
        assert_eq!(store.aggregated_trades(None, None, None).unwrap().len(), 1);
    }

    #[test]
    fn missing_leverage_borrowed_from_next_snapshot() {
        let store = store();
        let engine = engine();

        let legs_only = CycleBuilder::new(WALLET, t(10))
            .fill(fill("SOL-USDT", "sell", 1.0, 100.0, false, 0.0, t(0)))
            .fill(fill("SOL-USDT", "buy", 1.0, 90.0, true, 0.0, t(10)))
            .build();
        let report = reconcile_wallet(&engine, &store, &legs_only).unwrap();
        assert_eq!(report.aggregation.trades_inserted, 1);
        assert_eq!(report.aggregation.leverage_borrowed, 0);

        let reopened = CycleBuilder::new(WALLET, t(12))
            .position(with_margin_rate(
                position("SOL-USDT", "short", 1.05, 110.0, 110.0),
                0.25,
            ))
            .build();
        let report = reconcile_wallet(&engine, &store, &reopened).unwrap();
        assert_eq!(report.aggregation.trades_updated, 1);
        assert_eq!(report.aggregation.leverage_borrowed, 1);

        let trade = &store.aggregated_trades(Some(WALLET), None, None).unwrap()[0];
        assert_eq!(trade.side, PositionSide::Short);
        assert_relative_eq!(trade.total_pnl, 10.0);
        assert_relative_eq!(trade.leverage.unwrap(), 4.0);
        assert_relative_eq!(trade.equity_used.unwrap(), 28.875, epsilon = 1e-9);
    }

    #[test]
    fn reopened_session_does_not_inherit_previous_leverage() {
        let store = store();
        let engine = engine();
        let sol = |size: f64, price: f64, rate: f64| {
            with_margin_rate(position("SOL-USDT", "long", size, price, price), rate)
        };

        let first = CycleBuilder::new(WALLET, t(0))
            .position(sol(10.0, 100.0, 0.5))
            .fill(fill("SOL-USDT", "buy", 10.0, 100.0, false, 0.0, t(0)))
            .build();
        reconcile_wallet(&engine, &store, &first).unwrap();
        let closed = CycleBuilder::new(WALLET, t(10))
            .fill(fill("SOL-USDT", "sell", 10.0, 110.0, true, 0.0, t(9)))
            .build();
        reconcile_wallet(&engine, &store, &closed).unwrap();

        // The opener lands a minute before the snapshot that opens the session.
        let reopened = CycleBuilder::new(WALLET, t(20))
            .position(sol(5.0, 120.0, 0.1))
            .fill(fill("SOL-USDT", "buy", 5.0, 120.0, false, 0.0, t(19)))
            .build();
        reconcile_wallet(&engine, &store, &reopened).unwrap();
        let closed_again = CycleBuilder::new(WALLET, t(30))
            .fill(fill("SOL-USDT", "sell", 5.0, 125.0, true, 0.0, t(29)))
            .build();
        reconcile_wallet(&engine, &store, &closed_again).unwrap();

        let trades = store.aggregated_trades(Some(WALLET), None, None).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].timestamp, t(29));
        assert_relative_eq!(trades[0].leverage.unwrap(), 10.0);
        assert_relative_eq!(trades[0].equity_used.unwrap(), 60.0, epsilon = 1e-9);
        assert_eq!(trades[1].timestamp, t(9));
        assert_relative_eq!(trades[1].leverage.unwrap(), 2.0);
        assert_relative_eq!(trades[1].equity_used.unwrap(), 500.0, epsilon = 1e-9);
    }

    #[test]
    fn late_closer_rematches_and_resettles() {
        let store = store();
        let engine = engine();
        let eth = || with_margin_rate(position("ETH-USDT", "long", 2.0, 3_000.0, 3_000.0), 0.2);

        let steps = [
            CycleBuilder::new(WALLET, t(0))
                .position(eth())
                .fill(fill("ETH-USDT", "buy", 2.0, 3_000.0, false, 0.0, t(0))),
            CycleBuilder::new(WALLET, t(8)),
            CycleBuilder::new(WALLET, t(10)).position(eth()),
            CycleBuilder::new(WALLET, t(20))
                .fill(fill("ETH-USDT", "sell", 2.0, 3_010.0, true, 0.0, t(20))),
        ];
        for cycle in steps {
            reconcile_wallet(&engine, &store, &cycle.build()).unwrap();
        }
        let positions = store.positions(Some(WALLET)).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].realized_pnl, None);
        assert_relative_eq!(positions[1].realized_pnl.unwrap(), 20.0, epsilon = 1e-9);

        // An earlier closer shows up after the later one was already matched.
        let late = || {
            CycleBuilder::new(WALLET, t(25))
                .fill(fill("ETH-USDT", "sell", 2.0, 3_005.0, true, 0.0, t(7)))
                .build()
        };
        let report = reconcile_wallet(&engine, &store, &late()).unwrap();
        assert_eq!(report.aggregation.trades_inserted, 1);
        assert_eq!(report.aggregation.trades_removed, 1);
        assert_eq!(report.aggregation.positions_settled, 1);
        assert_eq!(report.aggregation.positions_unsettled, 1);

        let trades = store.aggregated_trades(Some(WALLET), None, None).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].timestamp, t(7));
        assert_eq!(trades[0].opened_at, t(0));
        assert_relative_eq!(trades[0].total_pnl, 10.0, epsilon = 1e-9);

        let positions = store.positions(Some(WALLET)).unwrap();
        assert_eq!(positions[0].exit_price, Some(3_005.0));
        assert_relative_eq!(positions[0].realized_pnl.unwrap(), 10.0, epsilon = 1e-9);
        assert_eq!(positions[1].realized_pnl, None);
        assert_eq!(positions[1].exit_price, None);

        let replay = reconcile_wallet(&engine, &store, &late()).unwrap();
        assert_eq!(replay.aggregation.trades_removed, 0);
        assert_eq!(replay.aggregation.trades_updated, 1);
        assert_eq!(replay.aggregation.positions_settled, 0);
        assert_eq!(replay.aggregation.positions_unsettled, 0);
    }

    #[test]
    fn trade_takes_strategy_active_at_close() {
        let store = store();
        let engine = engine();
        store
            .upsert_strategy(&Strategy {
                id: 3,
                name: "breakout".into(),
                description: None,
            })
            .unwrap();
        store
            .insert_assignment(&StrategyAssignment {
                id: None,
                wallet_id: WALLET,
                symbol: "ETH-USDT".into(),
                strategy_id: 3,
                start_at: t(15),
                end_at: None,
                active: true,
            })
            .unwrap();

        reconcile_wallet(&engine, &store, &open_cycle()).unwrap();
        reconcile_wallet(&engine, &store, &close_cycle()).unwrap();

        let trade = &store.aggregated_trades(Some(WALLET), None, None).unwrap()[0];
        assert_eq!(trade.strategy_id, Some(3));
    }
}

mod attribution {
    use super::*;

    fn assign(strategy_id: i64, start: i64) -> StrategyAssignment {
        StrategyAssignment {
            id: None,
            wallet_id: WALLET,
            symbol: "BTC-USDT".into(),
            strategy_id,
            start_at: t(start),
            end_at: None,
            active: true,
        }
    }

    #[test]
    fn latest_start_wins_on_overlap() {
        let store = store();
        store.insert_assignment(&assign(1, 0)).unwrap();
        let later = store.insert_assignment(&assign(2, 60)).unwrap();
        let attributor = StrategyAttributor::new(&store);

        assert_eq!(attributor.resolve(WALLET, "BTCUSDT", t(-1)).unwrap(), None);
        assert_eq!(attributor.resolve(WALLET, "BTCUSDT", t(30)).unwrap(), Some(1));
        assert_eq!(attributor.resolve(WALLET, "BTC-USDT", t(90)).unwrap(), Some(2));

        store.end_assignment(later, t(100)).unwrap();
        assert_eq!(attributor.resolve(WALLET, "BTC-USDT", t(90)).unwrap(), Some(2));
        assert_eq!(attributor.resolve(WALLET, "BTC-USDT", t(120)).unwrap(), Some(1));
    }

    #[test]
    fn open_positions_carry_strategy_name() {
        let store = store();
        store
            .upsert_strategy(&Strategy {
                id: 1,
                name: "grid".into(),
                description: Some("range grid".into()),
            })
            .unwrap();
        store.insert_assignment(&assign(1, 0)).unwrap();

        let cycle = CycleBuilder::new(WALLET, t(5))
            .position(position("BTC-USDT", "long", 0.1, 60_000.0, 60_600.0))
            .build();
        reconcile_wallet(&engine(), &store, &cycle).unwrap();

        let views = open_positions(&store, Some(WALLET), t(10)).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].strategy_name.as_deref(), Some("grid"));
        assert_relative_eq!(views[0].unrealized_pnl.unwrap(), 60.0, epsilon = 1e-6);
    }
}

#[test]
fn batch_runs_every_wallet() {
    let store = store();
    let cycles = [
        CycleBuilder::new(1, t(0))
            .position(position("BTC-USDT", "long", 0.1, 60_000.0, 60_000.0))
            .build(),
        CycleBuilder::new(2, t(0))
            .position(position("ETH-USDT", "short", 1.0, 3_000.0, 3_000.0))
            .build(),
    ];
    let batch = reconcile_all(&engine(), &store, &cycles);
    assert!(batch.failed_wallets.is_empty());
    assert_eq!(batch.cycles.len(), 2);
    assert_eq!(store.wallet_ids().unwrap(), vec![1, 2]);
}
