mod common;

use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use termfarm::adapters::{Fault, MemoryStore, StoreOp};
use termfarm::domain::{TerminalStatus, TradeStatus};
use termfarm::retry::RetryPolicy;
use termfarm::services::{Metrics, TerminalFarm, TradeReconciler};
use termfarm::store::FarmStore;

use common::{farm, position_trade, seeded_terminal, trade_sync};

fn reconciler(store: Arc<MemoryStore>) -> TradeReconciler {
    TradeReconciler::new(store, RetryPolicy::immediate(3), 50, Arc::new(Metrics::new()))
}

#[tokio::test]
async fn entry_deal_is_imported_once() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());
    let body = trade_sync(terminal.id, vec![position_trade(1001, 42, 0, "BUY")]);

    let first = farm.reconciler.handle_trades(body.clone()).await.unwrap();
    assert_eq!((first.imported, first.skipped), (1, 0));

    let second = farm.reconciler.handle_trades(body).await.unwrap();
    assert_eq!((second.imported, second.skipped), (0, 1));

    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, TradeStatus::Open);
    assert_eq!(trades[0].external_id.as_deref(), Some("42"));
    assert!(trades[0]
        .notes
        .as_deref()
        .unwrap()
        .contains("Position ID: 42"));

    let stored = store.get_terminal(terminal.id).await.unwrap().unwrap();
    assert!(stored.last_sync_at.is_some());
}

#[tokio::test]
async fn exit_closes_position_and_sums_costs() {
    let store = Arc::new(MemoryStore::new());
    let (acct, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());

    farm.reconciler
        .handle_trades(trade_sync(terminal.id, vec![position_trade(1001, 42, 0, "BUY")]))
        .await
        .unwrap();

    let mut exit = position_trade(1002, 42, 1, "SELL");
    exit["openPrice"] = json!(1.1050);
    exit["openTime"] = json!("2024-03-01T14:00:00Z");
    exit["profit"] = json!(50.0);
    let summary = farm
        .reconciler
        .handle_trades(trade_sync(terminal.id, vec![exit]))
        .await
        .unwrap();
    assert_eq!((summary.imported, summary.skipped), (1, 0));

    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.status, TradeStatus::Closed);
    assert_eq!(trade.exit_price, Some(dec!(1.105)));
    assert_eq!(trade.commission, dec!(-7));
    assert_eq!(trade.swap, dec!(-1));
    assert_eq!(trade.pnl, dec!(50));

    let account = store.get_account(acct.id).await.unwrap().unwrap();
    assert_eq!(account.current_balance, dec!(10050));
    assert_eq!(account.total_dd_current, dec!(0));
}

#[tokio::test]
async fn entry_and_exit_in_one_batch_produce_one_closed_row() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());

    let summary = farm
        .reconciler
        .handle_trades(trade_sync(
            terminal.id,
            vec![position_trade(1001, 7, 0, "BUY"), position_trade(1002, 7, 1, "SELL")],
        ))
        .await
        .unwrap();
    assert_eq!(summary.imported, 1);

    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, TradeStatus::Closed);
    assert_eq!(trades[0].commission, dec!(-7));
}

#[tokio::test]
async fn exit_without_entry_becomes_orphan() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());

    let mut exit = position_trade(2002, 99, 1, "SELL");
    exit["profit"] = json!(-20.0);
    farm.reconciler
        .handle_trades(trade_sync(terminal.id, vec![exit]))
        .await
        .unwrap();

    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    let orphan = &trades[0];
    assert!(orphan.is_orphan);
    assert_eq!(orphan.status, TradeStatus::Closed);
    assert_eq!(orphan.entry_price, dec!(0));
    assert_eq!(orphan.pnl, dec!(-20));
    assert!(orphan.notes.as_deref().unwrap().starts_with("Orphan Exit Synced"));
}

#[tokio::test]
async fn legacy_ticket_is_deduplicated() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());
    let legacy = json!({
        "ticket": "555",
        "symbol": "XAUUSD",
        "type": "SELL",
        "volume": 0.1,
        "openPrice": 2030.5,
        "closePrice": 2020.0,
        "openTime": "2024-03-01T10:00:00Z",
        "closeTime": "2024-03-01T11:00:00Z",
        "profit": 105.0
    });

    let first = farm
        .reconciler
        .handle_trades(trade_sync(terminal.id, vec![legacy.clone()]))
        .await
        .unwrap();
    let second = farm
        .reconciler
        .handle_trades(trade_sync(terminal.id, vec![legacy]))
        .await
        .unwrap();

    assert_eq!(first.imported, 1);
    assert_eq!((second.imported, second.skipped), (0, 1));
    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, TradeStatus::Closed);
    assert_eq!(trades[0].external_deal_id.as_deref(), Some("555"));
}

#[tokio::test]
async fn invalid_trades_are_counted_as_skipped() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());

    let mut bad = position_trade(3001, 5, 0, "BUY");
    bad["volume"] = json!(-1.0);
    let summary = farm
        .reconciler
        .handle_trades(trade_sync(terminal.id, vec![bad, position_trade(3002, 6, 0, "BUY")]))
        .await
        .unwrap();

    assert_eq!((summary.imported, summary.skipped), (1, 1));
}

#[tokio::test]
async fn unknown_terminal_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let farm = farm(store);

    let err = farm
        .reconciler
        .handle_trades(trade_sync(uuid::Uuid::new_v4(), vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, termfarm::FarmError::NotFound { .. }));
}

#[tokio::test]
async fn transient_chunk_failure_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    store.inject_fault(StoreOp::InsertTrades, 2, Fault::Transient).await;

    let trades = (0..120)
        .map(|i| position_trade(10_000 + i, 1 + i as i64, 0, "BUY"))
        .collect();
    let summary = reconciler(store.clone())
        .handle_trades(trade_sync(terminal.id, trades))
        .await
        .unwrap();

    assert_eq!((summary.imported, summary.skipped), (120, 0));
    assert_eq!(store.insert_batch_sizes().await, vec![50, 50, 20]);
    assert_eq!(store.trades().await.len(), 120);
}

#[tokio::test]
async fn permanent_chunk_failure_skips_only_that_chunk() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    store.inject_fault(StoreOp::InsertTrades, 1, Fault::Permanent).await;

    let trades = (0..60)
        .map(|i| position_trade(20_000 + i, 500 + i as i64, 0, "BUY"))
        .collect();
    let summary = reconciler(store.clone())
        .handle_trades(trade_sync(terminal.id, trades))
        .await
        .unwrap();

    assert_eq!((summary.imported, summary.skipped), (10, 50));
    assert_eq!(store.insert_batch_sizes().await, vec![10]);
}

async fn open_position(farm: &TerminalFarm, terminal_id: uuid::Uuid) {
    farm.reconciler
        .handle_trades(trade_sync(terminal_id, vec![position_trade(1001, 42, 0, "BUY")]))
        .await
        .unwrap();
}

fn exit_deal(ticket: u64) -> serde_json::Value {
    let mut exit = position_trade(ticket, 42, 1, "SELL");
    exit["profit"] = json!(50.0);
    exit
}

#[tokio::test]
async fn redelivered_exit_in_one_batch_counts_once() {
    let store = Arc::new(MemoryStore::new());
    let (acct, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());
    open_position(&farm, terminal.id).await;

    let summary = farm
        .reconciler
        .handle_trades(trade_sync(terminal.id, vec![exit_deal(1002), exit_deal(1002)]))
        .await
        .unwrap();
    assert_eq!((summary.imported, summary.skipped), (1, 1));

    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].pnl, dec!(50));
    assert_eq!(trades[0].commission, dec!(-7));
    assert_eq!(trades[0].swap, dec!(-1));

    let account = store.get_account(acct.id).await.unwrap().unwrap();
    assert_eq!(account.current_balance, dec!(10050));
}

#[tokio::test]
async fn redelivered_orphan_exit_counts_once() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());

    let summary = farm
        .reconciler
        .handle_trades(trade_sync(terminal.id, vec![exit_deal(1002), exit_deal(1002)]))
        .await
        .unwrap();
    assert_eq!((summary.imported, summary.skipped), (1, 1));

    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    assert!(trades[0].is_orphan);
    assert_eq!(trades[0].pnl, dec!(50));
}

#[tokio::test]
async fn exit_replayed_in_later_call_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());
    open_position(&farm, terminal.id).await;

    let body = trade_sync(terminal.id, vec![exit_deal(1002)]);
    let first = farm.reconciler.handle_trades(body.clone()).await.unwrap();
    let second = farm.reconciler.handle_trades(body).await.unwrap();

    assert_eq!((first.imported, first.skipped), (1, 0));
    assert_eq!((second.imported, second.skipped), (0, 1));
    let trades = store.trades().await;
    assert_eq!(trades[0].pnl, dec!(50));
    assert_eq!(trades[0].commission, dec!(-7));
}

#[tokio::test]
async fn closed_row_gets_contract_size_backfilled() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());

    let mut entry = position_trade(1001, 42, 0, "BUY");
    entry.as_object_mut().unwrap().remove("contractSize");
    let mut exit = exit_deal(1002);
    exit.as_object_mut().unwrap().remove("contractSize");
    farm.reconciler
        .handle_trades(trade_sync(terminal.id, vec![entry, exit]))
        .await
        .unwrap();
    let closed = store.trades().await.remove(0);
    assert_eq!(closed.status, TradeStatus::Closed);
    assert_eq!(closed.contract_size, None);

    let summary = farm
        .reconciler
        .handle_trades(trade_sync(terminal.id, vec![exit_deal(1002)]))
        .await
        .unwrap();
    assert_eq!((summary.imported, summary.skipped), (1, 0));

    let trade = store.trades().await.remove(0);
    assert_eq!(trade.contract_size, Some(dec!(100000)));
    assert_eq!(trade.pnl, dec!(50));
    assert_eq!(trade.commission, dec!(-7));
    assert_eq!(trade.exit_time, closed.exit_time);
}

#[tokio::test]
async fn failed_update_is_skipped_without_failing_the_call() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());
    open_position(&farm, terminal.id).await;
    store.inject_fault(StoreOp::UpdateTrade, 1, Fault::Permanent).await;

    let summary = farm
        .reconciler
        .handle_trades(trade_sync(
            terminal.id,
            vec![exit_deal(1002), position_trade(1003, 43, 0, "BUY")],
        ))
        .await
        .unwrap();
    assert_eq!((summary.imported, summary.skipped), (1, 1));

    let trades = store.trades().await;
    assert_eq!(trades.len(), 2);
    let untouched = trades
        .iter()
        .find(|t| t.external_id.as_deref() == Some("42"))
        .unwrap();
    assert_eq!(untouched.status, TradeStatus::Open);
}

#[tokio::test]
async fn legacy_ticket_does_not_block_position_rows() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());
    let legacy = json!({
        "ticket": "5000",
        "symbol": "EURUSD",
        "type": "BUY",
        "volume": 0.1,
        "openPrice": 1.1,
        "openTime": "2024-03-01T10:00:00Z"
    });
    farm.reconciler
        .handle_trades(trade_sync(terminal.id, vec![legacy]))
        .await
        .unwrap();

    let entries = (0..10)
        .map(|i| position_trade(5000 + i, 900 + i as i64, 0, "BUY"))
        .collect();
    let summary = reconciler(store.clone())
        .handle_trades(trade_sync(terminal.id, entries))
        .await
        .unwrap();

    assert_eq!((summary.imported, summary.skipped), (10, 0));
    assert_eq!(store.trades().await.len(), 11);
}

#[tokio::test]
async fn transient_position_lookup_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let reconciler = reconciler(store.clone());
    let body = trade_sync(terminal.id, vec![position_trade(1001, 42, 0, "BUY")]);
    reconciler.handle_trades(body.clone()).await.unwrap();

    store
        .inject_fault(StoreOp::FindTradesByPosition, 2, Fault::Transient)
        .await;
    let summary = reconciler.handle_trades(body).await.unwrap();

    assert_eq!((summary.imported, summary.skipped), (0, 1));
    assert_eq!(store.trades().await.len(), 1);
}

#[tokio::test]
async fn exhausted_lookups_still_return_a_summary() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    for call in 1..=3 {
        store
            .inject_fault(StoreOp::FindTradesByPosition, call, Fault::Transient)
            .await;
        store
            .inject_fault(StoreOp::FindTradeByDeal, call, Fault::Transient)
            .await;
    }
    let legacy = |ticket: &str| {
        json!({
            "ticket": ticket,
            "symbol": "EURUSD",
            "type": "BUY",
            "volume": 0.1,
            "openPrice": 1.1,
            "openTime": "2024-03-01T10:00:00Z"
        })
    };

    let summary = reconciler(store.clone())
        .handle_trades(trade_sync(
            terminal.id,
            vec![
                position_trade(1001, 42, 0, "BUY"),
                legacy("7001"),
                legacy("7002"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!((summary.imported, summary.skipped), (1, 2));
    let trades = store.trades().await;
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].external_deal_id.as_deref(), Some("7002"));
    let stored = store.get_terminal(terminal.id).await.unwrap().unwrap();
    assert!(stored.last_sync_at.is_some());
}
