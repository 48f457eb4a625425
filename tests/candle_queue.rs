mod common;

use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use termfarm::adapters::MemoryStore;
use termfarm::domain::{CommandStatus, TerminalStatus, TradeRecord, FETCH_CANDLES};
use termfarm::services::candles::CHART_SOURCE;
use termfarm::services::TerminalFarm;
use termfarm::store::FarmStore;

use common::{farm, position_trade, seeded_terminal, trade_sync};

async fn farm_with_trade(status: TerminalStatus) -> (Arc<MemoryStore>, TerminalFarm, uuid::Uuid, TradeRecord) {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, status).await;
    let farm = farm(store.clone());
    farm.reconciler
        .handle_trades(trade_sync(terminal.id, vec![position_trade(1, 1, 0, "BUY")]))
        .await
        .unwrap();
    let trade = store.trades().await.remove(0);
    (store, farm, terminal.id, trade)
}

#[tokio::test]
async fn queued_command_carries_fetch_payload() {
    let (store, farm, terminal_id, trade) = farm_with_trade(TerminalStatus::Running).await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

    let command = farm
        .candles
        .queue_fetch_candles(trade.id, "EURUSD", "1min", start, end)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(command.command, FETCH_CANDLES);
    assert_eq!(command.status, CommandStatus::Pending);
    assert_eq!(
        command.payload.as_deref(),
        Some(format!("EURUSD,1min,2024-01-01 00:00:00,2024-01-01 02:00:00,{}", trade.id).as_str())
    );
    assert_eq!(store.list_commands(terminal_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn nothing_is_queued_without_running_terminal() {
    let (store, farm, terminal_id, trade) = farm_with_trade(TerminalStatus::Pending).await;

    let queued = farm
        .candles
        .queue_fetch_candles(trade.id, "EURUSD", "1min", Utc::now(), Utc::now())
        .await
        .unwrap();

    assert!(queued.is_none());
    assert!(store.list_commands(terminal_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn candle_result_completes_dispatched_command() {
    let (store, farm, terminal_id, trade) = farm_with_trade(TerminalStatus::Running).await;
    let queued = farm
        .candles
        .queue_fetch_candles(trade.id, "EURUSD", "1min", Utc::now(), Utc::now())
        .await
        .unwrap()
        .unwrap();

    // A second request for the same trade that no agent has picked up yet
    farm.dispatcher
        .handle_heartbeat(json!({ "terminalId": terminal_id.to_string() }))
        .await
        .unwrap();
    let still_pending = farm
        .candles
        .queue_fetch_candles(trade.id, "EURUSD", "5min", Utc::now(), Utc::now())
        .await
        .unwrap()
        .unwrap();

    let completed = farm
        .candles
        .handle_candles(json!({
            "terminalId": terminal_id.to_string(),
            "tradeId": trade.id.to_string(),
            "symbol": "EURUSD",
            "candles": [
                { "time": 1704067200, "open": 1.1, "high": 1.2, "low": 1.0, "close": 1.15 },
                { "time": 1704067260, "open": 1.15, "high": 1.16, "low": 1.14, "close": 1.155, "volume": 12.0 }
            ]
        }))
        .await
        .unwrap();
    assert_eq!(completed, 1);

    let commands = store.list_commands(terminal_id).await.unwrap();
    let status_of = |id: uuid::Uuid| commands.iter().find(|c| c.id == id).unwrap().status;
    assert_eq!(status_of(queued.id), CommandStatus::Completed);
    assert_eq!(status_of(still_pending.id), CommandStatus::Pending);

    let chart = store.get_trade(trade.id).await.unwrap().unwrap().chart_data.unwrap();
    assert_eq!(chart.candles.len(), 2);
    assert_eq!(chart.source, CHART_SOURCE);
}

#[tokio::test]
async fn queueing_for_unknown_trade_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let farm = farm(store);

    let err = farm
        .candles
        .queue_fetch_candles(uuid::Uuid::new_v4(), "EURUSD", "1min", Utc::now(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, termfarm::FarmError::NotFound { .. }));
}
