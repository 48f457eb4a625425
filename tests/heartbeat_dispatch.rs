mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use termfarm::adapters::MemoryStore;
use termfarm::domain::{CommandStatus, TerminalCommand, TerminalStatus, FETCH_CANDLES};
use termfarm::store::FarmStore;

use common::{farm, seeded_terminal};

#[tokio::test]
async fn heartbeat_without_commands_only_stamps_liveness() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Starting).await;
    let farm = farm(store.clone());

    let response = farm
        .dispatcher
        .handle_heartbeat(json!({ "terminalId": terminal.id.to_string() }))
        .await
        .unwrap();

    assert!(response.success);
    assert!(response.command.is_none());
    let body = serde_json::to_value(&response).unwrap();
    assert!(body.get("command").is_none());

    let stored = store.get_terminal(terminal.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TerminalStatus::Running);
    assert!(stored.last_heartbeat.is_some());
}

#[tokio::test]
async fn heartbeat_does_not_revive_stopping_or_errored_terminals() {
    for status in [
        TerminalStatus::Stopping,
        TerminalStatus::Stopped,
        TerminalStatus::Error,
    ] {
        let store = Arc::new(MemoryStore::new());
        let (_, terminal) = seeded_terminal(&store, status).await;
        let farm = farm(store.clone());

        farm.dispatcher
            .handle_heartbeat(json!({ "terminalId": terminal.id.to_string() }))
            .await
            .unwrap();

        let stored = store.get_terminal(terminal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, status);
        assert!(stored.last_heartbeat.is_some());
    }
}

#[tokio::test]
async fn heartbeat_propagates_account_telemetry() {
    let store = Arc::new(MemoryStore::new());
    let (acct, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let farm = farm(store.clone());

    farm.dispatcher
        .handle_heartbeat(json!({
            "terminalId": terminal.id.to_string(),
            "accountInfo": { "balance": 10250.5, "equity": 10300.0, "margin": 120.0, "freeMargin": 10180.0 }
        }))
        .await
        .unwrap();

    let stored = store.get_account(acct.id).await.unwrap().unwrap();
    assert_eq!(stored.current_balance, dec!(10250.5));
    assert_eq!(stored.equity, Some(dec!(10300)));
    assert_eq!(stored.free_margin, Some(dec!(10180)));
}

#[tokio::test]
async fn commands_are_handed_out_oldest_first_one_per_heartbeat() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
    let first = TerminalCommand::new_pending(terminal.id, FETCH_CANDLES, Some("a".into()), Utc::now());
    let second = TerminalCommand::new_pending(
        terminal.id,
        FETCH_CANDLES,
        Some("b".into()),
        Utc::now() + chrono::Duration::seconds(1),
    );
    store.insert_command(&first).await.unwrap();
    store.insert_command(&second).await.unwrap();
    let farm = farm(store.clone());
    let body = json!({ "terminalId": terminal.id.to_string() });

    let r1 = farm.dispatcher.handle_heartbeat(body.clone()).await.unwrap();
    let r2 = farm.dispatcher.handle_heartbeat(body.clone()).await.unwrap();
    let r3 = farm.dispatcher.handle_heartbeat(body).await.unwrap();

    assert_eq!(r1.payload.as_deref(), Some("a"));
    assert_eq!(r2.payload.as_deref(), Some("b"));
    assert!(r3.command.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_heartbeats_dispatch_a_command_exactly_once() {
    for _ in 0..20 {
        let store = Arc::new(MemoryStore::new());
        let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;
        let command = TerminalCommand::new_pending(terminal.id, FETCH_CANDLES, Some("p".into()), Utc::now());
        store.insert_command(&command).await.unwrap();
        let farm = farm(store.clone());

        let body = json!({ "terminalId": terminal.id.to_string() });
        let (a, b) = tokio::join!(
            tokio::spawn({
                let farm = farm.clone();
                let body = body.clone();
                async move { farm.dispatcher.handle_heartbeat(body).await }
            }),
            tokio::spawn({
                let farm = farm.clone();
                let body = body.clone();
                async move { farm.dispatcher.handle_heartbeat(body).await }
            }),
        );
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

        assert!(a.success && b.success);
        let delivered = [&a, &b].iter().filter(|r| r.command.is_some()).count();
        assert_eq!(delivered, 1);

        let commands = store.list_commands(terminal.id).await.unwrap();
        assert_eq!(commands[0].status, CommandStatus::Dispatched);
    }
}
