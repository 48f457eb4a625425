#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use termfarm::adapters::MemoryStore;
use termfarm::broker::BrokerBridge;
use termfarm::config::AppConfig;
use termfarm::crypto::PlaintextCipher;
use termfarm::domain::{
    BrokerAccount, ConnectionStatus, SyncConnection, TerminalInstance, TerminalStatus,
};
use termfarm::services::TerminalFarm;
use uuid::Uuid;

/// Default configuration with zero retry delays and plaintext credentials
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default_config();
    config.retry.initial_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.retry.jitter = 0.0;
    config.security.allow_plaintext_credentials = true;
    config
}

pub fn farm_with(store: Arc<MemoryStore>, bridge: Option<Arc<dyn BrokerBridge>>) -> TerminalFarm {
    TerminalFarm::new(
        &test_config(),
        store,
        Arc::new(PlaintextCipher::new(true)),
        bridge,
    )
}

pub fn farm(store: Arc<MemoryStore>) -> TerminalFarm {
    farm_with(store, None)
}

pub fn account(initial_balance: Decimal) -> BrokerAccount {
    BrokerAccount {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        server: "ICMarkets-Demo".to_string(),
        login: "5012345".to_string(),
        encrypted_password: "broker-pass".to_string(),
        initial_balance,
        current_balance: initial_balance,
        equity: None,
        margin: None,
        free_margin: None,
        total_dd_current: dec!(0),
        terminal_enabled: false,
        updated_at: Utc::now(),
    }
}

/// Seed an account with a terminal in `status`
pub async fn seeded_terminal(
    store: &MemoryStore,
    status: TerminalStatus,
) -> (BrokerAccount, TerminalInstance) {
    let account = account(dec!(10000));
    let mut terminal = TerminalInstance::new_pending(account.id, account.user_id, Utc::now());
    terminal.status = status;
    store.insert_account(account.clone()).await;
    store.insert_terminal(terminal.clone()).await;
    (account, terminal)
}

pub fn connection(account: &BrokerAccount, used: i32, reset_at: DateTime<Utc>) -> SyncConnection {
    SyncConnection {
        id: Uuid::new_v4(),
        user_id: account.user_id,
        account_id: account.id,
        server: account.server.clone(),
        login: account.login.clone(),
        encrypted_password: "broker-pass".to_string(),
        bridge_account_id: None,
        status: ConnectionStatus::Undeployed,
        error_message: None,
        last_synced_at: None,
        syncs_this_month: used,
        syncs_reset_at: reset_at,
    }
}

pub fn next_week() -> DateTime<Utc> {
    Utc::now() + Duration::days(7)
}

/// A position-keyed deal event as the agent sends it
pub fn position_trade(ticket: u64, position_id: i64, entry_type: i64, side: &str) -> Value {
    json!({
        "ticket": ticket.to_string(),
        "symbol": "EURUSD",
        "type": side,
        "volume": 1.0,
        "openPrice": 1.1000,
        "openTime": "2024-03-01T10:00:00Z",
        "commission": -3.5,
        "swap": -0.5,
        "profit": 0.0,
        "positionId": position_id,
        "entryType": entry_type,
        "contractSize": 100000.0
    })
}

pub fn trade_sync(terminal_id: Uuid, trades: Vec<Value>) -> Value {
    json!({ "terminalId": terminal_id.to_string(), "trades": trades })
}
