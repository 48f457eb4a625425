//! Storage contract for the terminal farm.
//!
//! Every method is a single storage-side operation. The conditional ones
//! (`transition_terminal`, `try_dispatch_command`, `check_and_increment_sync`) must be
//! atomic against concurrent callers: implementations guard them with a status
//! predicate or a row lock, never with a read followed by a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    AccountTelemetry, BalanceSnapshot, BrokerAccount, ChartData, ConnectionStatus, QuotaCheck,
    SyncConnection, TerminalCommand, TerminalInstance, TerminalMetadata, TerminalStatus,
    TradeClose, TradeRecord,
};
use crate::error::Result;

#[async_trait]
pub trait FarmStore: Send + Sync {
    // Terminals

    async fn get_terminal(&self, id: Uuid) -> Result<Option<TerminalInstance>>;

    /// Most recently created instance for the account, whatever its state
    async fn get_terminal_by_account(&self, account_id: Uuid) -> Result<Option<TerminalInstance>>;

    /// Insert a new instance. A second live instance for the same account is refused
    /// with `FarmError::AlreadyEnabled`.
    async fn create_terminal(&self, terminal: &TerminalInstance) -> Result<()>;

    /// Move to `to` only if the current status is one of `from`.
    ///
    /// Clears the error message unless `to` is ERROR. Returns whether the row changed.
    async fn transition_terminal(
        &self,
        id: Uuid,
        from: &[TerminalStatus],
        to: TerminalStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Stamp the heartbeat and promote PENDING/STARTING/RUNNING to RUNNING.
    ///
    /// STOPPING, STOPPED and ERROR keep their status: a late heartbeat from a terminal
    /// being torn down must not revive it, and ERROR is only cleared by a restart.
    /// Returns false when the terminal does not exist.
    async fn record_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn mark_terminal_error(&self, id: Uuid, message: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// Instances in PENDING, STARTING, RUNNING or STOPPING
    async fn list_live_terminals(&self) -> Result<Vec<TerminalInstance>>;

    async fn set_terminal_synced(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn set_terminal_metadata(
        &self,
        id: Uuid,
        metadata: &TerminalMetadata,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // Broker accounts

    async fn get_account(&self, id: Uuid) -> Result<Option<BrokerAccount>>;

    async fn set_terminal_enabled(&self, account_id: Uuid, enabled: bool) -> Result<()>;

    async fn update_account_telemetry(
        &self,
        account_id: Uuid,
        telemetry: &AccountTelemetry,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_account_balance(&self, account_id: Uuid, snapshot: &BalanceSnapshot)
        -> Result<()>;

    // Commands

    async fn insert_command(&self, command: &TerminalCommand) -> Result<()>;

    async fn oldest_pending_command(&self, terminal_id: Uuid) -> Result<Option<TerminalCommand>>;

    /// PENDING -> DISPATCHED, succeeding for exactly one caller per command
    async fn try_dispatch_command(&self, command_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Complete the terminal's DISPATCHED commands whose payload ends in `,<trade_id>`
    async fn complete_commands_for_trade(
        &self,
        terminal_id: Uuid,
        trade_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn list_commands(&self, terminal_id: Uuid) -> Result<Vec<TerminalCommand>>;

    // Ledger

    /// Rows of `account_id` whose position id is in `external_ids`, in one round trip
    async fn find_trades_by_external_ids(
        &self,
        account_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<TradeRecord>>;

    async fn find_trade_by_deal_id(
        &self,
        account_id: Uuid,
        deal_id: &str,
    ) -> Result<Option<TradeRecord>>;

    /// Insert a chunk of rows atomically: all of them or none
    async fn insert_trades(&self, trades: &[TradeRecord]) -> Result<()>;

    async fn update_trade(&self, close: &TradeClose) -> Result<()>;

    /// Insert or overwrite the row keyed by (account, deal id)
    async fn upsert_deal_trade(&self, trade: &TradeRecord) -> Result<()>;

    async fn get_trade(&self, id: Uuid) -> Result<Option<TradeRecord>>;

    /// Returns false when the trade does not exist
    async fn save_chart_data(&self, trade_id: Uuid, chart: &ChartData) -> Result<bool>;

    async fn sum_trade_pnl(&self, account_id: Uuid) -> Result<Decimal>;

    // Scheduled connections

    async fn get_connection(&self, id: Uuid) -> Result<Option<SyncConnection>>;

    /// Atomic monthly quota gate.
    ///
    /// If `syncs_reset_at` has passed the counter restarts at zero and the reset moves to
    /// `next_reset`. The counter is incremented only when the result stays within
    /// `max_syncs`. Unknown connections yield `FarmError::NotFound`.
    async fn check_and_increment_sync(
        &self,
        connection_id: Uuid,
        max_syncs: i32,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<QuotaCheck>;

    async fn set_connection_status(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn set_bridge_account(&self, id: Uuid, bridge_account_id: &str) -> Result<()>;

    /// Successful sync: status undeployed, error cleared, `last_synced_at = now`
    async fn mark_connection_synced(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;
}
