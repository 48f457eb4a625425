//! In-process store for tests and `serve --memory`.
//!
//! All tables sit behind one async mutex and every trait method takes it exactly once,
//! so each call is atomic just like its single-statement Postgres counterpart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    AccountTelemetry, BalanceSnapshot, BrokerAccount, ChartData, CommandStatus,
    ConnectionStatus, QuotaCheck, SyncConnection, TerminalCommand, TerminalInstance,
    TerminalMetadata, TerminalStatus, TradeClose, TradeRecord, TradeStatus,
};
use crate::error::{FarmError, Result};
use crate::store::FarmStore;

/// Trade ledger operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    FindTradesByPosition,
    FindTradeByDeal,
    InsertTrades,
    UpdateTrade,
    UpsertDeal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fails like a dropped connection; the retry utility will try again
    Transient,
    /// Fails like a constraint violation
    Permanent,
}

#[derive(Default)]
struct Tables {
    terminals: Vec<TerminalInstance>,
    accounts: HashMap<Uuid, BrokerAccount>,
    commands: Vec<TerminalCommand>,
    trades: Vec<TradeRecord>,
    connections: HashMap<Uuid, SyncConnection>,
    calls: HashMap<StoreOp, usize>,
    faults: HashMap<(StoreOp, usize), Fault>,
    insert_batches: Vec<usize>,
}

impl Tables {
    /// Count the call and return its scripted fault, if any
    fn check_fault(&mut self, op: StoreOp) -> Result<()> {
        let call = self.calls.entry(op).or_insert(0);
        *call += 1;
        match self.faults.get(&(op, *call)) {
            Some(Fault::Transient) => Err(FarmError::Transient(format!(
                "injected network failure on {:?} call {}",
                op, call
            ))),
            Some(Fault::Permanent) => Err(FarmError::PermanentWrite(format!(
                "injected constraint violation on {:?} call {}",
                op, call
            ))),
            None => Ok(()),
        }
    }

    fn terminal_mut(&mut self, id: Uuid) -> Option<&mut TerminalInstance> {
        self.terminals.iter_mut().find(|t| t.id == id)
    }

    fn trade_conflicts(&self, candidate: &TradeRecord, pending: &[TradeRecord]) -> bool {
        self.trades.iter().chain(pending.iter()).any(|existing| {
            existing.account_id == candidate.account_id
                && ((existing.external_id.is_some()
                    && existing.external_id == candidate.external_id)
                    || (is_ticket_keyed(existing)
                        && is_ticket_keyed(candidate)
                        && existing.external_deal_id == candidate.external_deal_id))
        })
    }
}

/// Rows covered by the `(account, deal id)` uniqueness rule
fn is_ticket_keyed(trade: &TradeRecord) -> bool {
    trade.external_id.is_none() && trade.external_deal_id.is_some()
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: BrokerAccount) {
        self.tables.lock().await.accounts.insert(account.id, account);
    }

    pub async fn insert_connection(&self, connection: SyncConnection) {
        self.tables
            .lock()
            .await
            .connections
            .insert(connection.id, connection);
    }

    /// Seed a terminal without the live-instance check
    pub async fn insert_terminal(&self, terminal: TerminalInstance) {
        self.tables.lock().await.terminals.push(terminal);
    }

    /// Seed a ledger row without fault injection
    pub async fn insert_trade(&self, trade: TradeRecord) {
        self.tables.lock().await.trades.push(trade);
    }

    pub async fn trades(&self) -> Vec<TradeRecord> {
        self.tables.lock().await.trades.clone()
    }

    pub async fn terminals(&self) -> Vec<TerminalInstance> {
        self.tables.lock().await.terminals.clone()
    }

    /// Fail the `call`-th (1-based) invocation of `op`, counting retries
    pub async fn inject_fault(&self, op: StoreOp, call: usize, fault: Fault) {
        self.tables.lock().await.faults.insert((op, call), fault);
    }

    /// Sizes of the trade chunks that were written successfully, in order
    pub async fn insert_batch_sizes(&self) -> Vec<usize> {
        self.tables.lock().await.insert_batches.clone()
    }
}

#[async_trait]
impl FarmStore for MemoryStore {
    async fn get_terminal(&self, id: Uuid) -> Result<Option<TerminalInstance>> {
        let tables = self.tables.lock().await;
        Ok(tables.terminals.iter().find(|t| t.id == id).cloned())
    }

    async fn get_terminal_by_account(&self, account_id: Uuid) -> Result<Option<TerminalInstance>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .terminals
            .iter()
            .filter(|t| t.account_id == account_id)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn create_terminal(&self, terminal: &TerminalInstance) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let live_exists = tables
            .terminals
            .iter()
            .any(|t| t.account_id == terminal.account_id && t.status.is_live());
        if live_exists && terminal.status.is_live() {
            return Err(FarmError::AlreadyEnabled(terminal.account_id.to_string()));
        }
        tables.terminals.push(terminal.clone());
        Ok(())
    }

    async fn transition_terminal(
        &self,
        id: Uuid,
        from: &[TerminalStatus],
        to: TerminalStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;

        if to.is_live() {
            let account_id = tables.terminals.iter().find(|t| t.id == id).map(|t| t.account_id);
            let other_live = tables
                .terminals
                .iter()
                .any(|t| t.id != id && Some(t.account_id) == account_id && t.status.is_live());
            if other_live {
                return Ok(false);
            }
        }

        match tables.terminal_mut(id) {
            Some(terminal) if from.contains(&terminal.status) => {
                terminal.status = to;
                terminal.updated_at = now;
                if to != TerminalStatus::Error {
                    terminal.error_message = None;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.terminal_mut(id) {
            Some(terminal) => {
                terminal.last_heartbeat = Some(now);
                terminal.updated_at = now;
                if terminal.status.accepts_heartbeat_promotion() {
                    terminal.status = TerminalStatus::Running;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_terminal_error(
        &self,
        id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(terminal) = tables.terminal_mut(id) {
            terminal.status = TerminalStatus::Error;
            terminal.error_message = Some(message.to_string());
            terminal.updated_at = now;
        }
        Ok(())
    }

    async fn list_live_terminals(&self) -> Result<Vec<TerminalInstance>> {
        let tables = self.tables.lock().await;
        let mut live: Vec<_> = tables
            .terminals
            .iter()
            .filter(|t| t.status.is_live())
            .cloned()
            .collect();
        live.sort_by_key(|t| t.created_at);
        Ok(live)
    }

    async fn set_terminal_synced(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(terminal) = tables.terminal_mut(id) {
            terminal.last_sync_at = Some(now);
            terminal.updated_at = now;
        }
        Ok(())
    }

    async fn set_terminal_metadata(
        &self,
        id: Uuid,
        metadata: &TerminalMetadata,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(terminal) = tables.terminal_mut(id) {
            terminal.metadata = metadata.clone();
            terminal.updated_at = now;
        }
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<BrokerAccount>> {
        Ok(self.tables.lock().await.accounts.get(&id).cloned())
    }

    async fn set_terminal_enabled(&self, account_id: Uuid, enabled: bool) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(account) = tables.accounts.get_mut(&account_id) {
            account.terminal_enabled = enabled;
        }
        Ok(())
    }

    async fn update_account_telemetry(
        &self,
        account_id: Uuid,
        telemetry: &AccountTelemetry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(account) = tables.accounts.get_mut(&account_id) {
            account.current_balance = telemetry.balance;
            account.equity = Some(telemetry.equity);
            account.margin = telemetry.margin;
            account.free_margin = telemetry.free_margin;
            account.updated_at = now;
        }
        Ok(())
    }

    async fn set_account_balance(
        &self,
        account_id: Uuid,
        snapshot: &BalanceSnapshot,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(account) = tables.accounts.get_mut(&account_id) {
            account.current_balance = snapshot.current_balance;
            account.total_dd_current = snapshot.total_dd_current;
        }
        Ok(())
    }

    async fn insert_command(&self, command: &TerminalCommand) -> Result<()> {
        self.tables.lock().await.commands.push(command.clone());
        Ok(())
    }

    async fn oldest_pending_command(&self, terminal_id: Uuid) -> Result<Option<TerminalCommand>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .commands
            .iter()
            .filter(|c| c.terminal_id == terminal_id && c.status == CommandStatus::Pending)
            .min_by_key(|c| c.created_at)
            .cloned())
    }

    async fn try_dispatch_command(&self, command_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables
            .commands
            .iter_mut()
            .find(|c| c.id == command_id && c.status == CommandStatus::Pending)
        {
            Some(command) => {
                command.status = CommandStatus::Dispatched;
                command.dispatched_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_commands_for_trade(
        &self,
        terminal_id: Uuid,
        trade_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let suffix = format!(",{}", trade_id);
        let mut tables = self.tables.lock().await;
        let mut completed = 0;
        for command in tables.commands.iter_mut().filter(|c| {
            c.terminal_id == terminal_id
                && c.status == CommandStatus::Dispatched
                && c.payload.as_deref().map(|p| p.ends_with(&suffix)).unwrap_or(false)
        }) {
            command.status = CommandStatus::Completed;
            command.completed_at = Some(now);
            completed += 1;
        }
        Ok(completed)
    }

    async fn list_commands(&self, terminal_id: Uuid) -> Result<Vec<TerminalCommand>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .commands
            .iter()
            .filter(|c| c.terminal_id == terminal_id)
            .cloned()
            .collect())
    }

    async fn find_trades_by_external_ids(
        &self,
        account_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<TradeRecord>> {
        let wanted: HashSet<&str> = external_ids.iter().map(String::as_str).collect();
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::FindTradesByPosition)?;
        Ok(tables
            .trades
            .iter()
            .filter(|t| {
                t.account_id == account_id
                    && t.external_id
                        .as_deref()
                        .map(|id| wanted.contains(id))
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_trade_by_deal_id(
        &self,
        account_id: Uuid,
        deal_id: &str,
    ) -> Result<Option<TradeRecord>> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::FindTradeByDeal)?;
        Ok(tables
            .trades
            .iter()
            .find(|t| t.account_id == account_id && t.external_deal_id.as_deref() == Some(deal_id))
            .cloned())
    }

    async fn insert_trades(&self, trades: &[TradeRecord]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::InsertTrades)?;

        for (i, trade) in trades.iter().enumerate() {
            if tables.trade_conflicts(trade, &trades[..i]) {
                return Err(FarmError::PermanentWrite(format!(
                    "duplicate ledger key for account {} (position {:?}, deal {:?})",
                    trade.account_id, trade.external_id, trade.external_deal_id
                )));
            }
        }

        tables.trades.extend_from_slice(trades);
        tables.insert_batches.push(trades.len());
        Ok(())
    }

    async fn update_trade(&self, close: &TradeClose) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::UpdateTrade)?;

        let trade = tables
            .trades
            .iter_mut()
            .find(|t| t.id == close.trade_id)
            .ok_or_else(|| FarmError::not_found("trade", close.trade_id))?;
        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(close.exit_price);
        trade.exit_time = Some(close.exit_time);
        trade.pnl = close.pnl;
        trade.commission = close.commission;
        trade.swap = close.swap;
        if trade.contract_size.is_none() {
            trade.contract_size = close.contract_size;
        }
        Ok(())
    }

    async fn upsert_deal_trade(&self, trade: &TradeRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::UpsertDeal)?;

        let existing = tables.trades.iter().position(|t| {
            t.account_id == trade.account_id
                && is_ticket_keyed(t)
                && t.external_deal_id == trade.external_deal_id
        });
        match existing {
            Some(index) => {
                let id = tables.trades[index].id;
                tables.trades[index] = TradeRecord {
                    id,
                    ..trade.clone()
                };
            }
            None => tables.trades.push(trade.clone()),
        }
        Ok(())
    }

    async fn get_trade(&self, id: Uuid) -> Result<Option<TradeRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.trades.iter().find(|t| t.id == id).cloned())
    }

    async fn save_chart_data(&self, trade_id: Uuid, chart: &ChartData) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.trades.iter_mut().find(|t| t.id == trade_id) {
            Some(trade) => {
                trade.chart_data = Some(chart.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sum_trade_pnl(&self, account_id: Uuid) -> Result<Decimal> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trades
            .iter()
            .filter(|t| t.account_id == account_id)
            .map(|t| t.pnl)
            .sum())
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<SyncConnection>> {
        Ok(self.tables.lock().await.connections.get(&id).cloned())
    }

    async fn check_and_increment_sync(
        &self,
        connection_id: Uuid,
        max_syncs: i32,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<QuotaCheck> {
        let mut tables = self.tables.lock().await;
        let conn = tables
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| FarmError::not_found("connection", connection_id))?;

        let reset_needed = conn.syncs_reset_at <= now;
        if reset_needed {
            conn.syncs_this_month = 0;
            conn.syncs_reset_at = next_reset;
        }

        if conn.syncs_this_month + 1 > max_syncs {
            return Ok(QuotaCheck {
                can_sync: false,
                current_count: conn.syncs_this_month,
                reset_needed,
            });
        }

        conn.syncs_this_month += 1;
        Ok(QuotaCheck {
            can_sync: true,
            current_count: conn.syncs_this_month,
            reset_needed,
        })
    }

    async fn set_connection_status(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(conn) = tables.connections.get_mut(&id) {
            conn.status = status;
            conn.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn set_bridge_account(&self, id: Uuid, bridge_account_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(conn) = tables.connections.get_mut(&id) {
            conn.bridge_account_id = Some(bridge_account_id.to_string());
        }
        Ok(())
    }

    async fn mark_connection_synced(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(conn) = tables.connections.get_mut(&id) {
            conn.status = ConnectionStatus::Undeployed;
            conn.error_message = None;
            conn.last_synced_at = Some(now);
        }
        Ok(())
    }
}
