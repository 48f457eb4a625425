//! Trade reconciliation: broker deal events in, idempotent ledger writes out.
//!
//! Events carrying a position id are matched on `(account, position id)` against rows
//! fetched in one query up front. Legacy events without one are matched on their ticket.
//! Inserts are written in fixed-size chunks and updates one by one, each through the
//! retry policy. Lookups go through the same policy. A failed lookup, chunk or update
//! is counted as skipped and never aborts the rest of the call.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    detect_asset_type, BalanceSnapshot, EntryType, SyncSummary, TerminalInstance, TradeClose,
    TradeRecord, TradeStatus, TradeSyncPayload, ValidTrade,
};
use crate::error::{FarmError, Result};
use crate::retry::RetryPolicy;
use crate::services::metrics::{Metrics, SyncMetrics};
use crate::store::FarmStore;
use crate::validation;

pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Writes queued while walking one batch
#[derive(Default)]
struct Plan {
    inserts: Vec<TradeRecord>,
    /// Position id -> index into `inserts`
    pending_positions: HashMap<String, usize>,
    /// Tickets queued on the legacy path
    pending_tickets: HashSet<String>,
    /// `(position id, ticket)` of every exit folded in this batch
    applied_exits: HashSet<(String, String)>,
    updates: Vec<TradeClose>,
    /// Trade id -> index into `updates`
    pending_updates: HashMap<Uuid, usize>,
    skipped: usize,
}

impl Plan {
    fn queue_update(&mut self, close: TradeClose) {
        match self.pending_updates.get(&close.trade_id) {
            Some(&idx) => self.updates[idx] = close,
            None => {
                self.pending_updates.insert(close.trade_id, self.updates.len());
                self.updates.push(close);
            }
        }
    }
}

/// Fold an exit deal into a row: close it and accumulate pnl, commission and swap
fn apply_exit(row: &mut TradeRecord, trade: &ValidTrade) {
    row.status = TradeStatus::Closed;
    row.exit_price = Some(trade.open_price);
    row.exit_time = Some(trade.open_time);
    row.pnl += trade.profit;
    row.commission += trade.commission;
    row.swap += trade.swap;
    if row.contract_size.is_none() {
        row.contract_size = trade.contract_size;
    }
}

fn close_of(row: &TradeRecord, exit_price: Decimal, exit_time: DateTime<Utc>) -> TradeClose {
    TradeClose {
        trade_id: row.id,
        exit_price,
        exit_time,
        pnl: row.pnl,
        commission: row.commission,
        swap: row.swap,
        contract_size: row.contract_size,
    }
}

fn base_row(terminal: &TerminalInstance, trade: &ValidTrade) -> TradeRecord {
    TradeRecord {
        id: Uuid::new_v4(),
        user_id: terminal.user_id,
        account_id: terminal.account_id,
        external_id: None,
        external_deal_id: Some(trade.ticket.clone()),
        status: TradeStatus::Open,
        symbol: trade.symbol.clone(),
        direction: trade.side.entry_direction(),
        entry_price: trade.open_price,
        entry_time: trade.open_time,
        exit_price: None,
        exit_time: None,
        size: trade.volume,
        pnl: trade.profit,
        commission: trade.commission,
        swap: trade.swap,
        stop_loss: trade.stop_loss,
        take_profit: trade.take_profit,
        contract_size: trade.contract_size,
        asset_type: detect_asset_type(&trade.symbol),
        magic_number: trade.magic,
        notes: None,
        is_orphan: false,
        chart_data: None,
    }
}

/// Ledger row for a position's entry deal
pub fn entry_row(terminal: &TerminalInstance, trade: &ValidTrade, position_id: &str) -> TradeRecord {
    TradeRecord {
        external_id: Some(position_id.to_string()),
        notes: Some(format!(
            "Auto-synced via Terminal Farm. Position ID: {}",
            position_id
        )),
        ..base_row(terminal, trade)
    }
}

/// Standalone CLOSED row for an exit whose entry predates the sync window
pub fn orphan_exit_row(
    terminal: &TerminalInstance,
    trade: &ValidTrade,
    position_id: &str,
) -> TradeRecord {
    TradeRecord {
        external_id: Some(position_id.to_string()),
        status: TradeStatus::Closed,
        direction: trade.side.exit_direction(),
        entry_price: Decimal::ZERO,
        exit_price: Some(trade.open_price),
        exit_time: Some(trade.open_time),
        notes: Some(format!(
            "Orphan Exit Synced (Entry missing). Position ID: {}",
            position_id
        )),
        is_orphan: true,
        ..base_row(terminal, trade)
    }
}

/// Ticket-keyed row from an agent that does not report positions
pub fn legacy_row(terminal: &TerminalInstance, trade: &ValidTrade) -> TradeRecord {
    let status = if trade.close_time.is_some() {
        TradeStatus::Closed
    } else {
        TradeStatus::Open
    };
    TradeRecord {
        status,
        exit_price: trade.close_price,
        exit_time: trade.close_time,
        notes: Some(format!("Auto-synced from MT5. Ticket: {}", trade.ticket)),
        ..base_row(terminal, trade)
    }
}

/// Recompute `initial + sum(pnl)` and the drawdown for an account
pub async fn refresh_account_balance(store: &dyn FarmStore, account_id: Uuid) -> Result<()> {
    let Some(account) = store.get_account(account_id).await? else {
        return Err(FarmError::not_found("broker account", account_id));
    };
    let total_pnl = store.sum_trade_pnl(account_id).await?;
    let snapshot = BalanceSnapshot::compute(account.initial_balance, total_pnl);
    store.set_account_balance(account_id, &snapshot).await?;
    debug!(
        %account_id,
        balance = %snapshot.current_balance,
        drawdown = %snapshot.total_dd_current,
        "account balance refreshed"
    );
    Ok(())
}

#[derive(Clone)]
pub struct TradeReconciler {
    store: Arc<dyn FarmStore>,
    retry: RetryPolicy,
    chunk_size: usize,
    metrics: Arc<Metrics>,
}

impl TradeReconciler {
    pub fn new(
        store: Arc<dyn FarmStore>,
        retry: RetryPolicy,
        chunk_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            retry,
            chunk_size: chunk_size.max(1),
            metrics,
        }
    }

    /// Validate a raw trade sync message and reconcile it
    pub async fn handle_trades(&self, body: Value) -> Result<SyncSummary> {
        let payload = validation::parse_trade_sync(body)?;
        self.process_trades(payload).await
    }

    #[instrument(skip(self, payload), fields(terminal_id = %payload.terminal_id, trades = payload.trades.len()))]
    pub async fn process_trades(&self, payload: TradeSyncPayload) -> Result<SyncSummary> {
        let started = Instant::now();
        let terminal = self
            .store
            .get_terminal(payload.terminal_id)
            .await?
            .ok_or_else(|| FarmError::not_found("terminal", payload.terminal_id))?;

        let processed = payload.trades.len() + payload.rejected;
        info!("processing {} trades", processed);

        let mut plan = self.plan(&terminal, &payload.trades).await;
        plan.skipped += payload.rejected;
        let batch_size = plan.inserts.len();

        let mut imported = 0;
        let mut skipped = plan.skipped;
        let mut errors = 0;

        for (index, chunk) in plan.inserts.chunks(self.chunk_size).enumerate() {
            let start = index * self.chunk_size;
            let end = start + chunk.len();
            let label = format!("insert trades {}-{}", start, end);
            match self.retry.run(&label, || self.store.insert_trades(chunk)).await {
                Ok(()) => imported += chunk.len(),
                Err(e) => {
                    error!(start, end, "batch insert failed: {}", e);
                    skipped += chunk.len();
                    errors += 1;
                }
            }
        }

        for close in &plan.updates {
            let label = format!("close trade {}", close.trade_id);
            match self.retry.run(&label, || self.store.update_trade(close)).await {
                Ok(()) => imported += 1,
                Err(e) => {
                    error!(trade_id = %close.trade_id, "trade update failed: {}", e);
                    skipped += 1;
                    errors += 1;
                }
            }
        }

        let now = Utc::now();
        if let Err(e) = self.store.set_terminal_synced(terminal.id, now).await {
            warn!("failed to stamp last sync: {}", e);
        }
        if let Err(e) = refresh_account_balance(self.store.as_ref(), terminal.account_id).await {
            warn!(account_id = %terminal.account_id, "balance refresh failed: {}", e);
        }

        self.metrics.record_sync(&SyncMetrics {
            terminal_id: terminal.id,
            timestamp: now,
            trades_processed: processed,
            trades_imported: imported,
            trades_skipped: skipped,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
            batch_size: (batch_size > 0).then_some(batch_size),
        });

        Ok(SyncSummary { imported, skipped })
    }

    /// Classify every trade into inserts, updates or skips
    async fn plan(&self, terminal: &TerminalInstance, trades: &[ValidTrade]) -> Plan {
        let position_ids: Vec<String> = trades
            .iter()
            .filter_map(|t| t.position_key().map(|(id, _)| id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        // Without the existing rows position events cannot be matched safely
        let mut lookup_failed = false;
        let mut existing: HashMap<String, TradeRecord> = HashMap::new();
        if !position_ids.is_empty() {
            let fetched = self
                .retry
                .run("find trades by position", || {
                    self.store
                        .find_trades_by_external_ids(terminal.account_id, &position_ids)
                })
                .await;
            match fetched {
                Ok(rows) => {
                    existing = rows
                        .into_iter()
                        .filter_map(|row| row.external_id.clone().map(|id| (id, row)))
                        .collect();
                }
                Err(e) => {
                    error!(positions = position_ids.len(), "position lookup failed: {}", e);
                    lookup_failed = true;
                }
            }
        }

        let mut plan = Plan::default();
        // Rows already closed by an earlier exit in this batch keep accumulating fills
        let mut closed_here: HashSet<Uuid> = HashSet::new();

        for trade in trades {
            if lookup_failed && trade.position_key().is_some() {
                plan.skipped += 1;
                continue;
            }
            match trade.position_key() {
                Some((position_id, EntryType::In)) => {
                    if existing.contains_key(&position_id)
                        || plan.pending_positions.contains_key(&position_id)
                    {
                        debug!(position_id = %position_id, "entry already recorded");
                        plan.skipped += 1;
                        continue;
                    }
                    plan.pending_positions
                        .insert(position_id.clone(), plan.inserts.len());
                    plan.inserts.push(entry_row(terminal, trade, &position_id));
                }
                Some((position_id, _exit)) => {
                    let exit_key = (position_id.clone(), trade.ticket.clone());
                    if plan.applied_exits.contains(&exit_key) {
                        debug!(position_id = %position_id, ticket = %trade.ticket, "exit redelivered");
                        plan.skipped += 1;
                        continue;
                    }
                    plan.applied_exits.insert(exit_key);

                    if let Some(&idx) = plan.pending_positions.get(&position_id) {
                        apply_exit(&mut plan.inserts[idx], trade);
                        continue;
                    }

                    let Some(row) = existing.get_mut(&position_id) else {
                        plan.pending_positions
                            .insert(position_id.clone(), plan.inserts.len());
                        plan.inserts
                            .push(orphan_exit_row(terminal, trade, &position_id));
                        continue;
                    };

                    if row.status == TradeStatus::Open || closed_here.contains(&row.id) {
                        apply_exit(row, trade);
                        closed_here.insert(row.id);
                        plan.queue_update(close_of(row, trade.open_price, trade.open_time));
                    } else if row.contract_size.is_none() && trade.contract_size.is_some() {
                        // Closed earlier without a contract size: backfill only
                        row.contract_size = trade.contract_size;
                        let (exit_price, exit_time) = (
                            row.exit_price.unwrap_or(trade.open_price),
                            row.exit_time.unwrap_or(trade.open_time),
                        );
                        plan.queue_update(close_of(row, exit_price, exit_time));
                    } else {
                        debug!(position_id = %position_id, "position already closed");
                        plan.skipped += 1;
                    }
                }
                None => {
                    if plan.pending_tickets.contains(&trade.ticket) {
                        debug!(ticket = %trade.ticket, "ticket already queued");
                        plan.skipped += 1;
                        continue;
                    }
                    let label = format!("find trade by ticket {}", trade.ticket);
                    let found = self
                        .retry
                        .run(&label, || {
                            self.store
                                .find_trade_by_deal_id(terminal.account_id, &trade.ticket)
                        })
                        .await;
                    match found {
                        Ok(None) => {}
                        Ok(Some(_)) => {
                            debug!(ticket = %trade.ticket, "ticket already recorded");
                            plan.skipped += 1;
                            continue;
                        }
                        Err(e) => {
                            error!(ticket = %trade.ticket, "ticket lookup failed: {}", e);
                            plan.skipped += 1;
                            continue;
                        }
                    }
                    plan.pending_tickets.insert(trade.ticket.clone());
                    plan.inserts.push(legacy_row(terminal, trade));
                }
            }
        }

        plan
    }
}
