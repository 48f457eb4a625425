use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Row};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    AccountTelemetry, AssetType, BalanceSnapshot, BrokerAccount, ChartData, CommandStatus,
    ConnectionStatus, Direction, QuotaCheck, SyncConnection, TerminalCommand, TerminalInstance,
    TerminalMetadata, TerminalStatus, TradeClose, TradeRecord, TradeStatus, LIVE_STATUSES,
};
use crate::error::{FarmError, Result};
use crate::store::FarmStore;

const UNIQUE_VIOLATION: &str = "23505";
const LIVE_TERMINAL_INDEX: &str = "terminal_instances_one_live_per_account";

const TERMINAL_COLUMNS: &str = "id, account_id, user_id, status, last_heartbeat, last_sync_at, \
     error_message, metadata, created_at, updated_at";

const TRADE_COLUMNS: &str = "id, user_id, account_id, external_id, external_deal_id, status, \
     symbol, direction, entry_price, entry_time, exit_price, exit_time, size, pnl, commission, \
     swap, stop_loss, take_profit, contract_size, asset_type, magic_number, notes, is_orphan, \
     chart_data";

const COMMAND_COLUMNS: &str =
    "id, terminal_id, command, payload, status, created_at, dispatched_at, completed_at";

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Constraint violations are permanent; connection-level failures stay wrapped so
/// `FarmError::is_transient` can see them.
fn classify_write(err: sqlx::Error) -> FarmError {
    match &err {
        sqlx::Error::Database(db) if db.code().map(|c| c.starts_with("23")).unwrap_or(false) => {
            FarmError::PermanentWrite(db.message().to_string())
        }
        _ => FarmError::Database(err),
    }
}

fn is_live_index_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(UNIQUE_VIOLATION)
                && db.constraint() == Some(LIVE_TERMINAL_INDEX)
        }
        _ => false,
    }
}

fn parse_column<T>(
    raw: String,
    parse: impl FnOnce(&str) -> std::result::Result<T, String>,
) -> Result<T> {
    parse(&raw).map_err(FarmError::Internal)
}

fn terminal_from_row(r: &PgRow) -> Result<TerminalInstance> {
    Ok(TerminalInstance {
        id: r.try_get("id")?,
        account_id: r.try_get("account_id")?,
        user_id: r.try_get("user_id")?,
        status: parse_column(r.try_get("status")?, |s| TerminalStatus::try_from(s))?,
        last_heartbeat: r.try_get("last_heartbeat")?,
        last_sync_at: r.try_get("last_sync_at")?,
        error_message: r.try_get("error_message")?,
        metadata: TerminalMetadata::from_value(r.try_get::<Value, _>("metadata")?),
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn command_from_row(r: &PgRow) -> Result<TerminalCommand> {
    Ok(TerminalCommand {
        id: r.try_get("id")?,
        terminal_id: r.try_get("terminal_id")?,
        command: r.try_get("command")?,
        payload: r.try_get("payload")?,
        status: parse_column(r.try_get("status")?, |s| CommandStatus::try_from(s))?,
        created_at: r.try_get("created_at")?,
        dispatched_at: r.try_get("dispatched_at")?,
        completed_at: r.try_get("completed_at")?,
    })
}

fn trade_from_row(r: &PgRow) -> Result<TradeRecord> {
    Ok(TradeRecord {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        account_id: r.try_get("account_id")?,
        external_id: r.try_get("external_id")?,
        external_deal_id: r.try_get("external_deal_id")?,
        status: parse_column(r.try_get("status")?, |s| TradeStatus::try_from(s))?,
        symbol: r.try_get("symbol")?,
        direction: parse_column(r.try_get("direction")?, |s| Direction::try_from(s))?,
        entry_price: r.try_get("entry_price")?,
        entry_time: r.try_get("entry_time")?,
        exit_price: r.try_get("exit_price")?,
        exit_time: r.try_get("exit_time")?,
        size: r.try_get("size")?,
        pnl: r.try_get("pnl")?,
        commission: r.try_get("commission")?,
        swap: r.try_get("swap")?,
        stop_loss: r.try_get("stop_loss")?,
        take_profit: r.try_get("take_profit")?,
        contract_size: r.try_get("contract_size")?,
        asset_type: parse_column(r.try_get("asset_type")?, |s| AssetType::try_from(s))?,
        magic_number: r.try_get("magic_number")?,
        notes: r.try_get("notes")?,
        is_orphan: r.try_get("is_orphan")?,
        chart_data: r
            .try_get::<Option<Json<ChartData>>, _>("chart_data")?
            .map(|j| j.0),
    })
}

fn account_from_row(r: &PgRow) -> Result<BrokerAccount> {
    Ok(BrokerAccount {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        server: r.try_get("server")?,
        login: r.try_get("login")?,
        encrypted_password: r.try_get("encrypted_password")?,
        initial_balance: r.try_get("initial_balance")?,
        current_balance: r.try_get("current_balance")?,
        equity: r.try_get("equity")?,
        margin: r.try_get("margin")?,
        free_margin: r.try_get("free_margin")?,
        total_dd_current: r.try_get("total_dd_current")?,
        terminal_enabled: r.try_get("terminal_enabled")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn connection_from_row(r: &PgRow) -> Result<SyncConnection> {
    Ok(SyncConnection {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        account_id: r.try_get("account_id")?,
        server: r.try_get("server")?,
        login: r.try_get("login")?,
        encrypted_password: r.try_get("encrypted_password")?,
        bridge_account_id: r.try_get("bridge_account_id")?,
        status: parse_column(r.try_get("connection_status")?, |s| {
            ConnectionStatus::try_from(s)
        })?,
        error_message: r.try_get("error_message")?,
        last_synced_at: r.try_get("last_synced_at")?,
        syncs_this_month: r.try_get("syncs_this_month")?,
        syncs_reset_at: r.try_get("syncs_reset_at")?,
    })
}

fn status_list(statuses: &[TerminalStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl FarmStore for PostgresStore {
    // ==================== Terminals ====================

    async fn get_terminal(&self, id: Uuid) -> Result<Option<TerminalInstance>> {
        let sql = format!("SELECT {} FROM terminal_instances WHERE id = $1", TERMINAL_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(terminal_from_row).transpose()
    }

    async fn get_terminal_by_account(&self, account_id: Uuid) -> Result<Option<TerminalInstance>> {
        let sql = format!(
            "SELECT {} FROM terminal_instances WHERE account_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
            TERMINAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(terminal_from_row).transpose()
    }

    #[instrument(skip(self, terminal), fields(terminal_id = %terminal.id))]
    async fn create_terminal(&self, terminal: &TerminalInstance) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO terminal_instances
                (id, account_id, user_id, status, last_heartbeat, last_sync_at,
                 error_message, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(terminal.id)
        .bind(terminal.account_id)
        .bind(terminal.user_id)
        .bind(terminal.status.as_str())
        .bind(terminal.last_heartbeat)
        .bind(terminal.last_sync_at)
        .bind(&terminal.error_message)
        .bind(terminal.metadata.to_value())
        .bind(terminal.created_at)
        .bind(terminal.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_live_index_violation(&e) => {
                Err(FarmError::AlreadyEnabled(terminal.account_id.to_string()))
            }
            Err(e) => Err(classify_write(e)),
        }
    }

    #[instrument(skip(self))]
    async fn transition_terminal(
        &self,
        id: Uuid,
        from: &[TerminalStatus],
        to: TerminalStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminal_instances
            SET status = $2,
                updated_at = $3,
                error_message = CASE WHEN $2 = 'ERROR' THEN error_message ELSE NULL END
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(now)
        .bind(status_list(from))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            // Another live instance already owns the account
            Err(e) if is_live_index_violation(&e) => Ok(false),
            Err(e) => Err(classify_write(e)),
        }
    }

    async fn record_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminal_instances
            SET last_heartbeat = $2,
                updated_at = $2,
                status = CASE
                    WHEN status IN ('PENDING', 'STARTING', 'RUNNING') THEN 'RUNNING'
                    ELSE status
                END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_terminal_error(
        &self,
        id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE terminal_instances SET status = 'ERROR', error_message = $2, updated_at = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_live_terminals(&self) -> Result<Vec<TerminalInstance>> {
        let sql = format!(
            "SELECT {} FROM terminal_instances WHERE status = ANY($1) ORDER BY created_at",
            TERMINAL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status_list(&LIVE_STATUSES))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(terminal_from_row).collect()
    }

    async fn set_terminal_synced(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE terminal_instances SET last_sync_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_terminal_metadata(
        &self,
        id: Uuid,
        metadata: &TerminalMetadata,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE terminal_instances SET metadata = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(metadata.to_value())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Accounts ====================

    async fn get_account(&self, id: Uuid) -> Result<Option<BrokerAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, server, login, encrypted_password, initial_balance,
                   current_balance, equity, margin, free_margin, total_dd_current,
                   terminal_enabled, updated_at
            FROM broker_accounts WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn set_terminal_enabled(&self, account_id: Uuid, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE broker_accounts SET terminal_enabled = $2 WHERE id = $1")
            .bind(account_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_account_telemetry(
        &self,
        account_id: Uuid,
        telemetry: &AccountTelemetry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE broker_accounts
            SET current_balance = $2, equity = $3, margin = $4, free_margin = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(telemetry.balance)
        .bind(telemetry.equity)
        .bind(telemetry.margin)
        .bind(telemetry.free_margin)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_account_balance(
        &self,
        account_id: Uuid,
        snapshot: &BalanceSnapshot,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE broker_accounts SET current_balance = $2, total_dd_current = $3 WHERE id = $1",
        )
        .bind(account_id)
        .bind(snapshot.current_balance)
        .bind(snapshot.total_dd_current)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Commands ====================

    async fn insert_command(&self, command: &TerminalCommand) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO terminal_commands
                (id, terminal_id, command, payload, status, created_at, dispatched_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(command.id)
        .bind(command.terminal_id)
        .bind(&command.command)
        .bind(&command.payload)
        .bind(command.status.as_str())
        .bind(command.created_at)
        .bind(command.dispatched_at)
        .bind(command.completed_at)
        .execute(&self.pool)
        .await
        .map_err(classify_write)?;
        Ok(())
    }

    async fn oldest_pending_command(&self, terminal_id: Uuid) -> Result<Option<TerminalCommand>> {
        let sql = format!(
            "SELECT {} FROM terminal_commands WHERE terminal_id = $1 AND status = 'PENDING' \
             ORDER BY created_at LIMIT 1",
            COMMAND_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(terminal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(command_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn try_dispatch_command(&self, command_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminal_commands
            SET status = 'DISPATCHED', dispatched_at = $2
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(command_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() == 1;
        debug!(won, "conditional dispatch");
        Ok(won)
    }

    async fn complete_commands_for_trade(
        &self,
        terminal_id: Uuid,
        trade_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE terminal_commands
            SET status = 'COMPLETED', completed_at = $3
            WHERE terminal_id = $1 AND status = 'DISPATCHED' AND payload LIKE $2
            "#,
        )
        .bind(terminal_id)
        .bind(format!("%,{}", trade_id))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_commands(&self, terminal_id: Uuid) -> Result<Vec<TerminalCommand>> {
        let sql = format!(
            "SELECT {} FROM terminal_commands WHERE terminal_id = $1 ORDER BY created_at",
            COMMAND_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(terminal_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(command_from_row).collect()
    }

    // ==================== Ledger ====================

    async fn find_trades_by_external_ids(
        &self,
        account_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<TradeRecord>> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM trades WHERE account_id = $1 AND external_id = ANY($2)",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(external_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn find_trade_by_deal_id(
        &self,
        account_id: Uuid,
        deal_id: &str,
    ) -> Result<Option<TradeRecord>> {
        let sql = format!(
            "SELECT {} FROM trades WHERE account_id = $1 AND external_deal_id = $2",
            TRADE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .bind(deal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    #[instrument(skip(self, trades), fields(rows = trades.len()))]
    async fn insert_trades(&self, trades: &[TradeRecord]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }

        // One multi-row statement: the chunk lands entirely or not at all
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO trades ({}) ", TRADE_COLUMNS));
        builder.push_values(trades, |mut row, t| {
            row.push_bind(t.id)
                .push_bind(t.user_id)
                .push_bind(t.account_id)
                .push_bind(t.external_id.clone())
                .push_bind(t.external_deal_id.clone())
                .push_bind(t.status.as_str())
                .push_bind(t.symbol.clone())
                .push_bind(t.direction.as_str())
                .push_bind(t.entry_price)
                .push_bind(t.entry_time)
                .push_bind(t.exit_price)
                .push_bind(t.exit_time)
                .push_bind(t.size)
                .push_bind(t.pnl)
                .push_bind(t.commission)
                .push_bind(t.swap)
                .push_bind(t.stop_loss)
                .push_bind(t.take_profit)
                .push_bind(t.contract_size)
                .push_bind(t.asset_type.as_str())
                .push_bind(t.magic_number)
                .push_bind(t.notes.clone())
                .push_bind(t.is_orphan)
                .push_bind(t.chart_data.clone().map(Json));
        });

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(classify_write)?;
        Ok(())
    }

    async fn update_trade(&self, close: &TradeClose) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'CLOSED',
                exit_price = $2,
                exit_time = $3,
                pnl = $4,
                commission = $5,
                swap = $6,
                contract_size = COALESCE(contract_size, $7)
            WHERE id = $1
            "#,
        )
        .bind(close.trade_id)
        .bind(close.exit_price)
        .bind(close.exit_time)
        .bind(close.pnl)
        .bind(close.commission)
        .bind(close.swap)
        .bind(close.contract_size)
        .execute(&self.pool)
        .await
        .map_err(classify_write)?;

        if result.rows_affected() == 0 {
            return Err(FarmError::not_found("trade", close.trade_id));
        }
        Ok(())
    }

    async fn upsert_deal_trade(&self, t: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades
                (id, user_id, account_id, external_deal_id, status, symbol, direction,
                 entry_price, entry_time, exit_price, exit_time, size, pnl, commission, swap,
                 asset_type, magic_number, notes, is_orphan)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (account_id, external_deal_id)
                WHERE external_id IS NULL AND external_deal_id IS NOT NULL
            DO UPDATE SET
                status = EXCLUDED.status,
                symbol = EXCLUDED.symbol,
                direction = EXCLUDED.direction,
                entry_price = EXCLUDED.entry_price,
                entry_time = EXCLUDED.entry_time,
                exit_price = EXCLUDED.exit_price,
                exit_time = EXCLUDED.exit_time,
                size = EXCLUDED.size,
                pnl = EXCLUDED.pnl,
                commission = EXCLUDED.commission,
                swap = EXCLUDED.swap,
                magic_number = EXCLUDED.magic_number
            "#,
        )
        .bind(t.id)
        .bind(t.user_id)
        .bind(t.account_id)
        .bind(&t.external_deal_id)
        .bind(t.status.as_str())
        .bind(&t.symbol)
        .bind(t.direction.as_str())
        .bind(t.entry_price)
        .bind(t.entry_time)
        .bind(t.exit_price)
        .bind(t.exit_time)
        .bind(t.size)
        .bind(t.pnl)
        .bind(t.commission)
        .bind(t.swap)
        .bind(t.asset_type.as_str())
        .bind(t.magic_number)
        .bind(&t.notes)
        .bind(t.is_orphan)
        .execute(&self.pool)
        .await
        .map_err(classify_write)?;
        Ok(())
    }

    async fn get_trade(&self, id: Uuid) -> Result<Option<TradeRecord>> {
        let sql = format!("SELECT {} FROM trades WHERE id = $1", TRADE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn save_chart_data(&self, trade_id: Uuid, chart: &ChartData) -> Result<bool> {
        let result = sqlx::query("UPDATE trades SET chart_data = $2 WHERE id = $1")
            .bind(trade_id)
            .bind(Json(chart))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sum_trade_pnl(&self, account_id: Uuid) -> Result<Decimal> {
        let total: Option<Decimal> =
            sqlx::query_scalar("SELECT SUM(pnl) FROM trades WHERE account_id = $1")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(total.unwrap_or_default())
    }

    // ==================== Connections ====================

    async fn get_connection(&self, id: Uuid) -> Result<Option<SyncConnection>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, account_id, server, login, encrypted_password,
                   bridge_account_id, connection_status, error_message, last_synced_at,
                   syncs_this_month, syncs_reset_at
            FROM sync_connections WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(connection_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn check_and_increment_sync(
        &self,
        connection_id: Uuid,
        max_syncs: i32,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<QuotaCheck> {
        // Row lock + conditional increment in one statement
        let row = sqlx::query(
            r#"
            WITH locked AS (
                SELECT id,
                       CASE WHEN syncs_reset_at <= $3 THEN 0 ELSE syncs_this_month END AS base_count,
                       syncs_reset_at <= $3 AS reset_needed
                FROM sync_connections
                WHERE id = $1
                FOR UPDATE
            )
            UPDATE sync_connections AS c
            SET syncs_this_month = CASE
                    WHEN locked.base_count + 1 <= $2 THEN locked.base_count + 1
                    ELSE locked.base_count
                END,
                syncs_reset_at = CASE WHEN locked.reset_needed THEN $4 ELSE c.syncs_reset_at END
            FROM locked
            WHERE c.id = locked.id
            RETURNING locked.base_count + 1 <= $2 AS can_sync,
                      c.syncs_this_month AS current_count,
                      locked.reset_needed AS reset_needed
            "#,
        )
        .bind(connection_id)
        .bind(max_syncs)
        .bind(now)
        .bind(next_reset)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FarmError::not_found("connection", connection_id))?;

        Ok(QuotaCheck {
            can_sync: row.try_get("can_sync")?,
            current_count: row.try_get("current_count")?,
            reset_needed: row.try_get("reset_needed")?,
        })
    }

    async fn set_connection_status(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_connections SET connection_status = $2, error_message = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_bridge_account(&self, id: Uuid, bridge_account_id: &str) -> Result<()> {
        sqlx::query("UPDATE sync_connections SET bridge_account_id = $2 WHERE id = $1")
            .bind(id)
            .bind(bridge_account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_connection_synced(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_connections
            SET connection_status = 'undeployed', error_message = NULL, last_synced_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
