//! On-demand candle fetches routed through a trade's terminal.
//!
//! The command payload is `SYMBOL,TIMEFRAME,START,END,TRADEID`. The terminal echoes the
//! trade id back with its candles, which is how the DISPATCHED command is found again.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    CandlesPayload, ChartData, TerminalCommand, TerminalStatus, FETCH_CANDLES,
};
use crate::error::{FarmError, Result};
use crate::store::FarmStore;
use crate::validation;

const PAYLOAD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const CHART_SOURCE: &str = "terminal_farm";

pub fn fetch_candles_payload(
    trade_id: Uuid,
    symbol: &str,
    timeframe: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    format!(
        "{},{},{},{},{}",
        symbol,
        timeframe,
        start.format(PAYLOAD_TIME_FORMAT),
        end.format(PAYLOAD_TIME_FORMAT),
        trade_id
    )
}

#[derive(Clone)]
pub struct CandleQueue {
    store: Arc<dyn FarmStore>,
}

impl CandleQueue {
    pub fn new(store: Arc<dyn FarmStore>) -> Self {
        Self { store }
    }

    /// Queue a FETCH_CANDLES command on the trade's running terminal.
    ///
    /// Returns `None` when no terminal is RUNNING for the trade's account; the caller then
    /// falls back to its market-data provider.
    #[instrument(skip(self))]
    pub async fn queue_fetch_candles(
        &self,
        trade_id: Uuid,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<TerminalCommand>> {
        let trade = self
            .store
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| FarmError::not_found("trade", trade_id))?;

        let terminal = match self.store.get_terminal_by_account(trade.account_id).await? {
            Some(t) if t.status == TerminalStatus::Running => t,
            _ => {
                info!(account_id = %trade.account_id, "no running terminal, candle fetch not queued");
                return Ok(None);
            }
        };

        let payload = fetch_candles_payload(trade_id, symbol, timeframe, start, end);
        let command =
            TerminalCommand::new_pending(terminal.id, FETCH_CANDLES, Some(payload), Utc::now());
        self.store.insert_command(&command).await?;

        info!(terminal_id = %terminal.id, command_id = %command.id, "queued FETCH_CANDLES");
        Ok(Some(command))
    }

    pub async fn handle_candles(&self, body: Value) -> Result<u64> {
        let payload = validation::parse_candles(body)?;
        self.process_candles(payload).await
    }

    /// Store the candles on the trade and complete the matching command.
    ///
    /// Returns how many commands were completed.
    #[instrument(skip(self, payload), fields(terminal_id = %payload.terminal_id, trade_id = %payload.trade_id))]
    pub async fn process_candles(&self, payload: CandlesPayload) -> Result<u64> {
        if self.store.get_terminal(payload.terminal_id).await?.is_none() {
            return Err(FarmError::not_found("terminal", payload.terminal_id));
        }

        let now = Utc::now();
        let count = payload.candles.len();
        let chart = ChartData {
            symbol: payload.symbol,
            candles: payload.candles,
            fetched_at: now,
            source: CHART_SOURCE.to_string(),
        };
        if !self.store.save_chart_data(payload.trade_id, &chart).await? {
            return Err(FarmError::not_found("trade", payload.trade_id));
        }

        let completed = self
            .store
            .complete_commands_for_trade(payload.terminal_id, payload.trade_id, now)
            .await?;
        info!(candles = count, completed, "candles stored");
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_payload_format() {
        let trade_id = Uuid::parse_str("6f1c1d2e-0000-4000-8000-000000000001").unwrap();
        let payload = fetch_candles_payload(
            trade_id,
            "EURUSD",
            "1min",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap(),
        );
        assert_eq!(
            payload,
            "EURUSD,1min,2024-01-01 00:00:00,2024-01-01 02:00:00,6f1c1d2e-0000-4000-8000-000000000001"
        );
    }
}
