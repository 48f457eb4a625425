//! Wire shapes exchanged with the remote terminal agents.
//!
//! `Raw*` types mirror the JSON the agents send, with every field optional so that a
//! single bad trade can be rejected without failing its batch. The validated forms carry
//! exact decimals and parsed timestamps.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{AccountTelemetry, Candle, EntryType, OpenPosition, TradeSide};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHeartbeat {
    pub terminal_id: String,
    #[serde(default)]
    pub account_info: Option<RawAccountInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAccountInfo {
    pub balance: f64,
    pub equity: f64,
    #[serde(default)]
    pub margin: Option<f64>,
    #[serde(default)]
    pub free_margin: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    pub terminal_id: Uuid,
    pub telemetry: Option<AccountTelemetry>,
}

/// Trade sync envelope. Trades stay untyped until each is checked on its own.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTradeSync {
    pub terminal_id: String,
    pub trades: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTrade {
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, rename = "type")]
    pub side: Option<String>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub open_price: Option<f64>,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub open_time: Option<String>,
    #[serde(default)]
    pub close_time: Option<String>,
    #[serde(default)]
    pub commission: Option<f64>,
    #[serde(default)]
    pub swap: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub position_id: Option<i64>,
    #[serde(default)]
    pub magic: Option<i64>,
    #[serde(default)]
    pub entry_type: Option<i64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub contract_size: Option<f64>,
}

/// A trade event that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidTrade {
    pub ticket: String,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub close_price: Option<Decimal>,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub commission: Decimal,
    pub swap: Decimal,
    pub profit: Decimal,
    pub position_id: Option<i64>,
    pub magic: Option<i64>,
    pub entry_type: Option<EntryType>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub contract_size: Option<Decimal>,
}

impl ValidTrade {
    /// Position-keyed events need both a position id and an entry type
    pub fn position_key(&self) -> Option<(String, EntryType)> {
        match (self.position_id, self.entry_type) {
            (Some(id), Some(entry)) => Some((id.to_string(), entry)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeSyncPayload {
    pub terminal_id: Uuid,
    pub trades: Vec<ValidTrade>,
    /// Trades dropped during validation, reported as skipped
    pub rejected: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPositions {
    pub terminal_id: String,
    pub positions: Vec<RawPosition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub ticket: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: String,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub profit: f64,
    pub open_time: String,
}

#[derive(Debug, Clone)]
pub struct PositionsPayload {
    pub terminal_id: Uuid,
    pub positions: Vec<OpenPosition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandles {
    pub terminal_id: String,
    pub trade_id: String,
    pub symbol: String,
    pub candles: Vec<Candle>,
}

#[derive(Debug, Clone)]
pub struct CandlesPayload {
    pub terminal_id: Uuid,
    pub trade_id: Uuid,
    pub symbol: String,
    pub candles: Vec<Candle>,
}

/// Reply to a heartbeat. Absent fields are omitted from the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HeartbeatResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn with_command(command: String, payload: Option<String>) -> Self {
        Self {
            success: true,
            command: Some(command),
            payload,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub imported: usize,
    pub skipped: usize,
}
