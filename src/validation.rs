//! Schema checks for every inbound message.
//!
//! Envelope problems (bad terminal id, wrong JSON shape) reject the whole message with
//! `FarmError::Validation` before any state is touched. Problems inside a single trade or
//! deal only drop that item; the caller reports it as skipped.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::broker::{ClosedDeal, Deal};
use crate::domain::{
    AccountTelemetry, CandlesPayload, EntryType, HeartbeatPayload, OpenPosition,
    PositionsPayload, RawCandles, RawHeartbeat, RawPositions, RawTrade, RawTradeSync,
    TradeSide, TradeSyncPayload, ValidTrade,
};
use crate::error::{FarmError, Result};

const MAX_SYMBOL_LEN: usize = 20;

/// Deal entry kinds the bridge may report
const KNOWN_DEAL_ENTRIES: [&str; 4] = [
    "DEAL_ENTRY_IN",
    "DEAL_ENTRY_OUT",
    "DEAL_ENTRY_INOUT",
    "DEAL_ENTRY_OUT_BY",
];

/// Deal entry kinds that close a position
const CLOSING_DEAL_ENTRIES: [&str; 2] = ["DEAL_ENTRY_OUT", "DEAL_ENTRY_INOUT"];

fn invalid(msg: impl Into<String>) -> FarmError {
    FarmError::Validation(msg.into())
}

pub fn parse_uuid(raw: &str, field_name: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| invalid(format!("{} must be a UUID: {}", field_name, raw)))
}

/// Validate a symbol (1-20 chars after trimming)
pub fn validate_symbol(symbol: &str) -> Result<String> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return Err(invalid("symbol cannot be empty"));
    }
    if trimmed.len() > MAX_SYMBOL_LEN {
        return Err(invalid(format!(
            "symbol longer than {} characters: {}",
            MAX_SYMBOL_LEN, trimmed
        )));
    }
    Ok(trimmed.to_string())
}

/// Convert a wire number into an exact decimal
pub fn to_decimal(value: f64, field_name: &str) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(invalid(format!("{} must be a finite number", field_name)));
    }
    Decimal::from_f64(value)
        .map(|d| d.normalize())
        .ok_or_else(|| invalid(format!("{} out of range: {}", field_name, value)))
}

fn optional_decimal(value: Option<f64>, field_name: &str) -> Result<Option<Decimal>> {
    value.map(|v| to_decimal(v, field_name)).transpose()
}

fn positive_decimal(value: f64, field_name: &str) -> Result<Decimal> {
    let d = to_decimal(value, field_name)?;
    if d <= Decimal::ZERO {
        return Err(invalid(format!("{} must be positive: {}", field_name, value)));
    }
    Ok(d)
}

/// Parse a broker timestamp.
///
/// Accepts RFC 3339 as well as the naive `2024.01.31 14:05:00` and
/// `2024-01-31 14:05:00` forms terminals emit, which are taken as UTC.
pub fn parse_timestamp(raw: &str, field_name: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y.%m.%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(invalid(format!("{} is not a timestamp: {}", field_name, raw)))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| invalid(format!("malformed {} payload: {}", what, e)))
}

/// Validate a heartbeat message
pub fn parse_heartbeat(value: Value) -> Result<HeartbeatPayload> {
    let raw: RawHeartbeat = from_json(value, "heartbeat")?;
    let terminal_id = parse_uuid(&raw.terminal_id, "terminalId")?;

    let telemetry = match raw.account_info {
        Some(info) => Some(AccountTelemetry {
            balance: to_decimal(info.balance, "accountInfo.balance")?,
            equity: to_decimal(info.equity, "accountInfo.equity")?,
            margin: optional_decimal(info.margin, "accountInfo.margin")?,
            free_margin: optional_decimal(info.free_margin, "accountInfo.freeMargin")?,
        }),
        None => None,
    };

    Ok(HeartbeatPayload {
        terminal_id,
        telemetry,
    })
}

/// Validate a single trade event.
///
/// Required: ticket, symbol, type, open price and open time.
pub fn validate_trade(raw: RawTrade) -> Result<ValidTrade> {
    let ticket = raw
        .ticket
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| invalid("ticket is required"))?;
    let symbol = validate_symbol(raw.symbol.as_deref().unwrap_or(""))?;
    let side = raw
        .side
        .as_deref()
        .ok_or_else(|| invalid("type is required"))
        .and_then(|s| TradeSide::try_from(s).map_err(invalid))?;

    let open_price = raw
        .open_price
        .ok_or_else(|| invalid("openPrice is required"))
        .and_then(|p| to_decimal(p, "openPrice"))?;
    let open_time = raw
        .open_time
        .as_deref()
        .ok_or_else(|| invalid("openTime is required"))
        .and_then(|t| parse_timestamp(t, "openTime"))?;
    let close_time = raw
        .close_time
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(|t| parse_timestamp(t, "closeTime"))
        .transpose()?;

    let volume = match raw.volume {
        Some(v) => positive_decimal(v, "volume")?,
        None => Decimal::ZERO,
    };

    let position_id = match raw.position_id {
        Some(id) if id <= 0 => {
            return Err(invalid(format!("positionId must be positive: {}", id)));
        }
        other => other,
    };

    let entry_type = match raw.entry_type {
        Some(code) => Some(
            EntryType::from_code(code)
                .ok_or_else(|| invalid(format!("entryType out of range: {}", code)))?,
        ),
        None => None,
    };

    let contract_size = match raw.contract_size {
        Some(v) => Some(positive_decimal(v, "contractSize")?),
        None => None,
    };

    Ok(ValidTrade {
        ticket,
        symbol,
        side,
        volume,
        open_price,
        close_price: optional_decimal(raw.close_price, "closePrice")?,
        open_time,
        close_time,
        commission: optional_decimal(raw.commission, "commission")?.unwrap_or_default(),
        swap: optional_decimal(raw.swap, "swap")?.unwrap_or_default(),
        profit: optional_decimal(raw.profit, "profit")?.unwrap_or_default(),
        position_id,
        magic: raw.magic,
        entry_type,
        stop_loss: optional_decimal(raw.stop_loss, "stopLoss")?,
        take_profit: optional_decimal(raw.take_profit, "takeProfit")?,
        contract_size,
    })
}

/// Validate a trade sync message, dropping individual bad trades.
pub fn parse_trade_sync(value: Value) -> Result<TradeSyncPayload> {
    let raw: RawTradeSync = from_json(value, "trade sync")?;
    let terminal_id = parse_uuid(&raw.terminal_id, "terminalId")?;

    let mut trades = Vec::with_capacity(raw.trades.len());
    let mut rejected = 0;

    for (index, item) in raw.trades.into_iter().enumerate() {
        let ticket_hint = item
            .get("ticket")
            .map(|t| t.to_string())
            .unwrap_or_else(|| "missing".to_string());

        let outcome = serde_json::from_value::<RawTrade>(item)
            .map_err(|e| invalid(format!("malformed trade: {}", e)))
            .and_then(validate_trade);

        match outcome {
            Ok(trade) => trades.push(trade),
            Err(e) => {
                info!(
                    %terminal_id,
                    index,
                    ticket = %ticket_hint,
                    "rejecting trade: {}",
                    e
                );
                rejected += 1;
            }
        }
    }

    Ok(TradeSyncPayload {
        terminal_id,
        trades,
        rejected,
    })
}

/// Validate a position snapshot. Any bad position rejects the message.
pub fn parse_positions(value: Value) -> Result<PositionsPayload> {
    let raw: RawPositions = from_json(value, "positions")?;
    let terminal_id = parse_uuid(&raw.terminal_id, "terminalId")?;

    let positions = raw
        .positions
        .into_iter()
        .map(|p| {
            Ok(OpenPosition {
                symbol: validate_symbol(&p.symbol)?,
                side: TradeSide::try_from(p.side.as_str()).map_err(invalid)?,
                volume: positive_decimal(p.volume, "volume")?,
                open_price: to_decimal(p.open_price, "openPrice")?,
                current_price: to_decimal(p.current_price, "currentPrice")?,
                profit: to_decimal(p.profit, "profit")?,
                open_time: parse_timestamp(&p.open_time, "openTime")?,
                ticket: p.ticket,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PositionsPayload {
        terminal_id,
        positions,
    })
}

/// Validate a candle upload
pub fn parse_candles(value: Value) -> Result<CandlesPayload> {
    let raw: RawCandles = from_json(value, "candles")?;
    let terminal_id = parse_uuid(&raw.terminal_id, "terminalId")?;
    let trade_id = parse_uuid(&raw.trade_id, "tradeId")?;
    let symbol = validate_symbol(&raw.symbol)?;

    for candle in &raw.candles {
        if candle.time <= 0 {
            return Err(invalid(format!("candle time must be positive: {}", candle.time)));
        }
        let prices = [candle.open, candle.high, candle.low, candle.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(invalid(format!("candle at {} has a non-finite price", candle.time)));
        }
    }

    Ok(CandlesPayload {
        terminal_id,
        trade_id,
        symbol,
        candles: raw.candles,
    })
}

pub fn is_closing_deal(deal: &Deal) -> bool {
    deal.entry_type
        .as_deref()
        .map(|e| CLOSING_DEAL_ENTRIES.contains(&e))
        .unwrap_or(false)
}

/// Validate a bridge deal into a closed ledger row candidate
pub fn validate_deal(deal: &Deal) -> Result<ClosedDeal> {
    let (id, symbol, price, time) = match (&deal.id, &deal.symbol, deal.price, &deal.time) {
        (Some(id), Some(symbol), Some(price), Some(time))
            if !id.is_empty() && !symbol.is_empty() =>
        {
            (id, symbol, price, time)
        }
        _ => {
            return Err(invalid(format!(
                "deal {} missing required fields (symbol: {}, price: {}, time: {})",
                deal.id.as_deref().unwrap_or("missing"),
                deal.symbol.as_deref().unwrap_or("missing"),
                deal.price.is_some(),
                deal.time.is_some()
            )));
        }
    };

    let deal_type = match &deal.deal_type {
        Some(Value::String(t)) if !t.is_empty() => t,
        other => {
            return Err(invalid(format!("deal {} has invalid type: {:?}", id, other)));
        }
    };

    let entry = deal.entry_type.as_deref().unwrap_or("");
    if !KNOWN_DEAL_ENTRIES.contains(&entry) {
        return Err(invalid(format!("deal {} has invalid entryType: {}", id, entry)));
    }

    let side = if deal_type.to_lowercase().contains("buy") {
        TradeSide::Buy
    } else {
        TradeSide::Sell
    };

    Ok(ClosedDeal {
        id: id.clone(),
        symbol: validate_symbol(symbol)?,
        direction: side.entry_direction(),
        price: to_decimal(price, "price")?,
        volume: optional_decimal(deal.volume, "volume")?.unwrap_or_default(),
        profit: optional_decimal(deal.profit, "profit")?.unwrap_or_default(),
        commission: optional_decimal(deal.commission, "commission")?.unwrap_or_default(),
        swap: optional_decimal(deal.swap, "swap")?.unwrap_or_default(),
        time: parse_timestamp(time, "time")?,
        magic: deal.magic,
    })
}
