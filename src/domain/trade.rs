use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Deal side as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Direction of the position this deal opens
    pub fn entry_direction(&self) -> Direction {
        match self {
            TradeSide::Buy => Direction::Long,
            TradeSide::Sell => Direction::Short,
        }
    }

    /// Direction of the position this deal closes (a SELL exit closes a LONG)
    pub fn exit_direction(&self) -> Direction {
        match self {
            TradeSide::Buy => Direction::Short,
            TradeSide::Sell => Direction::Long,
        }
    }
}

impl TryFrom<&str> for TradeSide {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl TryFrom<&str> for Direction {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl TryFrom<&str> for TradeStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("unknown trade status: {}", other)),
        }
    }
}

/// Broker deal entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    In,
    Out,
    /// Reversal: closes one position and opens the opposite one
    InOut,
}

impl EntryType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(EntryType::In),
            1 => Some(EntryType::Out),
            2 => Some(EntryType::InOut),
            _ => None,
        }
    }

    pub fn closes_position(&self) -> bool {
        matches!(self, EntryType::Out | EntryType::InOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetType {
    Forex,
    Crypto,
    Commodity,
    Index,
    Stock,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Forex => "FOREX",
            AssetType::Crypto => "CRYPTO",
            AssetType::Commodity => "COMMODITY",
            AssetType::Index => "INDEX",
            AssetType::Stock => "STOCK",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AssetType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "FOREX" => Ok(AssetType::Forex),
            "CRYPTO" => Ok(AssetType::Crypto),
            "COMMODITY" => Ok(AssetType::Commodity),
            "INDEX" => Ok(AssetType::Index),
            "STOCK" => Ok(AssetType::Stock),
            other => Err(format!("unknown asset type: {}", other)),
        }
    }
}

const CURRENCY_CODES: [&str; 8] = ["EUR", "USD", "GBP", "JPY", "AUD", "NZD", "CAD", "CHF"];
const CRYPTO_KEYWORDS: [&str; 4] = ["BTC", "ETH", "USDT", "CRYPTO"];
const COMMODITY_KEYWORDS: [&str; 5] = ["XAU", "GOLD", "OIL", "SILVER", "XAG"];
const INDEX_KEYWORDS: [&str; 11] = [
    "US30", "DJ30", "NAS100", "NDX", "SPX", "SP500", "GER30", "DE30", "UK100", "JP225", "FTSE",
];

/// Classify a broker symbol into an asset class.
///
/// Broker suffixes (`EURUSD.m`, `XAUUSD#`) are tolerated because matching is by substring.
pub fn detect_asset_type(symbol: &str) -> AssetType {
    let upper = symbol.to_uppercase();

    let currency_hits = CURRENCY_CODES
        .iter()
        .filter(|code| upper.contains(*code))
        .count();
    if currency_hits >= 2 && upper.len() <= 7 {
        return AssetType::Forex;
    }

    if CRYPTO_KEYWORDS.iter().any(|k| upper.contains(k)) {
        return AssetType::Crypto;
    }
    if COMMODITY_KEYWORDS.iter().any(|k| upper.contains(k)) {
        return AssetType::Commodity;
    }
    if INDEX_KEYWORDS.iter().any(|k| upper.contains(k)) {
        return AssetType::Index;
    }

    let looks_like_ticker = (1..=5).contains(&symbol.len())
        && symbol.chars().all(|c| c.is_ascii_uppercase());
    if looks_like_ticker {
        AssetType::Stock
    } else {
        AssetType::Forex
    }
}

/// Reconciled ledger entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    /// Broker position id
    pub external_id: Option<String>,
    /// Broker deal or ticket id
    pub external_deal_id: Option<String>,
    pub status: TradeStatus,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub size: Decimal,
    pub pnl: Decimal,
    pub commission: Decimal,
    pub swap: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub contract_size: Option<Decimal>,
    pub asset_type: AssetType,
    pub magic_number: Option<i64>,
    pub notes: Option<String>,
    /// Closing deal recorded without a matching entry
    pub is_orphan: bool,
    pub chart_data: Option<ChartData>,
}

impl TradeRecord {
    /// Whether an exit for this row has nothing left to heal
    pub fn is_fully_closed(&self) -> bool {
        self.status == TradeStatus::Closed && self.contract_size.is_some()
    }
}

/// Close applied to an existing ledger row.
///
/// Commission and swap are already accumulated totals, not deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeClose {
    pub trade_id: Uuid,
    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub pnl: Decimal,
    pub commission: Decimal,
    pub swap: Decimal,
    pub contract_size: Option<Decimal>,
}

/// A single OHLC bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Unix seconds
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

/// Candle series cached on a trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_forex() {
        assert_eq!(detect_asset_type("EURUSD"), AssetType::Forex);
        assert_eq!(detect_asset_type("gbpjpy.m"), AssetType::Forex);
    }

    #[test]
    fn test_detect_keywords() {
        assert_eq!(detect_asset_type("BTCUSD"), AssetType::Crypto);
        assert_eq!(detect_asset_type("XAUUSD"), AssetType::Commodity);
        assert_eq!(detect_asset_type("NAS100"), AssetType::Index);
        assert_eq!(detect_asset_type("UK100.cash"), AssetType::Index);
    }

    #[test]
    fn test_detect_fallbacks() {
        assert_eq!(detect_asset_type("AAPL"), AssetType::Stock);
        assert_eq!(detect_asset_type("TSLA"), AssetType::Stock);
        // Unrecognised symbols default to forex
        assert_eq!(detect_asset_type("Custom.Sym"), AssetType::Forex);
    }

    #[test]
    fn test_exit_direction_is_inverted() {
        assert_eq!(TradeSide::Sell.exit_direction(), Direction::Long);
        assert_eq!(TradeSide::Buy.entry_direction(), Direction::Long);
    }

    #[test]
    fn test_entry_type_codes() {
        assert_eq!(EntryType::from_code(0), Some(EntryType::In));
        assert!(EntryType::from_code(2).map(|e| e.closes_position()).unwrap_or(false));
        assert_eq!(EntryType::from_code(3), None);
    }
}
