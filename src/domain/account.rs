use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Broker trading account a terminal or connection syncs into
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server: String,
    pub login: String,
    /// Ciphertext produced by the credential cipher
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub equity: Option<Decimal>,
    pub margin: Option<Decimal>,
    pub free_margin: Option<Decimal>,
    /// Current total drawdown in percent of the initial balance
    pub total_dd_current: Decimal,
    pub terminal_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Live account figures pushed by a heartbeat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountTelemetry {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Option<Decimal>,
    pub free_margin: Option<Decimal>,
}

/// Balance refresh derived from the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub current_balance: Decimal,
    pub total_dd_current: Decimal,
}

impl BalanceSnapshot {
    pub fn compute(initial_balance: Decimal, total_pnl: Decimal) -> Self {
        let current_balance = initial_balance + total_pnl;
        let total_dd_current = if initial_balance.is_zero() {
            Decimal::ZERO
        } else {
            let pnl_percent = total_pnl / initial_balance * Decimal::ONE_HUNDRED;
            if pnl_percent.is_sign_negative() {
                pnl_percent.abs()
            } else {
                Decimal::ZERO
            }
        };
        Self {
            current_balance,
            total_dd_current,
        }
    }
}

/// Lifecycle of a scheduled broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Undeployed,
    Syncing,
    Deploying,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Undeployed => "undeployed",
            ConnectionStatus::Syncing => "syncing",
            ConnectionStatus::Deploying => "deploying",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ConnectionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "undeployed" => Ok(ConnectionStatus::Undeployed),
            "syncing" => Ok(ConnectionStatus::Syncing),
            "deploying" => Ok(ConnectionStatus::Deploying),
            "connecting" => Ok(ConnectionStatus::Connecting),
            "connected" => Ok(ConnectionStatus::Connected),
            "error" => Ok(ConnectionStatus::Error),
            other => Err(format!("unknown connection status: {}", other)),
        }
    }
}

/// Scheduled or manual broker link, independent of the terminal fleet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Ledger account the synced deals land in
    pub account_id: Uuid,
    pub server: String,
    pub login: String,
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    /// Handle of the account on the broker bridge, once provisioned
    pub bridge_account_id: Option<String>,
    pub status: ConnectionStatus,
    pub error_message: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub syncs_this_month: i32,
    pub syncs_reset_at: DateTime<Utc>,
}

/// Outcome of the atomic monthly quota gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCheck {
    pub can_sync: bool,
    pub current_count: i32,
    pub reset_needed: bool,
}

/// First instant of the month after `now`, in UTC.
pub fn next_reset_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_snapshot_loss() {
        let snap = BalanceSnapshot::compute(dec!(10000), dec!(-500));
        assert_eq!(snap.current_balance, dec!(9500));
        assert_eq!(snap.total_dd_current, dec!(5));
    }

    #[test]
    fn test_balance_snapshot_profit_has_no_drawdown() {
        let snap = BalanceSnapshot::compute(dec!(10000), dec!(250));
        assert_eq!(snap.current_balance, dec!(10250));
        assert_eq!(snap.total_dd_current, Decimal::ZERO);
    }

    #[test]
    fn test_next_reset_rolls_year() {
        let now = Utc.with_ymd_and_hms(2024, 12, 15, 10, 0, 0).unwrap();
        assert_eq!(
            next_reset_after(now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(
            next_reset_after(now),
            Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
        );
    }
}
