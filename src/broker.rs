//! Broker bridge capability used by the scheduled connection sync.
//!
//! The bridge hosts a cloud copy of the broker account. A sync provisions it once,
//! deploys it, waits for the broker connection, pages through history deals, and
//! undeploys it again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::domain::Direction;
use crate::error::Result;

/// Region used when the bridge does not report one
pub const DEFAULT_REGION: &str = "london";

/// Account as seen by the bridge's provisioning API
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeAccount {
    #[serde(alias = "_id")]
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl BridgeAccount {
    pub fn is_deployed(&self) -> bool {
        self.state == "DEPLOYED"
    }

    pub fn region_or_default(&self) -> String {
        self.region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }
}

/// History deal exactly as the bridge returns it
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    #[serde(default)]
    pub id: Option<String>,
    /// `DEAL_TYPE_BUY`, `DEAL_TYPE_SELL`, `DEAL_TYPE_BALANCE`, ...
    #[serde(default, rename = "type")]
    pub deal_type: Option<Value>,
    #[serde(default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub commission: Option<f64>,
    #[serde(default)]
    pub swap: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub magic: Option<i64>,
    #[serde(default)]
    pub position_id: Option<String>,
}

/// Closing deal ready to be written as a CLOSED ledger row
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedDeal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub price: Decimal,
    pub volume: Decimal,
    pub profit: Decimal,
    pub commission: Decimal,
    pub swap: Decimal,
    pub time: DateTime<Utc>,
    pub magic: Option<i64>,
}

/// Remote broker bridge operations
#[async_trait]
pub trait BrokerBridge: Send + Sync {
    /// Provision a bridge account, returning its handle
    async fn create_account(
        &self,
        name: &str,
        server: &str,
        login: &str,
        password: &str,
    ) -> Result<String>;

    async fn get_account(&self, account_id: &str) -> Result<BridgeAccount>;

    async fn deploy(&self, account_id: &str) -> Result<()>;

    /// Wait until the account is deployed and connected to the broker.
    ///
    /// Returns the region that serves the account's data. Exceeding `timeout`
    /// yields `FarmError::DeployTimeout`.
    async fn wait_for_connection(&self, account_id: &str, timeout: Duration) -> Result<String>;

    /// One page of history deals in `[start, end)`
    async fn get_deals(
        &self,
        account_id: &str,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Deal>>;

    async fn undeploy(&self, account_id: &str) -> Result<()>;
}
