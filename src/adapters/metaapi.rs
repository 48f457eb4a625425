//! MetaApi REST adapter for the broker bridge.
//!
//! Provisioning calls (create/get/deploy/undeploy) go to one global host; account data
//! (connection status, history deals) must be read from the regional client host the
//! account is deployed in.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::broker::{BridgeAccount, BrokerBridge, Deal};
use crate::error::{FarmError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on the broker-login phase after the account is deployed
const BROKER_CONNECT_WINDOW: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE: usize = 1000;

#[derive(Debug, Deserialize)]
struct CreatedAccount {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionStatus {
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    authenticated: bool,
}

#[derive(Clone)]
pub struct MetaApiClient {
    http: Client,
    provisioning_url: String,
    token: String,
}

impl std::fmt::Debug for MetaApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaApiClient")
            .field("provisioning_url", &self.provisioning_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl MetaApiClient {
    pub fn new(provisioning_url: &str, token: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent("termfarm/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FarmError::Internal(format!("failed to build bridge HTTP client: {}", e)))?;

        Ok(Self {
            http,
            provisioning_url: provisioning_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn client_url(region: &str) -> String {
        format!("https://mt-client-api-v1.{}.agiliumtrade.ai", region)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("auth-token", &self.token)
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<String> {
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FarmError::Transient(format!(
                "bridge {} failed: status={} body={}",
                what, status, text
            )));
        }
        if !status.is_success() {
            return Err(FarmError::Bridge(format!(
                "bridge {} failed: status={} body={}",
                what, status, text
            )));
        }
        Ok(text)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        let text = self.send(req, what).await?;
        serde_json::from_str(&text)
            .map_err(|e| FarmError::Bridge(format!("invalid bridge JSON for {}: {}", what, e)))
    }

    /// Poll until the account reports DEPLOYED, returning its region
    async fn wait_deployed(&self, account_id: &str) -> Result<String> {
        loop {
            let account = self.get_account(account_id).await?;
            if account.is_deployed() {
                let region = account.region_or_default();
                info!(account_id, region = %region, "bridge account deployed");
                return Ok(region);
            }
            debug!(account_id, state = %account.state, "waiting for deployment");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll the regional connection status until the broker login succeeds.
    ///
    /// A failing status endpoint is treated as connected; the deal fetch will surface
    /// a real problem.
    async fn wait_broker_login(&self, account_id: &str, region: &str) {
        let url = format!(
            "{}/users/current/accounts/{}/connection-status",
            Self::client_url(region),
            account_id
        );
        loop {
            let req = self.request(Method::GET, &url);
            match self.send_json::<ConnectionStatus>(req, "connection-status").await {
                Ok(status) if status.connected && status.authenticated => {
                    info!(account_id, "bridge connected to broker");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(account_id, "connection status unavailable, assuming connected: {}", e);
                    return;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl BrokerBridge for MetaApiClient {
    async fn create_account(
        &self,
        name: &str,
        server: &str,
        login: &str,
        password: &str,
    ) -> Result<String> {
        let url = format!("{}/users/current/accounts", self.provisioning_url);
        let body = json!({
            "name": name,
            "type": "cloud",
            "platform": "mt5",
            "server": server,
            "login": login,
            "password": password,
            "magic": 0,
        });
        let req = self.request(Method::POST, &url).json(&body);
        let created: CreatedAccount = self.send_json(req, "create account").await?;
        info!(bridge_account = %created.id, "bridge account provisioned");
        Ok(created.id)
    }

    async fn get_account(&self, account_id: &str) -> Result<BridgeAccount> {
        let url = format!("{}/users/current/accounts/{}", self.provisioning_url, account_id);
        let req = self.request(Method::GET, &url);
        self.send_json(req, "get account").await
    }

    async fn deploy(&self, account_id: &str) -> Result<()> {
        let url = format!(
            "{}/users/current/accounts/{}/deploy",
            self.provisioning_url, account_id
        );
        self.send(self.request(Method::POST, &url), "deploy").await?;
        Ok(())
    }

    async fn wait_for_connection(&self, account_id: &str, timeout: Duration) -> Result<String> {
        let started = Instant::now();

        let region = match tokio::time::timeout(timeout, self.wait_deployed(account_id)).await {
            Ok(region) => region?,
            Err(_) => {
                return Err(FarmError::DeployTimeout(format!(
                    "account {} not deployed within {}s",
                    account_id,
                    timeout.as_secs()
                )));
            }
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        let window = remaining.min(BROKER_CONNECT_WINDOW);
        if tokio::time::timeout(window, self.wait_broker_login(account_id, &region))
            .await
            .is_err()
        {
            warn!(account_id, "broker login not confirmed, proceeding anyway");
        }

        Ok(region)
    }

    async fn get_deals(
        &self,
        account_id: &str,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Deal>> {
        let (from, to) = (iso(start), iso(end));
        let mut url = Url::parse(&Self::client_url(region))
            .map_err(|e| FarmError::Internal(format!("invalid bridge region {}: {}", region, e)))?;
        url.path_segments_mut()
            .map_err(|_| FarmError::Internal("bridge client URL cannot be a base".to_string()))?
            .extend([
                "users",
                "current",
                "accounts",
                account_id,
                "history-deals",
                "time",
                from.as_str(),
                to.as_str(),
            ]);
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.min(MAX_PAGE).to_string());

        let req = self.request(Method::GET, url.as_str());
        // The endpoint answers with a bare array; anything else means no deals
        let body: Value = self.send_json(req, "history deals").await?;
        match body {
            Value::Array(_) => Ok(serde_json::from_value(body)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn undeploy(&self, account_id: &str) -> Result<()> {
        let url = format!(
            "{}/users/current/accounts/{}/undeploy",
            self.provisioning_url, account_id
        );
        self.send(self.request(Method::POST, &url), "undeploy").await?;
        Ok(())
    }
}
