//! Scheduled broker sync over the bridge: deploy, pull closed deals, undeploy.
//!
//! Every attempt first takes a slot from the monthly quota. Deploy and connect are
//! bounded by the cold or warm timeout, and a timeout ends the attempt with the
//! connection in `error`.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{BrokerBridge, ClosedDeal, Deal};
use crate::config::SyncConfig;
use crate::crypto::CredentialCipher;
use crate::domain::{
    detect_asset_type, ConnectionStatus, SyncConnection, SyncSummary, TradeRecord, TradeStatus,
};
use crate::error::{FarmError, Result};
use crate::retry::RetryPolicy;
use crate::services::metrics::Metrics;
use crate::services::rate_limiter::{quota_message, SyncRateLimiter};
use crate::services::reconciler::refresh_account_balance;
use crate::store::FarmStore;
use crate::validation;

/// Ledger row for a closed bridge deal
pub fn deal_row(connection: &SyncConnection, deal: &ClosedDeal) -> TradeRecord {
    TradeRecord {
        id: Uuid::new_v4(),
        user_id: connection.user_id,
        account_id: connection.account_id,
        external_id: None,
        external_deal_id: Some(deal.id.clone()),
        status: TradeStatus::Closed,
        symbol: deal.symbol.clone(),
        direction: deal.direction,
        entry_price: deal.price,
        entry_time: deal.time,
        exit_price: Some(deal.price),
        exit_time: Some(deal.time),
        size: deal.volume,
        pnl: deal.profit,
        commission: deal.commission,
        swap: deal.swap,
        stop_loss: None,
        take_profit: None,
        contract_size: None,
        asset_type: detect_asset_type(&deal.symbol),
        magic_number: deal.magic,
        notes: None,
        is_orphan: false,
        chart_data: None,
    }
}

#[derive(Clone)]
pub struct ConnectionSync {
    store: Arc<dyn FarmStore>,
    bridge: Option<Arc<dyn BrokerBridge>>,
    cipher: Arc<dyn CredentialCipher>,
    limiter: SyncRateLimiter,
    retry: RetryPolicy,
    config: SyncConfig,
    metrics: Arc<Metrics>,
}

impl ConnectionSync {
    pub fn new(
        store: Arc<dyn FarmStore>,
        bridge: Option<Arc<dyn BrokerBridge>>,
        cipher: Arc<dyn CredentialCipher>,
        retry: RetryPolicy,
        config: SyncConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = SyncRateLimiter::new(store.clone(), config.monthly_limit);
        Self {
            store,
            bridge,
            cipher,
            limiter,
            retry,
            config,
            metrics,
        }
    }

    pub fn limiter(&self) -> &SyncRateLimiter {
        &self.limiter
    }

    #[instrument(skip(self))]
    pub async fn sync(&self, connection_id: Uuid) -> Result<SyncSummary> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| FarmError::not_found("connection", connection_id))?;

        // Without a bridge the sync cannot run, so it must not spend a monthly slot
        let bridge = match self.bridge() {
            Ok(bridge) => bridge.clone(),
            Err(e) => {
                error!("connection sync failed: {}", e);
                self.store
                    .set_connection_status(connection_id, ConnectionStatus::Error, Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        let max = self.limiter.monthly_limit();
        let quota = self.limiter.check_and_increment(connection_id).await?;
        if !quota.can_sync {
            self.metrics.inc_syncs_refused();
            self.store
                .set_connection_status(
                    connection_id,
                    connection.status,
                    Some(&quota_message(quota.current_count, max)),
                )
                .await?;
            return Err(FarmError::QuotaExceeded {
                current: quota.current_count,
                max,
            });
        }
        info!(count = quota.current_count, max, reset = quota.reset_needed, "sync allowed");

        match self.run(&connection, bridge.as_ref()).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("connection sync failed: {}", e);
                self.store
                    .set_connection_status(connection_id, ConnectionStatus::Error, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    fn bridge(&self) -> Result<&Arc<dyn BrokerBridge>> {
        self.bridge
            .as_ref()
            .ok_or_else(|| FarmError::Bridge("broker bridge token not configured".to_string()))
    }

    async fn run(&self, connection: &SyncConnection, bridge: &dyn BrokerBridge) -> Result<SyncSummary> {
        let id = connection.id;
        self.store
            .set_connection_status(id, ConnectionStatus::Syncing, None)
            .await?;

        let bridge_account = match &connection.bridge_account_id {
            Some(existing) if !existing.is_empty() => existing.clone(),
            _ => {
                let password = self.cipher.decrypt(&connection.encrypted_password)?;
                let name = format!("TradingJournal-{}", connection.account_id);
                let created = bridge
                    .create_account(&name, &connection.server, &connection.login, &password)
                    .await?;
                self.store.set_bridge_account(id, &created).await?;
                created
            }
        };

        let state = bridge.get_account(&bridge_account).await?;
        let timeout = if state.is_deployed() {
            self.store
                .set_connection_status(id, ConnectionStatus::Connecting, None)
                .await?;
            self.config.warm_deploy_timeout()
        } else {
            self.store
                .set_connection_status(id, ConnectionStatus::Deploying, None)
                .await?;
            bridge.deploy(&bridge_account).await?;
            self.store
                .set_connection_status(id, ConnectionStatus::Connecting, None)
                .await?;
            self.config.cold_deploy_timeout()
        };
        let region = bridge.wait_for_connection(&bridge_account, timeout).await?;
        self.store
            .set_connection_status(id, ConnectionStatus::Connected, None)
            .await?;
        info!(region = %region, "bridge connected");

        let deals = self
            .fetch_deals(bridge, connection, &bridge_account, &region)
            .await?;
        let summary = self.upsert_deals(connection, &deals).await;

        if let Err(e) = bridge.undeploy(&bridge_account).await {
            warn!("failed to undeploy bridge account: {}", e);
        }

        self.store.mark_connection_synced(id, Utc::now()).await?;
        if let Err(e) = refresh_account_balance(self.store.as_ref(), connection.account_id).await {
            warn!(account_id = %connection.account_id, "balance refresh failed: {}", e);
        }

        info!(imported = summary.imported, skipped = summary.skipped, "connection sync complete");
        Ok(summary)
    }

    async fn fetch_deals(
        &self,
        bridge: &dyn BrokerBridge,
        connection: &SyncConnection,
        bridge_account: &str,
        region: &str,
    ) -> Result<Vec<Deal>> {
        let end = Utc::now();
        let start = connection
            .last_synced_at
            .unwrap_or_else(|| end - ChronoDuration::days(self.config.history_days));
        let page_size = self.config.deal_page_size.max(1);

        let mut deals = Vec::new();
        let mut offset = 0;
        loop {
            let page = bridge
                .get_deals(bridge_account, region, start, end, offset, page_size)
                .await?;
            let full = page.len() == page_size;
            deals.extend(page);
            offset += page_size;

            if !full {
                break;
            }
            if offset >= self.config.max_deals {
                warn!(max = self.config.max_deals, "deal pagination safety limit reached");
                break;
            }
        }

        debug!(count = deals.len(), "deals fetched");
        Ok(deals)
    }

    async fn upsert_deals(&self, connection: &SyncConnection, deals: &[Deal]) -> SyncSummary {
        let mut imported = 0;
        let mut skipped = 0;

        for deal in deals.iter().filter(|d| validation::is_closing_deal(d)) {
            let closed = match validation::validate_deal(deal) {
                Ok(closed) => closed,
                Err(e) => {
                    info!("skipping deal: {}", e);
                    skipped += 1;
                    continue;
                }
            };

            let row = deal_row(connection, &closed);
            let label = format!("upsert deal {}", closed.id);
            match self.retry.run(&label, || self.store.upsert_deal_trade(&row)).await {
                Ok(()) => imported += 1,
                Err(e) => {
                    error!(deal_id = %closed.id, "deal upsert failed: {}", e);
                    skipped += 1;
                }
            }
        }

        SyncSummary { imported, skipped }
    }
}
