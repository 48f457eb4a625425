//! The assembled terminal farm.
//!
//! One value per process, built from configuration plus injected collaborators and
//! shared by the HTTP layer and the CLI.

use chrono::Utc;
use std::sync::Arc;

use crate::broker::BrokerBridge;
use crate::config::AppConfig;
use crate::crypto::CredentialCipher;
use crate::error::Result;
use crate::services::candles::CandleQueue;
use crate::services::connection_sync::ConnectionSync;
use crate::services::dispatcher::CommandDispatcher;
use crate::services::health::{fleet_health, FleetHealth, HealthThresholds};
use crate::services::lifecycle::TerminalLifecycle;
use crate::services::metrics::Metrics;
use crate::services::reconciler::TradeReconciler;
use crate::store::FarmStore;

#[derive(Clone)]
pub struct TerminalFarm {
    pub lifecycle: TerminalLifecycle,
    pub dispatcher: CommandDispatcher,
    pub reconciler: TradeReconciler,
    pub candles: CandleQueue,
    pub connections: ConnectionSync,
    pub metrics: Arc<Metrics>,
    store: Arc<dyn FarmStore>,
    thresholds: HealthThresholds,
}

impl TerminalFarm {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn FarmStore>,
        cipher: Arc<dyn CredentialCipher>,
        bridge: Option<Arc<dyn BrokerBridge>>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let thresholds = HealthThresholds::from(&config.health);
        let retry = config.retry.policy();

        Self {
            lifecycle: TerminalLifecycle::new(store.clone(), cipher.clone(), thresholds),
            dispatcher: CommandDispatcher::new(store.clone(), metrics.clone()),
            reconciler: TradeReconciler::new(
                store.clone(),
                retry.clone(),
                config.reconcile.insert_chunk_size,
                metrics.clone(),
            ),
            candles: CandleQueue::new(store.clone()),
            connections: ConnectionSync::new(
                store.clone(),
                bridge,
                cipher,
                retry,
                config.sync.clone(),
                metrics.clone(),
            ),
            metrics,
            store,
            thresholds,
        }
    }

    pub fn store(&self) -> &Arc<dyn FarmStore> {
        &self.store
    }

    /// Health summary over every live terminal
    pub async fn fleet_health(&self) -> Result<FleetHealth> {
        let terminals = self.store.list_live_terminals().await?;
        Ok(fleet_health(
            &terminals,
            Utc::now(),
            self.thresholds,
            self.metrics.snapshot(),
        ))
    }
}
