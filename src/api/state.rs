use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::SecurityConfig;
use crate::services::TerminalFarm;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub farm: Arc<TerminalFarm>,

    /// Shared secrets for the agent and orchestrator channels
    pub security: Arc<SecurityConfig>,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(farm: TerminalFarm, security: SecurityConfig) -> Self {
        Self {
            farm: Arc::new(farm),
            security: Arc::new(security),
            start_time: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
