//! Terminal health derived from heartbeat and sync timestamps.
//!
//! Pure computations only; nothing here touches storage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::HealthConfig;
use crate::domain::{TerminalInstance, TerminalStatus};
use crate::services::metrics::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub heartbeat_max_age_ms: i64,
    pub sync_max_age_ms: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            heartbeat_max_age_ms: 120_000,
            sync_max_age_ms: 3_600_000,
        }
    }
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            heartbeat_max_age_ms: config.heartbeat_max_age_secs * 1000,
            sync_max_age_ms: config.sync_max_age_secs * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalHealth {
    pub heartbeat_age_ms: Option<i64>,
    pub sync_age_ms: Option<i64>,
    pub is_healthy: bool,
}

/// Healthy means RUNNING, a heartbeat younger than the threshold, and either a recent
/// sync or none at all. A terminal that never sent a heartbeat is unhealthy.
pub fn compute_health(
    status: TerminalStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: HealthThresholds,
) -> TerminalHealth {
    let heartbeat_age_ms = last_heartbeat.map(|t| (now - t).num_milliseconds());
    let sync_age_ms = last_sync_at.map(|t| (now - t).num_milliseconds());

    let heartbeat_fresh = heartbeat_age_ms
        .map(|age| age < thresholds.heartbeat_max_age_ms)
        .unwrap_or(false);
    let sync_fresh = sync_age_ms
        .map(|age| age < thresholds.sync_max_age_ms)
        .unwrap_or(true);

    TerminalHealth {
        heartbeat_age_ms,
        sync_age_ms,
        is_healthy: status == TerminalStatus::Running && heartbeat_fresh && sync_fresh,
    }
}

pub fn terminal_health(
    terminal: &TerminalInstance,
    now: DateTime<Utc>,
    thresholds: HealthThresholds,
) -> TerminalHealth {
    compute_health(
        terminal.status,
        terminal.last_heartbeat,
        terminal.last_sync_at,
        now,
        thresholds,
    )
}

/// Overall fleet condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub by_status: BTreeMap<String, usize>,
    pub metrics: MetricsSnapshot,
}

/// Summarise the live fleet
pub fn fleet_health(
    terminals: &[TerminalInstance],
    now: DateTime<Utc>,
    thresholds: HealthThresholds,
    metrics: MetricsSnapshot,
) -> FleetHealth {
    let mut by_status = BTreeMap::new();
    let mut healthy = 0;

    for terminal in terminals {
        *by_status
            .entry(terminal.status.as_str().to_string())
            .or_insert(0) += 1;
        if terminal_health(terminal, now, thresholds).is_healthy {
            healthy += 1;
        }
    }

    let total = terminals.len();
    let unhealthy = total - healthy;
    let status = if unhealthy == 0 {
        HealthStatus::Healthy
    } else if healthy > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    };

    FleetHealth {
        status,
        timestamp: now,
        total,
        healthy,
        unhealthy,
        by_status,
        metrics,
    }
}
