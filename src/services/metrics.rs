use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;
use uuid::Uuid;

/// Per-call record emitted after a trade sync
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    pub terminal_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub trades_processed: usize,
    pub trades_imported: usize,
    pub trades_skipped: usize,
    pub errors: usize,
    pub duration_ms: u64,
    /// Rows queued for insertion, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// Process-wide counters
#[derive(Debug, Default)]
pub struct Metrics {
    pub heartbeats: AtomicU64,
    pub commands_dispatched: AtomicU64,
    /// Heartbeats that found a command but lost the dispatch race
    pub dispatch_races_lost: AtomicU64,
    pub trade_syncs: AtomicU64,
    pub trades_imported: AtomicU64,
    pub trades_skipped: AtomicU64,
    pub syncs_refused: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub heartbeats: u64,
    pub commands_dispatched: u64,
    pub dispatch_races_lost: u64,
    pub trade_syncs: u64,
    pub trades_imported: u64,
    pub trades_skipped: u64,
    pub syncs_refused: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_heartbeats(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatch_races_lost(&self) {
        self.dispatch_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_syncs_refused(&self) {
        self.syncs_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a sync record into the counters and log it
    pub fn record_sync(&self, record: &SyncMetrics) {
        self.trade_syncs.fetch_add(1, Ordering::Relaxed);
        self.trades_imported
            .fetch_add(record.trades_imported as u64, Ordering::Relaxed);
        self.trades_skipped
            .fetch_add(record.trades_skipped as u64, Ordering::Relaxed);

        info!(
            terminal_id = %record.terminal_id,
            processed = record.trades_processed,
            imported = record.trades_imported,
            skipped = record.trades_skipped,
            errors = record.errors,
            duration_ms = record.duration_ms,
            batch_size = ?record.batch_size,
            "trade sync complete"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            dispatch_races_lost: self.dispatch_races_lost.load(Ordering::Relaxed),
            trade_syncs: self.trade_syncs.load(Ordering::Relaxed),
            trades_imported: self.trades_imported.load(Ordering::Relaxed),
            trades_skipped: self.trades_skipped.load(Ordering::Relaxed),
            syncs_refused: self.syncs_refused.load(Ordering::Relaxed),
        }
    }

    /// Export counters in Prometheus text format
    pub fn prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP termfarm_heartbeats_total Heartbeats accepted
# TYPE termfarm_heartbeats_total counter
termfarm_heartbeats_total {}

# HELP termfarm_commands_dispatched_total Commands handed to terminals
# TYPE termfarm_commands_dispatched_total counter
termfarm_commands_dispatched_total {}

# HELP termfarm_dispatch_races_lost_total Conditional dispatches that lost to a concurrent heartbeat
# TYPE termfarm_dispatch_races_lost_total counter
termfarm_dispatch_races_lost_total {}

# HELP termfarm_trade_syncs_total Trade sync calls processed
# TYPE termfarm_trade_syncs_total counter
termfarm_trade_syncs_total {}

# HELP termfarm_trades_imported_total Ledger rows inserted or closed
# TYPE termfarm_trades_imported_total counter
termfarm_trades_imported_total {}

# HELP termfarm_trades_skipped_total Trades skipped as duplicates, invalid or failed
# TYPE termfarm_trades_skipped_total counter
termfarm_trades_skipped_total {}

# HELP termfarm_syncs_refused_total Broker syncs refused by the monthly quota
# TYPE termfarm_syncs_refused_total counter
termfarm_syncs_refused_total {}
"#,
            s.heartbeats,
            s.commands_dispatched,
            s.dispatch_races_lost,
            s.trade_syncs,
            s.trades_imported,
            s.trades_skipped,
            s.syncs_refused,
        )
    }
}
