//! Heartbeat handling and command hand-out.
//!
//! A heartbeat marks the terminal RUNNING, forwards account telemetry, and hands out at
//! most one command. The hand-out is a conditional PENDING -> DISPATCHED write, so two
//! concurrent heartbeats can never both receive the same command.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::domain::{HeartbeatPayload, HeartbeatResponse, PositionsPayload, TerminalMetadata};
use crate::error::{FarmError, Result};
use crate::services::metrics::Metrics;
use crate::store::FarmStore;
use crate::validation;

#[derive(Clone)]
pub struct CommandDispatcher {
    store: Arc<dyn FarmStore>,
    metrics: Arc<Metrics>,
}

impl CommandDispatcher {
    pub fn new(store: Arc<dyn FarmStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Validate a raw heartbeat and process it
    pub async fn handle_heartbeat(&self, body: Value) -> Result<HeartbeatResponse> {
        let payload = validation::parse_heartbeat(body)?;
        self.process_heartbeat(payload).await
    }

    /// Record liveness, apply telemetry and hand out at most one pending command.
    ///
    /// The status is promoted to RUNNING only from PENDING or STARTING. A terminal in
    /// STOPPING, STOPPED or ERROR keeps its status, so a late heartbeat cannot undo a
    /// disable or hide a failure.
    #[instrument(skip(self, payload), fields(terminal_id = %payload.terminal_id))]
    pub async fn process_heartbeat(&self, payload: HeartbeatPayload) -> Result<HeartbeatResponse> {
        let terminal_id = payload.terminal_id;
        let terminal = self
            .store
            .get_terminal(terminal_id)
            .await?
            .ok_or_else(|| FarmError::not_found("terminal", terminal_id))?;

        let now = Utc::now();
        if !self.store.record_heartbeat(terminal_id, now).await? {
            return Err(FarmError::not_found("terminal", terminal_id));
        }
        self.metrics.inc_heartbeats();

        if let Some(telemetry) = &payload.telemetry {
            self.store
                .update_account_telemetry(terminal.account_id, telemetry, now)
                .await?;
        }

        let Some(command) = self.store.oldest_pending_command(terminal_id).await? else {
            return Ok(HeartbeatResponse::ok());
        };

        if self.store.try_dispatch_command(command.id, now).await? {
            info!(command_id = %command.id, command = %command.command, "command dispatched");
            self.metrics.inc_commands_dispatched();
            Ok(HeartbeatResponse::with_command(command.command, command.payload))
        } else {
            // Another heartbeat won; the next one picks up whatever is still pending
            debug!(command_id = %command.id, "dispatch race lost");
            self.metrics.inc_dispatch_races_lost();
            Ok(HeartbeatResponse::ok())
        }
    }

    pub async fn handle_positions(&self, body: Value) -> Result<usize> {
        let payload = validation::parse_positions(body)?;
        self.process_positions(payload).await
    }

    /// Cache the terminal's open positions on its metadata
    #[instrument(skip(self, payload), fields(terminal_id = %payload.terminal_id))]
    pub async fn process_positions(&self, payload: PositionsPayload) -> Result<usize> {
        let terminal_id = payload.terminal_id;
        if self.store.get_terminal(terminal_id).await?.is_none() {
            return Err(FarmError::not_found("terminal", terminal_id));
        }

        let now = Utc::now();
        let count = payload.positions.len();
        let metadata = TerminalMetadata::OpenPositions {
            positions: payload.positions,
            updated_at: now,
        };
        self.store
            .set_terminal_metadata(terminal_id, &metadata, now)
            .await?;

        debug!(count, "open positions cached");
        Ok(count)
    }
}
