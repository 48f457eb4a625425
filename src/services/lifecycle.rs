//! Terminal lifecycle: enable, disable, and the orchestrator's desired-state feed.
//!
//! User-facing calls only move desired state. STOPPING resolves to STOPPED solely
//! inside [`TerminalLifecycle::orchestrator_config`], when the orchestrator picks up the
//! stop directive.

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::CredentialCipher;
use crate::domain::{TerminalInstance, TerminalStatus};
use crate::error::{FarmError, Result};
use crate::services::health::{terminal_health, HealthThresholds, TerminalHealth};
use crate::store::FarmStore;

/// What the orchestrator should make true for one terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "RUNNING",
            DesiredState::Stopped => "STOPPED",
        }
    }
}

/// Broker login handed to the orchestrator. The password is wiped on drop.
pub struct TerminalCredentials {
    pub server: String,
    pub login: String,
    pub password: Zeroizing<String>,
}

/// One entry of the orchestrator feed.
///
/// Serializes with the decrypted password and must only be written to the orchestrator
/// channel. `Debug` redacts it.
pub struct OrchestratorDirective {
    pub id: Uuid,
    pub status: DesiredState,
    pub account_id: Uuid,
    pub credentials: Option<TerminalCredentials>,
}

impl OrchestratorDirective {
    fn stopped(terminal: &TerminalInstance) -> Self {
        Self {
            id: terminal.id,
            status: DesiredState::Stopped,
            account_id: terminal.account_id,
            credentials: None,
        }
    }
}

impl std::fmt::Debug for OrchestratorDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("OrchestratorDirective");
        d.field("id", &self.id)
            .field("status", &self.status)
            .field("account_id", &self.account_id);
        if let Some(creds) = &self.credentials {
            d.field("server", &creds.server)
                .field("login", &creds.login)
                .field("password", &"<redacted>");
        }
        d.finish()
    }
}

/// Container environment for a RUNNING directive
struct Environment<'a> {
    id: Uuid,
    credentials: &'a TerminalCredentials,
}

impl Serialize for Environment<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("MT5_SERVER", &self.credentials.server)?;
        map.serialize_entry("MT5_LOGIN", &self.credentials.login)?;
        map.serialize_entry("MT5_PASSWORD", self.credentials.password.as_str())?;
        map.serialize_entry("TERMINAL_ID", &self.id)?;
        map.end()
    }
}

impl Serialize for OrchestratorDirective {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = if self.credentials.is_some() { 7 } else { 3 };
        let mut s = serializer.serialize_struct("OrchestratorDirective", fields)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("status", self.status.as_str())?;
        s.serialize_field("accountId", &self.account_id)?;
        if let Some(creds) = &self.credentials {
            s.serialize_field("server", &creds.server)?;
            s.serialize_field("login", &creds.login)?;
            s.serialize_field("password", creds.password.as_str())?;
            s.serialize_field(
                "environment",
                &Environment {
                    id: self.id,
                    credentials: creds,
                },
            )?;
        }
        s.end()
    }
}

/// Status report for an account or terminal
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatusView {
    pub enabled: bool,
    pub id: Option<Uuid>,
    pub status: Option<TerminalStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub health: Option<TerminalHealth>,
}

impl TerminalStatusView {
    fn disabled() -> Self {
        Self {
            enabled: false,
            id: None,
            status: None,
            last_heartbeat: None,
            last_sync_at: None,
            error_message: None,
            health: None,
        }
    }

    fn of(terminal: &TerminalInstance, now: DateTime<Utc>, thresholds: HealthThresholds) -> Self {
        Self {
            enabled: terminal.status.is_live(),
            id: Some(terminal.id),
            status: Some(terminal.status),
            last_heartbeat: terminal.last_heartbeat,
            last_sync_at: terminal.last_sync_at,
            error_message: terminal.error_message.clone(),
            health: Some(terminal_health(terminal, now, thresholds)),
        }
    }
}

#[derive(Clone)]
pub struct TerminalLifecycle {
    store: Arc<dyn FarmStore>,
    cipher: Arc<dyn CredentialCipher>,
    thresholds: HealthThresholds,
}

impl TerminalLifecycle {
    pub fn new(
        store: Arc<dyn FarmStore>,
        cipher: Arc<dyn CredentialCipher>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            store,
            cipher,
            thresholds,
        }
    }

    /// Start auto-sync for an account owned by `user_id`.
    ///
    /// Restarts a STOPPED or ERROR instance in place, otherwise creates a new PENDING one.
    #[instrument(skip(self))]
    pub async fn enable(&self, account_id: Uuid, user_id: Uuid) -> Result<TerminalInstance> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or_else(|| FarmError::not_found("broker account", account_id))?;

        let now = Utc::now();
        let terminal_id = match self.store.get_terminal_by_account(account.id).await? {
            Some(existing) if existing.status.is_live() => {
                return Err(FarmError::AlreadyEnabled(account_id.to_string()));
            }
            Some(existing) => {
                let restarted = self
                    .store
                    .transition_terminal(
                        existing.id,
                        &[TerminalStatus::Stopped, TerminalStatus::Error],
                        TerminalStatus::Pending,
                        now,
                    )
                    .await?;
                if !restarted {
                    return Err(FarmError::AlreadyEnabled(account_id.to_string()));
                }
                info!(terminal_id = %existing.id, from = %existing.status, "terminal restarted");
                existing.id
            }
            None => {
                let terminal = TerminalInstance::new_pending(account.id, user_id, now);
                self.store.create_terminal(&terminal).await?;
                info!(terminal_id = %terminal.id, "terminal created");
                terminal.id
            }
        };

        self.store.set_terminal_enabled(account.id, true).await?;

        self.store
            .get_terminal(terminal_id)
            .await?
            .ok_or_else(|| FarmError::not_found("terminal", terminal_id))
    }

    /// Ask the orchestrator to stop the account's terminal
    #[instrument(skip(self))]
    pub async fn disable(&self, account_id: Uuid) -> Result<TerminalInstance> {
        let terminal = self
            .store
            .get_terminal_by_account(account_id)
            .await?
            .ok_or_else(|| FarmError::NotEnabled(account_id.to_string()))?;

        match terminal.status {
            TerminalStatus::Stopped | TerminalStatus::Stopping => {
                debug!(terminal_id = %terminal.id, status = %terminal.status, "already stopping");
            }
            _ => {
                let moved = self
                    .store
                    .transition_terminal(
                        terminal.id,
                        &[
                            TerminalStatus::Pending,
                            TerminalStatus::Starting,
                            TerminalStatus::Running,
                            TerminalStatus::Error,
                        ],
                        TerminalStatus::Stopping,
                        Utc::now(),
                    )
                    .await?;
                if moved {
                    info!(terminal_id = %terminal.id, from = %terminal.status, "terminal stopping");
                } else {
                    debug!(terminal_id = %terminal.id, "terminal changed state concurrently");
                }
            }
        }

        self.store.set_terminal_enabled(account_id, false).await?;

        self.store
            .get_terminal(terminal.id)
            .await?
            .ok_or_else(|| FarmError::not_found("terminal", terminal.id))
    }

    /// Desired state for every live terminal.
    ///
    /// STOPPING terminals are returned once as STOPPED and persisted as such. PENDING
    /// terminals advance to STARTING as the orchestrator takes them on.
    #[instrument(skip(self))]
    pub async fn orchestrator_config(&self) -> Result<Vec<OrchestratorDirective>> {
        let terminals = self.store.list_live_terminals().await?;
        let now = Utc::now();
        let mut directives = Vec::with_capacity(terminals.len());

        for terminal in terminals {
            if terminal.status == TerminalStatus::Stopping {
                let stopped = self
                    .store
                    .transition_terminal(
                        terminal.id,
                        &[TerminalStatus::Stopping],
                        TerminalStatus::Stopped,
                        now,
                    )
                    .await?;
                if stopped {
                    info!(terminal_id = %terminal.id, "terminal stopped by orchestrator");
                    directives.push(OrchestratorDirective::stopped(&terminal));
                }
                continue;
            }

            let Some(account) = self.store.get_account(terminal.account_id).await? else {
                warn!(
                    terminal_id = %terminal.id,
                    account_id = %terminal.account_id,
                    "broker account missing, skipping terminal"
                );
                continue;
            };

            let password = match self.cipher.decrypt(&account.encrypted_password) {
                Ok(password) => password,
                Err(e) => {
                    error!(terminal_id = %terminal.id, "credential decryption failed: {}", e);
                    self.store
                        .mark_terminal_error(
                            terminal.id,
                            "Failed to decrypt broker credentials",
                            now,
                        )
                        .await?;
                    continue;
                }
            };

            if terminal.status == TerminalStatus::Pending {
                self.store
                    .transition_terminal(
                        terminal.id,
                        &[TerminalStatus::Pending],
                        TerminalStatus::Starting,
                        now,
                    )
                    .await?;
            }

            directives.push(OrchestratorDirective {
                id: terminal.id,
                status: DesiredState::Running,
                account_id: terminal.account_id,
                credentials: Some(TerminalCredentials {
                    server: account.server,
                    login: account.login,
                    password,
                }),
            });
        }

        debug!(count = directives.len(), "orchestrator config served");
        Ok(directives)
    }

    pub async fn status_for_account(&self, account_id: Uuid) -> Result<TerminalStatusView> {
        if self.store.get_account(account_id).await?.is_none() {
            return Err(FarmError::not_found("broker account", account_id));
        }
        Ok(match self.store.get_terminal_by_account(account_id).await? {
            Some(terminal) => TerminalStatusView::of(&terminal, Utc::now(), self.thresholds),
            None => TerminalStatusView::disabled(),
        })
    }

    pub async fn status_for_terminal(&self, terminal_id: Uuid) -> Result<TerminalStatusView> {
        let terminal = self
            .store
            .get_terminal(terminal_id)
            .await?
            .ok_or_else(|| FarmError::not_found("terminal", terminal_id))?;
        Ok(TerminalStatusView::of(&terminal, Utc::now(), self.thresholds))
    }
}
