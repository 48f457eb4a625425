use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Shared secret the remote agents send as `x-api-key`
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Shared secret the orchestrator sends as `x-orchestrator-secret`
    #[serde(default)]
    pub orchestrator_secret: Option<String>,
    /// Accept credentials stored without encryption (development only)
    #[serde(default)]
    pub allow_plaintext_credentials: bool,
    /// Hex-encoded 256-bit key for broker credentials at rest
    #[serde(default)]
    pub encryption_key: Option<String>,
}

const CREDENTIAL_KEY_LEN: usize = 32;

impl SecurityConfig {
    /// Decoded credential key, or `None` when no key is configured
    pub fn credential_key(&self) -> Result<Option<Zeroizing<Vec<u8>>>, String> {
        let Some(raw) = self.encryption_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let key = Zeroizing::new(
            hex::decode(raw.trim())
                .map_err(|_| "security.encryption_key must be hex encoded".to_string())?,
        );
        if key.len() != CREDENTIAL_KEY_LEN {
            return Err(format!(
                "security.encryption_key must be {} bytes, got {}",
                CREDENTIAL_KEY_LEN,
                key.len()
            ));
        }
        Ok(Some(key))
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("SecurityConfig")
            .field("webhook_secret", &redact(&self.webhook_secret))
            .field("orchestrator_secret", &redact(&self.orchestrator_secret))
            .field("allow_plaintext_credentials", &self.allow_plaintext_credentials)
            .field("encryption_key", &redact(&self.encryption_key))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Monthly ceiling on broker syncs per connection
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: i32,
    /// Access token for the broker bridge
    #[serde(default)]
    pub bridge_token: Option<String>,
    /// Provisioning API base URL for the broker bridge
    #[serde(default = "default_provisioning_url")]
    pub provisioning_url: String,
    /// Deploy + connect bound for a cold bridge account
    #[serde(default = "default_cold_timeout")]
    pub cold_deploy_timeout_secs: u64,
    /// Connect bound for an already deployed bridge account
    #[serde(default = "default_warm_timeout")]
    pub warm_deploy_timeout_secs: u64,
    /// How far back the first sync of a connection reaches
    #[serde(default = "default_history_days")]
    pub history_days: i64,
    #[serde(default = "default_deal_page_size")]
    pub deal_page_size: usize,
    /// Pagination safety cap
    #[serde(default = "default_max_deals")]
    pub max_deals: usize,
}

fn default_monthly_limit() -> i32 {
    60
}

fn default_provisioning_url() -> String {
    "https://mt-provisioning-api-v1.agiliumtrade.agiliumtrade.ai".to_string()
}

fn default_cold_timeout() -> u64 {
    120
}

fn default_warm_timeout() -> u64 {
    60
}

fn default_history_days() -> i64 {
    90
}

fn default_deal_page_size() -> usize {
    1000
}

fn default_max_deals() -> usize {
    100_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            monthly_limit: default_monthly_limit(),
            bridge_token: None,
            provisioning_url: default_provisioning_url(),
            cold_deploy_timeout_secs: default_cold_timeout(),
            warm_deploy_timeout_secs: default_warm_timeout(),
            history_days: default_history_days(),
            deal_page_size: default_deal_page_size(),
            max_deals: default_max_deals(),
        }
    }
}

impl SyncConfig {
    pub fn cold_deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.cold_deploy_timeout_secs)
    }

    pub fn warm_deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.warm_deploy_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the base delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Rows per batched ledger insert
    #[serde(default = "default_chunk_size")]
    pub insert_chunk_size: usize,
}

fn default_chunk_size() -> usize {
    50
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            insert_chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_heartbeat_max_age")]
    pub heartbeat_max_age_secs: i64,
    #[serde(default = "default_sync_max_age")]
    pub sync_max_age_secs: i64,
}

fn default_heartbeat_max_age() -> i64 {
    120
}

fn default_sync_max_age() -> i64 {
    3600
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_max_age_secs: default_heartbeat_max_age(),
            sync_max_age_secs: default_sync_max_age(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.url", "postgres://localhost/termfarm")?
            .set_default("database.max_connections", 5)?
            .set_default("sync.monthly_limit", 60)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TERMFARM_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // TERMFARM__SYNC__MONTHLY_LIMIT, TERMFARM__DATABASE__URL, ...
            .add_source(
                Environment::with_prefix("TERMFARM")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration used by the in-memory development mode and tests
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/termfarm".to_string(),
                max_connections: default_max_connections(),
            },
            security: SecurityConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
            reconcile: ReconcileConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sync.monthly_limit <= 0 {
            errors.push("sync.monthly_limit must be positive".to_string());
        }

        if self.sync.deal_page_size == 0 || self.sync.deal_page_size > 1000 {
            errors.push("sync.deal_page_size must be between 1 and 1000".to_string());
        }

        if self.reconcile.insert_chunk_size == 0 {
            errors.push("reconcile.insert_chunk_size must be positive".to_string());
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }

        if self.retry.multiplier < 1.0 {
            errors.push("retry.multiplier must be >= 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            errors.push("retry.jitter must be between 0 and 1".to_string());
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }

        if let Err(e) = self.security.credential_key() {
            errors.push(e);
        }

        if self.sync.warm_deploy_timeout_secs > self.sync.cold_deploy_timeout_secs {
            errors.push(
                "sync.warm_deploy_timeout_secs should not exceed sync.cold_deploy_timeout_secs"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
