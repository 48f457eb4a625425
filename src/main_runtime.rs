use anyhow::{bail, Context};
use std::sync::Arc;
use termfarm::adapters::{MemoryStore, MetaApiClient, PostgresStore};
use termfarm::broker::BrokerBridge;
use termfarm::config::{AppConfig, LoggingConfig, SecurityConfig};
use termfarm::crypto::{fingerprint, CredentialCipher, PlaintextCipher};
use termfarm::services::TerminalFarm;
use termfarm::store::FarmStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn load_config(dir: &str) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load_from(dir).with_context(|| format!("loading config from {}", dir))?;
    if let Err(problems) = config.validate() {
        bail!("invalid configuration: {}", problems.join("; "));
    }
    Ok(config)
}

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},termfarm=debug,sqlx=warn", config.level))
    });

    // `rolling::daily` aborts if the first file cannot be created, so check the directory
    let file_layer = config.dir.as_deref().and_then(|dir| {
        let writable = std::fs::create_dir_all(dir).is_ok()
            && std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(std::path::Path::new(dir).join(".termfarm_write_test"))
                .is_ok();
        if !writable {
            eprintln!("Warning: log directory {} is not writable, file logging disabled", dir);
            return None;
        }
        let _ = std::fs::remove_file(std::path::Path::new(dir).join(".termfarm_write_test"));

        let appender = tracing_appender::rolling::daily(dir, "termfarm.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // Lives for the whole process
        Box::leak(Box::new(guard));
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (json_layer, text_layer) = if config.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
}

pub async fn build_store(config: &AppConfig, memory: bool) -> anyhow::Result<Arc<dyn FarmStore>> {
    if memory {
        warn!("using in-memory store; state is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PostgresStore::new(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

pub fn build_farm(config: &AppConfig, store: Arc<dyn FarmStore>) -> anyhow::Result<TerminalFarm> {
    let key = config
        .security
        .credential_key()
        .map_err(|e| anyhow::anyhow!(e))?;
    if key.is_some() && config.security.allow_plaintext_credentials {
        warn!("security.encryption_key is set but plaintext credentials are still accepted");
    }
    let cipher: Arc<dyn CredentialCipher> =
        Arc::new(PlaintextCipher::new(config.security.allow_plaintext_credentials));

    let bridge: Option<Arc<dyn BrokerBridge>> = match &config.sync.bridge_token {
        Some(token) if !token.is_empty() => Some(Arc::new(MetaApiClient::new(
            &config.sync.provisioning_url,
            token.clone(),
        )?)),
        _ => {
            warn!("sync.bridge_token not set; scheduled connection syncs are disabled");
            None
        }
    };

    Ok(TerminalFarm::new(config, store, cipher, bridge))
}

/// Report which shared secrets are active. Only fingerprints reach the log.
pub fn log_security(security: &SecurityConfig) {
    let channels = [
        ("agent webhook", security.webhook_secret.as_deref()),
        ("orchestrator", security.orchestrator_secret.as_deref()),
    ];
    for (channel, secret) in channels {
        match secret.filter(|s| !s.is_empty()) {
            Some(secret) => info!(channel, fingerprint = %fingerprint(secret), "shared secret configured"),
            None => warn!(channel, "no shared secret configured; endpoint is unauthenticated"),
        }
    }
    match security.encryption_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => info!(fingerprint = %fingerprint(key), "credential encryption key configured"),
        None if !security.allow_plaintext_credentials => {
            warn!("security.encryption_key not set; stored credentials cannot be decrypted")
        }
        None => {}
    }
    if security.allow_plaintext_credentials {
        warn!("plaintext broker credentials are allowed; do not use in production");
    }
}
