use anyhow::Context;
use clap::Parser;
use termfarm::adapters::PostgresStore;
use termfarm::api::{create_router, AppState};
use termfarm::cli::{Cli, Commands};
use tokio::signal;
use tracing::info;

mod main_runtime;

use main_runtime::{build_farm, build_store, init_logging, load_config, log_security};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Serve { memory } => {
            log_security(&config.security);
            let store = build_store(&config, memory).await?;
            let farm = build_farm(&config, store)?;
            let state = AppState::new(farm, config.security.clone());
            let app = create_router(state);

            let addr = format!("{}:{}", config.server.host, config.server.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding {}", addr))?;
            info!("termfarm listening on {}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal::ctrl_c().await;
                    info!("shutdown signal received");
                })
                .await?;
        }
        Commands::Migrate => {
            let store =
                PostgresStore::new(&config.database.url, config.database.max_connections).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Sync { connection_id } => {
            let store = build_store(&config, false).await?;
            let farm = build_farm(&config, store)?;
            let summary = farm.connections.sync(connection_id).await?;
            println!(
                "Synced connection {}: {} imported, {} skipped",
                connection_id, summary.imported, summary.skipped
            );
        }
    }

    Ok(())
}
