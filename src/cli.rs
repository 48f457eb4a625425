use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "termfarm")]
#[command(version = "0.1.0")]
#[command(about = "Terminal orchestration and trade reconciliation service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml plus $TERMFARM_ENV.toml)
    #[arg(short, long, global = true, default_value = "config", env = "TERMFARM_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        /// Keep all state in memory instead of Postgres
        #[arg(long)]
        memory: bool,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Run one scheduled broker sync for a connection
    Sync {
        /// Connection id
        connection_id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_memory() {
        let cli = Cli::try_parse_from(["termfarm", "serve", "--memory"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { memory: true }));
        assert_eq!(cli.config, "config");
    }

    #[test]
    fn test_parse_sync_with_config() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "termfarm",
            "--config",
            "/etc/termfarm",
            "sync",
            &id.to_string(),
        ])
        .unwrap();
        assert_eq!(cli.config, "/etc/termfarm");
        match cli.command {
            Commands::Sync { connection_id } => assert_eq!(connection_id, id),
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_sync_rejects_bad_uuid() {
        assert!(Cli::try_parse_from(["termfarm", "sync", "nope"]).is_err());
    }
}
