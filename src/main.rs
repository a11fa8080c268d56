//! Colloquy - streaming assistant chat backend
//!
//! Main entry point: loads configuration, wires the service objects,
//! spawns the background jobs, and runs the HTTP server.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use colloquy::cli::{Cli, Commands};
use colloquy::config::Config;
use colloquy::providers::HostedProvider;
use colloquy::server::AppState;
use colloquy::storage::SqliteStorage;
use colloquy::{jobs, server};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse_args();

    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;
    config.validate()?;

    let storage = match &config.server.database_path {
        Some(path) => Arc::new(SqliteStorage::new_with_path(path.clone())?),
        None => Arc::new(SqliteStorage::new()?),
    };
    let provider = Arc::new(HostedProvider::new(&config.provider)?);
    let state = AppState::new(Arc::new(config), storage, provider);

    match cli.command {
        Commands::Serve => {
            let _jobs = jobs::spawn_background_jobs(&state);
            server::run(state).await
        }
        Commands::CleanupStores => {
            jobs::run_store_cleanup(&state);
            Ok(())
        }
        Commands::RecreateStores => {
            jobs::run_store_recreation(&state).await;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,colloquy=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
