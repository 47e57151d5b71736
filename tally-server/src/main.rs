//! Tally Server - Visit counter with periodic snapshotting

mod persist;
mod server;
mod store;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tally_common::{config_path_from_env, TallyConfig};
use tracing::{error, info};

use crate::persist::{Persister, Scheduler};
use crate::store::StatsStore;

/// Shared application state
pub struct AppState {
    pub config: TallyConfig,
    pub store: Arc<StatsStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tally_server=info".parse()?),
        )
        .init();

    info!("Starting Tally Server v{}", env!("CARGO_PKG_VERSION"));

    let config_path = config_path_from_env();
    info!("Loading configuration from {}", config_path.display());
    let config = TallyConfig::load_or_default(&config_path);

    let store = Arc::new(StatsStore::load(&config.file));
    let persister = Arc::new(Persister::new(config.file.clone()));

    // Bind before starting anything else; a missing socket is fatal
    let listener = server::bind(&config).await?;

    let scheduler = Scheduler::spawn(
        store.clone(),
        persister,
        Duration::from_secs(config.flush_interval_secs),
    );

    let state = Arc::new(AppState { config, store });

    let server_handle = tokio::spawn(server::run_server(listener, state));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    scheduler.shutdown().await;

    info!("Tally Server shutdown complete");
    Ok(())
}
