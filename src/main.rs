use std::sync::Arc;

use anyhow::{Error, Result};
use resilience_engine::{api::run_api_server, config::Config, registry::Registry, utils::init_tracing};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(&config.log_format)?;

    let registry = Arc::new(Registry::init(&config).await?);
    registry.start();

    let served = run_api_server(Arc::clone(&registry), config.server_port, shutdown_signal()).await;

    registry.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
