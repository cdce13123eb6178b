use anyhow::{Context, Result};
use broker_orchestrator::{BrokerConfig, ServiceBroker};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so file output is flushed on exit
    let _guard = broker_logging::init_subscriber();

    info!("Starting service broker...");

    let config = BrokerConfig::from_env().context("Failed to load broker configuration")?;
    info!(
        "Configuration loaded: db_path={}, terraform_version={}",
        config.db_path.display(),
        config.terraform_version
    );

    let broker = ServiceBroker::from_config(&config)
        .await
        .context("Failed to initialize service broker")?;
    info!("Loaded {} service definition(s)", broker.registry().len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested, waiting for running operations...");
    broker.shutdown().await;
    info!("Service broker stopped");

    Ok(())
}
