use aiseg2_bridge::{AppConfig, DataCoordinator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting AiSEG2 bridge");
    let config = AppConfig::from_env()?;

    // Poller and publisher each run in their own task until Ctrl-C.
    let coordinator = DataCoordinator::start(config)?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    coordinator.shutdown().await;

    Ok(())
}
