//! CA Relay
//!
//! Watches allow-listed channels for asset identifiers and forwards each
//! fresh one to the configured destination.

use ca_relay::config::{config_path, Config};
use ca_relay::runtime::{self, RelayError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let path = config_path();
    let config = Config::load(&path)?;
    tracing::info!("Config loaded from {}", path.display());

    runtime::run(config).await?;
    Ok(())
}
