//! Fetch the detector model files listed under `[models]` in the config.

use anyhow::{Context, Result};
use darknode::{DarknodeConfig, ModelInstaller};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("darknode=info")),
        )
        .init();

    let config = DarknodeConfig::load().context("Failed to load configuration")?;
    let installer = ModelInstaller::new(&config.models).context("Failed to build HTTP client")?;

    let report = installer
        .install()
        .await
        .context("Model installation failed")?;

    for path in &report.downloaded {
        info!(path = %path.display(), "Installed");
    }
    for path in &report.skipped {
        info!(path = %path.display(), "Already present");
    }

    Ok(())
}
