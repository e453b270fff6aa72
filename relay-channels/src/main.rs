//! Relay Channels - Main entry point.

use anyhow::Result;
use relay_channels::start;
use relay_common::config::Config;
use relay_common::logging::init_logging_with_exclusions;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (file, then environment overrides)
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

    tracing::info!("Relay Channels v{}", env!("CARGO_PKG_VERSION"));

    start(&config).await
}
