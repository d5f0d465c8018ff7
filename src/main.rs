#![allow(missing_docs)]

use anyhow::Result;
use tracing::{error, info};

use pulse_scraper_lib::application::Pipeline;
use pulse_scraper_lib::infrastructure::config::AppConfig;
use pulse_scraper_lib::infrastructure::init_logging_with_config;
use pulse_scraper_lib::infrastructure::logging::log_system_info;

#[tokio::main]
async fn main() -> Result<()> {
    // optional first argument: path to a TOML/JSON config file
    let config_path = std::env::args().nth(1);
    let config = AppConfig::load(config_path.as_deref())?;

    init_logging_with_config(&config.logging)?;
    log_system_info();

    let pipeline = Pipeline::from_config(config).await?;
    pipeline.start().await?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("🛑 Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    pipeline.shutdown().await;
    Ok(())
}
