//! Entry point: load configuration, initialize logging, start the server.

use anyhow::Result;
use relay_common::config::AppConfig;
use relay_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    config.validate()?;

    init_logging(&config.observability.log_level, &config.observability.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting relay-server");

    relay_server::start_server(&config).await
}
