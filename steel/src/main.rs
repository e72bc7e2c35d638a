//! Steel server entry point.

use std::path::Path;

use steel::{SteelServer, config::SteelConfig};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt};

fn init_logging() -> anyhow::Result<()> {
    LogTracer::init()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let config = SteelConfig::load_or_create(Path::new("config/steel_config.json5"))?;
    let server = SteelServer::new(config)?;

    let cancel_token = server.cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received shutdown signal");
        }
        cancel_token.cancel();
    });

    let tick_loop = server.start().await?;
    tick_loop.await?;
    server.shutdown()
}
