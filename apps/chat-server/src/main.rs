//! Hubline chat demo server.
//!
//! Usage: `hubline-chat-server [CONFIG_PATH]`

mod config;
mod hub;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting hubline chat server"
    );

    let config = config::Config::load(std::env::args_os().nth(1).map(Into::into))?;
    let server = hub::build(config.server_config(), &config.endpoint)?;

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("SIGINT received, shutting down");
                stopper.shutdown();
            }
            Err(e) => tracing::warn!("cannot listen for SIGINT: {e}"),
        }
    });

    server.run().await?;
    tracing::info!("chat server shut down cleanly");
    Ok(())
}
