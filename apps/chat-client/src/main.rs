//! Hubline chat demo client.
//!
//! Usage: `hubline-chat-client [CONFIG_PATH]`

mod config;

use hubline_client::{ConnectionEvent, HubConnection};
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
        "starting hubline chat client"
    );

    let config = config::Config::load(std::env::args_os().nth(1).map(Into::into))?;
    let conn = HubConnection::new(config.connection_options()?)?;

    conn.on("Receive", |(message,): (String,)| {
        tracing::info!("received: {message}");
    });
    conn.on_closed(|error| match error {
        Some(e) => tracing::warn!("connection closed: {e}"),
        None => tracing::info!("connection closed"),
    });

    let mut events = conn.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::StateChanged { previous, current } => {
                    tracing::info!(%previous, %current, "state changed");
                }
                ConnectionEvent::Reconnecting {
                    attempt,
                    next_retry_secs,
                } => {
                    tracing::info!(attempt, next_retry_secs, "reconnecting");
                }
            }
        }
    });

    conn.start().await?;
    tracing::info!(
        connection_id = conn.connection_id().as_deref().unwrap_or("-"),
        url = %config.url,
        "connected"
    );

    conn.send("Hi", (config.message.as_str(),)).await?;
    let ok: bool = conn.invoke("Hi", (config.message.as_str(),)).await?;
    tracing::info!(result = ok, "Hi answered");
    conn.invoke::<()>("Broadcast", (config.message.as_str(),)).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");
    conn.stop().await;

    tracing::info!("chat client shut down cleanly");
    Ok(())
}
