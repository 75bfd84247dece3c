//! Stateful reconnection with exponential backoff.
//!
//! The server keeps a stateful connection for a while after its transport
//! drops; the client reattaches a new WebSocket with the same connection
//! token and handshakes again.

use hubline_protocol::TransportKind;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ClientError;
use crate::connection::Shared;
use crate::transport::{Endpoint, TransportLink};
use crate::types::ConnectionEvent;

/// Retries until a transport is reattached, attempts run out or `cancel`
/// fires. Returns the new link and any bytes that followed the handshake.
pub(crate) async fn reconnect(
    shared: &Shared,
    endpoint: &Endpoint,
    cancel: &CancellationToken,
) -> Option<(TransportLink, Vec<u8>)> {
    let config = &shared.options.reconnect;

    for attempt in 1..=config.max_attempts {
        let delay = config.delay_for_attempt(attempt);
        let delay_secs = delay.as_secs_f64();
        shared.emit(ConnectionEvent::Reconnecting {
            attempt,
            next_retry_secs: delay_secs,
        });
        info!(
            attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            "reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let timeout = shared.options.handshake_timeout;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return None;
            }
            result = tokio::time::timeout(timeout, reattach(shared, endpoint)) => result,
        };
        match result {
            Ok(Ok(reattached)) => {
                info!(attempt, "reconnected");
                return Some(reattached);
            }
            Ok(Err(e)) => warn!(attempt, "reconnect attempt failed: {e}"),
            Err(_) => warn!(attempt, "reconnect attempt timed out"),
        }
    }

    warn!(
        attempts = config.max_attempts,
        "giving up on reconnecting"
    );
    None
}

async fn reattach(
    shared: &Shared,
    endpoint: &Endpoint,
) -> Result<(TransportLink, Vec<u8>), ClientError> {
    let mut link = TransportLink::connect(TransportKind::WebSockets, endpoint, &shared.http).await?;
    let leftover = link.handshake(shared.options.protocol).await?;
    Ok((link, leftover))
}
