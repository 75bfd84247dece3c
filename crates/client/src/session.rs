//! Session supervisor: runs the pumps over the current transport and
//! decides what happens when it ends.

use std::sync::Arc;

use hubline_protocol::{CloseMessage, HubMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::ClientError;
use crate::connection::Shared;
use crate::pumps::ping::ping_pump;
use crate::pumps::read::{Dispatch, LinkEnd, read_pump};
use crate::pumps::write::write_pump;
use crate::reconnection::reconnect;
use crate::transport::{Endpoint, TransportLink};
use crate::types::ConnectionState;

/// A connected, handshaken transport ready for a session.
pub(crate) struct Established {
    pub link: TransportLink,
    pub endpoint: Endpoint,
    /// Bytes that followed the handshake response.
    pub leftover: Vec<u8>,
    pub connection_id: Option<String>,
    /// The server keeps the connection across transport drops.
    pub stateful: bool,
}

pub(crate) async fn supervise(
    shared: Arc<Shared>,
    established: Established,
    write_tx: mpsc::Sender<Vec<u8>>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let Established {
        mut link,
        endpoint,
        mut leftover,
        stateful,
        ..
    } = established;
    let protocol = shared.options.protocol;
    let ping = match protocol.write(&HubMessage::Ping) {
        Ok(ping) => ping,
        Err(e) => {
            error!("failed to encode ping: {e}");
            link.close().await;
            shared.finish(Some(e.into()));
            return;
        }
    };

    let error = loop {
        let link_cancel = cancel.child_token();
        let writer = tokio::spawn(write_pump(write_rx, link.sender(), link_cancel.clone()));
        let pinger = tokio::spawn(ping_pump(
            write_tx.clone(),
            ping.clone(),
            shared.options.keep_alive_interval,
            link_cancel.clone(),
        ));

        let dispatch = Dispatch {
            protocol,
            handlers: &shared.handlers,
            pending: &shared.pending,
        };
        let end = read_pump(
            &mut link.incoming,
            dispatch,
            std::mem::take(&mut leftover),
            shared.options.server_timeout,
            &link_cancel,
        )
        .await;

        link_cancel.cancel();
        let _ = pinger.await;
        write_rx = match writer.await {
            Ok(queue) => queue,
            Err(e) => {
                error!("write pump failed: {e}");
                link.close().await;
                break Some(ClientError::Connection("write pump failed".into()));
            }
        };

        let (error, may_reconnect) = match end {
            LinkEnd::Stopped => {
                close_gracefully(link, &mut write_rx, protocol).await;
                break None;
            }
            LinkEnd::ServerClosed(close) => {
                link.close().await;
                let error = close
                    .error
                    .map(|e| ClientError::Connection(format!("server closed the connection: {e}")));
                (error, close.allow_reconnect)
            }
            LinkEnd::Lost(reason) => {
                link.close().await;
                (Some(ClientError::Connection(reason)), true)
            }
        };

        if !(stateful && may_reconnect) {
            break error;
        }
        shared.set_state(ConnectionState::Reconnecting);
        match reconnect(&shared, &endpoint, &cancel).await {
            Some((next, rest)) => {
                link = next;
                leftover = rest;
                shared.set_state(ConnectionState::Connected);
            }
            None if cancel.is_cancelled() => break None,
            None => break error,
        }
    };

    shared.finish(error);
}

/// Flushes the queue and a Close message, then closes the transport.
async fn close_gracefully(
    link: TransportLink,
    queue: &mut mpsc::Receiver<Vec<u8>>,
    protocol: hubline_protocol::HubProtocol,
) {
    while let Ok(payload) = queue.try_recv() {
        if link.send(payload).await.is_err() {
            break;
        }
    }
    match protocol.write(&HubMessage::Close(CloseMessage::default())) {
        Ok(close) => {
            let _ = link.send(close).await;
        }
        Err(e) => debug!("failed to encode close: {e}"),
    }
    info!(transport = %link.kind, "closing transport");
    link.close().await;
}
