//! WebSocket transport: handshake, read pump and write pump.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hubline_protocol::constants::MAX_MESSAGE_SIZE;
use hubline_protocol::{HubProtocol, TransportKind};
use tokio_util::sync::CancellationToken;

use super::attach_refused;
use crate::connection::{Connection, HandshakeOutcome};
use crate::server::HubServer;

pub(super) fn upgrade(server: Arc<HubServer>, token: Option<String>, ws: WebSocketUpgrade) -> Response {
    if !server.transport_enabled(TransportKind::WebSockets) {
        return super::transport_disabled(TransportKind::WebSockets);
    }

    // Without a token the client skipped negotiation.
    let conn = match token {
        Some(token) => match server.connections().get_by_token(&token) {
            Some(conn) if !conn.is_closed() => conn,
            _ => return (StatusCode::NOT_FOUND, "no connection with that id").into_response(),
        },
        None => server.create_connection(false, false),
    };

    let epoch = match conn.attach(TransportKind::WebSockets) {
        Ok(epoch) => epoch,
        Err(e) => return attach_refused(e),
    };

    let failed_server = Arc::clone(&server);
    let failed_conn = Arc::clone(&conn);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(move |e| {
            tracing::warn!(connection_id = %failed_conn.id, "websocket upgrade failed: {e}");
            failed_server.transport_lost(&failed_conn, epoch, Some(format!("upgrade failed: {e}")));
        })
        .on_upgrade(move |socket| serve(server, conn, epoch, socket))
}

async fn serve(server: Arc<HubServer>, conn: Arc<Connection>, epoch: u64, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let handshake_timeout = server.config().handshake_timeout;

    let first = tokio::select! {
        _ = conn.cancel_token().cancelled() => return,
        res = tokio::time::timeout(handshake_timeout, next_payload(&mut stream)) => res,
    };
    let payload = match first {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            server.transport_lost(&conn, epoch, Some("closed before handshake".into()));
            return;
        }
        Err(_) => {
            tracing::warn!(connection_id = %conn.id, "handshake not received in time");
            server.transport_lost(&conn, epoch, Some("handshake timeout".into()));
            return;
        }
    };

    conn.touch();
    match conn.handshake(&payload) {
        HandshakeOutcome::Rejected { response, reason } => {
            tracing::warn!(connection_id = %conn.id, "handshake rejected: {reason}");
            let _ = sink.send(text_frame(response)).await;
            let _ = sink.close().await;
            server.close_connection(&conn, Some(reason), None);
            return;
        }
        HandshakeOutcome::Accepted {
            response,
            first,
            rest,
        } => {
            if sink.send(text_frame(response)).await.is_err() {
                server.transport_lost(&conn, epoch, Some("handshake response not delivered".into()));
                return;
            }
            if first {
                server.connection_established(&conn);
            } else {
                tracing::info!(connection_id = %conn.id, "client reattached");
            }
            if !rest.is_empty() {
                server.dispatch_payload(&conn, rest);
            }
        }
    }

    let attachment = conn.cancel_token().child_token();
    let protocol = conn.protocol().unwrap_or_default();
    let writer = tokio::spawn(write_pump(
        sink,
        Arc::clone(&conn),
        protocol,
        attachment.clone(),
    ));
    let reason = read_pump(stream, &server, &conn, &attachment).await;
    attachment.cancel();
    let _ = writer.await;

    server.transport_lost(&conn, epoch, reason);
}

/// Waits for the first data frame.
async fn next_payload(stream: &mut SplitStream<WebSocket>) -> Option<Vec<u8>> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.as_bytes().to_vec()),
            Ok(Message::Binary(data)) => return Some(data.to_vec()),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

/// Read pump: feeds client frames to the dispatcher.
///
/// Returns the reason the transport ended, if it ended abnormally.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    server: &Arc<HubServer>,
    conn: &Arc<Connection>,
    attachment: &CancellationToken,
) -> Option<String> {
    loop {
        tokio::select! {
            _ = attachment.cancelled() => return None,

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => server.dispatch_payload(conn, text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => server.dispatch_payload(conn, &data),
                    // Pongs are answered by the socket itself.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
                    Some(Ok(Message::Close(_))) => {
                        tracing::debug!(connection_id = %conn.id, "received close frame");
                        return None;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %conn.id, "read pump error: {e}");
                        return Some(format!("websocket error: {e}"));
                    }
                    None => return None,
                }
            }
        }
    }
}

/// Write pump: drains the connection's outbound queue onto the socket.
///
/// When the whole connection is closing, whatever is still queued (the
/// Close message included) is flushed before the socket is closed.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    conn: Arc<Connection>,
    protocol: HubProtocol,
    attachment: CancellationToken,
) {
    let outbound = conn.outbound();
    let mut rx = outbound.lock().await;

    loop {
        tokio::select! {
            biased;

            _ = attachment.cancelled() => break,

            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                if let Err(e) = sink.send(frame(protocol, payload)).await {
                    tracing::debug!(connection_id = %conn.id, "write pump send error: {e}");
                    attachment.cancel();
                    break;
                }
            }
        }
    }

    if conn.cancel_token().is_cancelled() {
        while let Ok(payload) = rx.try_recv() {
            if sink.send(frame(protocol, payload)).await.is_err() {
                break;
            }
        }
    }
    let _ = sink.close().await;
}

fn frame(protocol: HubProtocol, payload: Vec<u8>) -> Message {
    match protocol {
        HubProtocol::Json => text_frame(payload),
        HubProtocol::MessagePack => Message::Binary(payload.into()),
    }
}

fn text_frame(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}
