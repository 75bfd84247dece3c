//! Transport routes on the hub endpoint.
//!
//! `GET` opens a WebSocket (upgrade request), an event stream
//! (`Accept: text/event-stream`) or a long poll. `POST` carries client
//! payloads for the two HTTP transports and `DELETE` ends them.

mod long_polling;
mod sse;
mod websocket;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use hubline_protocol::TransportKind;
use serde::Deserialize;

use crate::connection::{AttachError, Connection};
use crate::server::HubServer;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConnectionQuery {
    /// Connection token from negotiation.
    id: Option<String>,
}

pub(crate) async fn connect(
    State(server): State<Arc<HubServer>>,
    Query(query): Query<ConnectionQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Ok(ws) = upgrade {
        return websocket::upgrade(server, query.id, ws);
    }

    let conn = match lookup(&server, query.id.as_deref()) {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };
    if accepts_event_stream(&headers) {
        if !server.transport_enabled(TransportKind::ServerSentEvents) {
            return transport_disabled(TransportKind::ServerSentEvents);
        }
        sse::stream(server, conn).await
    } else {
        if !server.transport_enabled(TransportKind::LongPolling) {
            return transport_disabled(TransportKind::LongPolling);
        }
        long_polling::poll(server, conn).await
    }
}

pub(crate) async fn inbound(
    State(server): State<Arc<HubServer>>,
    Query(query): Query<ConnectionQuery>,
    body: Bytes,
) -> Response {
    let conn = match lookup(&server, query.id.as_deref()) {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };
    if conn.transport() == Some(TransportKind::WebSockets) {
        return (
            StatusCode::BAD_REQUEST,
            "POST requests are not allowed on WebSocket connections",
        )
            .into_response();
    }
    server.receive(&conn, &body);
    StatusCode::OK.into_response()
}

pub(crate) async fn delete(
    State(server): State<Arc<HubServer>>,
    Query(query): Query<ConnectionQuery>,
) -> Response {
    let conn = match lookup(&server, query.id.as_deref()) {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };
    if conn.transport() == Some(TransportKind::WebSockets) {
        return (
            StatusCode::BAD_REQUEST,
            "DELETE requests are not allowed on WebSocket connections",
        )
            .into_response();
    }
    server.close_connection(&conn, None, None);
    StatusCode::ACCEPTED.into_response()
}

#[allow(clippy::result_large_err)]
fn lookup(server: &HubServer, token: Option<&str>) -> Result<Arc<Connection>, Response> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Err((StatusCode::BAD_REQUEST, "connection id required").into_response());
    };
    match server.connections().get_by_token(token) {
        Some(conn) if !conn.is_closed() => Ok(conn),
        _ => Err((StatusCode::NOT_FOUND, "no connection with that id").into_response()),
    }
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"))
}

fn transport_disabled(kind: TransportKind) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!("the {kind} transport is not enabled"),
    )
        .into_response()
}

fn attach_refused(err: AttachError) -> Response {
    match err {
        AttachError::AlreadyAttached => {
            (StatusCode::CONFLICT, "connection already has an active transport").into_response()
        }
        AttachError::TransportMismatch => (
            StatusCode::BAD_REQUEST,
            "connection was started with another transport",
        )
            .into_response(),
    }
}
