//! `POST {endpoint}/negotiate`

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hubline_protocol::NegotiateResponse;
use serde::Deserialize;

use crate::server::HubServer;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NegotiateQuery {
    #[serde(default)]
    negotiate_version: Option<u32>,
    #[serde(default)]
    use_stateful_reconnect: bool,
}

pub(crate) async fn negotiate(
    State(server): State<Arc<HubServer>>,
    Query(query): Query<NegotiateQuery>,
) -> Response {
    if let Some(relay) = server.relay() {
        return match relay.negotiate_redirect() {
            Ok(redirect) => Json(redirect).into_response(),
            Err(e) => {
                tracing::error!("relay negotiate failed: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(NegotiateResponse::error(e.to_string())),
                )
                    .into_response()
            }
        };
    }

    let legacy = query.negotiate_version == Some(0);
    let stateful = query.use_stateful_reconnect && server.config().allow_stateful_reconnect;
    let conn = server.create_connection(stateful, legacy);

    let mut response = NegotiateResponse::connection(
        conn.id.clone(),
        conn.token.clone(),
        &server.config().transports,
        stateful,
    );
    if legacy {
        response.negotiate_version = Some(0);
        response.connection_token = None;
    }
    Json(response).into_response()
}
