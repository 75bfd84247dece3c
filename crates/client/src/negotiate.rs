//! Negotiation: `POST {endpoint}/negotiate`, following relay redirects.

use hubline_protocol::constants::NEGOTIATE_VERSION;
use hubline_protocol::{AvailableTransport, NegotiateResponse};
use reqwest::header::AUTHORIZATION;
use tracing::debug;
use url::Url;

use crate::ClientError;

const MAX_REDIRECTS: usize = 100;

/// Outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    /// Endpoint the transports connect to (after redirects).
    pub url: Url,
    pub connection_id: String,
    /// Token for transport URLs; equals the id for version 0 servers.
    pub connection_token: String,
    pub access_token: Option<String>,
    pub transports: Vec<AvailableTransport>,
    pub stateful: bool,
}

pub(crate) async fn negotiate(
    http: &reqwest::Client,
    url: &Url,
    access_token: Option<&str>,
    stateful_reconnect: bool,
) -> Result<Negotiated, ClientError> {
    let mut url = url.clone();
    let mut access_token = access_token.map(str::to_string);

    for _ in 0..MAX_REDIRECTS {
        let target = negotiate_url(&url, stateful_reconnect)?;
        debug!(url = %target, "negotiating");
        let mut request = http.post(target);
        if let Some(token) = &access_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Connection(format!(
                "negotiation failed with status {status}"
            )));
        }
        let body: NegotiateResponse = response.json().await?;

        if let Some(error) = body.error {
            return Err(ClientError::Connection(error));
        }
        if let Some(redirect) = body.url {
            debug!(url = %redirect, "negotiation redirected");
            url = Url::parse(&redirect).map_err(|e| {
                ClientError::Connection(format!("invalid redirect url '{redirect}': {e}"))
            })?;
            access_token = body.access_token;
            continue;
        }

        let Some(connection_id) = body.connection_id else {
            return Err(ClientError::Connection(
                "negotiation response has no connection id".into(),
            ));
        };
        let connection_token = match body.negotiate_version {
            Some(version) if version >= 1 => body.connection_token.ok_or_else(|| {
                ClientError::Connection("negotiation response has no connection token".into())
            })?,
            _ => connection_id.clone(),
        };
        return Ok(Negotiated {
            url,
            connection_id,
            connection_token,
            access_token,
            transports: body.available_transports,
            stateful: body.use_stateful_reconnect,
        });
    }

    Err(ClientError::Connection(
        "negotiation exceeded the maximum number of redirects".into(),
    ))
}

/// `{endpoint}/negotiate?negotiateVersion=1`, keeping the endpoint's query.
pub(crate) fn negotiate_url(url: &Url, stateful_reconnect: bool) -> Result<Url, ClientError> {
    let mut target = http_url(url)?;
    let path = format!("{}/negotiate", target.path().trim_end_matches('/'));
    target.set_path(&path);
    {
        let mut query = target.query_pairs_mut();
        query.append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
        if stateful_reconnect {
            query.append_pair("useStatefulReconnect", "true");
        }
    }
    Ok(target)
}

/// Maps `ws`/`wss` to `http`/`https`.
pub(crate) fn http_url(url: &Url) -> Result<Url, ClientError> {
    swap_scheme(url, |scheme| match scheme {
        "ws" => "http",
        "wss" => "https",
        other => other,
    })
}

/// Maps `http`/`https` to `ws`/`wss`.
pub(crate) fn ws_url(url: &Url) -> Result<Url, ClientError> {
    swap_scheme(url, |scheme| match scheme {
        "http" => "ws",
        "https" => "wss",
        other => other,
    })
}

fn swap_scheme(url: &Url, map: impl Fn(&str) -> &str) -> Result<Url, ClientError> {
    let mut out = url.clone();
    let scheme = map(url.scheme()).to_string();
    out.set_scheme(&scheme)
        .map_err(|()| ClientError::Configuration(format!("cannot use scheme '{scheme}'")))?;
    Ok(out)
}

/// Appends `id=<token>` to the endpoint url.
pub(crate) fn with_connection_token(url: &Url, token: Option<&str>) -> Url {
    let mut out = url.clone();
    if let Some(token) = token {
        out.query_pairs_mut().append_pair("id", token);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubline_protocol::TransportKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned JSON body per accepted connection, in order.
    async fn canned_server(bodies: Vec<String>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in bodies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await.unwrap();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });
        Url::parse(&format!("http://{addr}/chat")).unwrap()
    }

    #[test]
    fn negotiate_url_shape() {
        let url = Url::parse("ws://localhost:5000/chat/").unwrap();
        let target = negotiate_url(&url, true).unwrap();
        assert_eq!(
            target.as_str(),
            "http://localhost:5000/chat/negotiate?negotiateVersion=1&useStatefulReconnect=true"
        );

        let url = Url::parse("https://relay.example/client/?hub=chat").unwrap();
        let target = negotiate_url(&url, false).unwrap();
        assert_eq!(
            target.as_str(),
            "https://relay.example/client/negotiate?hub=chat&negotiateVersion=1"
        );
    }

    #[test]
    fn scheme_mapping() {
        let url = Url::parse("https://host/chat").unwrap();
        assert_eq!(ws_url(&url).unwrap().as_str(), "wss://host/chat");
        let url = Url::parse("wss://host/chat").unwrap();
        assert_eq!(http_url(&url).unwrap().as_str(), "https://host/chat");
    }

    #[test]
    fn connection_token_is_appended() {
        let url = Url::parse("http://host/chat?hub=a").unwrap();
        let out = with_connection_token(&url, Some("t 1"));
        assert_eq!(out.as_str(), "http://host/chat?hub=a&id=t+1");
        assert_eq!(with_connection_token(&url, None), url);
    }

    #[tokio::test]
    async fn follows_redirect_and_reads_connection() {
        let connection = r#"{"negotiateVersion":1,"connectionId":"abc","connectionToken":"tok","availableTransports":[{"transport":"WebSockets","transferFormats":["Text","Binary"]}]}"#;
        let listener_url = canned_server(vec![connection.to_string()]).await;
        let redirect = format!(
            r#"{{"url":"{}","accessToken":"relay-token"}}"#,
            listener_url.as_str()
        );
        let url = canned_server(vec![redirect]).await;

        let http = reqwest::Client::new();
        let negotiated = negotiate(&http, &url, None, false).await.unwrap();
        assert_eq!(negotiated.connection_id, "abc");
        assert_eq!(negotiated.connection_token, "tok");
        assert_eq!(negotiated.access_token.as_deref(), Some("relay-token"));
        assert_eq!(negotiated.url, listener_url);
        assert_eq!(
            negotiated.transports[0].transport,
            TransportKind::WebSockets
        );
    }

    #[tokio::test]
    async fn version_zero_uses_id_as_token() {
        let url = canned_server(vec![
            r#"{"negotiateVersion":0,"connectionId":"legacy"}"#.to_string(),
        ])
        .await;
        let negotiated = negotiate(&reqwest::Client::new(), &url, None, false)
            .await
            .unwrap();
        assert_eq!(negotiated.connection_token, "legacy");
    }

    #[tokio::test]
    async fn error_body_is_a_connection_error() {
        let url = canned_server(vec![r#"{"error":"hub is full"}"#.to_string()]).await;
        let err = negotiate(&reqwest::Client::new(), &url, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connection(m) if m == "hub is full"));
    }
}
