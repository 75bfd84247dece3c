//! Relay mode: a hosted relay service owns the client connections.
//!
//! Negotiation redirects clients to the relay with a signed access token,
//! and pushes and group changes are issued against the relay's REST API.
//! Every request is authorised with an HS256 token whose audience is the
//! request URL without its query string.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hubline_protocol::{InvocationMessage, NegotiateResponse};
use jsonwebtoken::{EncodingKey, Header};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::ServerError;
use crate::clients::{Fanout, Target};

/// Environment variable holding the relay connection string.
pub const RELAY_CONNECTION_STRING_ENV: &str = "HUBLINE_RELAY_CONNECTION_STRING";

const TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Parsed `Endpoint=https://host;AccessKey=key;` connection string.
#[derive(Clone, PartialEq)]
pub struct RelayConnectionString {
    pub endpoint: Url,
    access_key: String,
}

impl std::fmt::Debug for RelayConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("access_key", &"<redacted>")
            .finish()
    }
}

impl RelayConnectionString {
    pub fn parse(raw: &str) -> Result<Self, ServerError> {
        let mut endpoint = None;
        let mut access_key = None;
        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(ServerError::Configuration(format!(
                    "invalid connection string segment '{part}'"
                )));
            };
            if key.trim().eq_ignore_ascii_case("endpoint") {
                endpoint = Some(value.trim().to_string());
            } else if key.trim().eq_ignore_ascii_case("accesskey") {
                access_key = Some(value.trim().to_string());
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            ServerError::Configuration("connection string has no Endpoint".into())
        })?;
        let access_key = access_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ServerError::Configuration("connection string has no AccessKey".into()))?;
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| ServerError::Configuration(format!("invalid relay endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "https" | "http") || endpoint.host_str().is_none() {
            return Err(ServerError::Configuration(format!(
                "invalid relay endpoint '{endpoint}'"
            )));
        }
        Ok(Self {
            endpoint,
            access_key,
        })
    }

    /// Reads [`RELAY_CONNECTION_STRING_ENV`]; `Ok(None)` when unset or empty.
    pub fn from_env() -> Result<Option<Self>, ServerError> {
        match std::env::var(RELAY_CONNECTION_STRING_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Self::parse(&raw).map(Some),
            _ => Ok(None),
        }
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    aud: &'a str,
    exp: u64,
}

#[derive(Serialize)]
struct PushBody<'a> {
    target: &'a str,
    arguments: &'a [Value],
}

/// REST client for the relay's hub API.
pub(crate) struct RelayClient {
    endpoint: Url,
    key: EncodingKey,
    hub: String,
    http: reqwest::Client,
}

impl RelayClient {
    pub(crate) fn new(conn: &RelayConnectionString, hub: &str) -> Self {
        Self {
            endpoint: conn.endpoint.clone(),
            key: EncodingKey::from_secret(conn.access_key.as_bytes()),
            hub: hub.to_lowercase(),
            http: reqwest::Client::new(),
        }
    }

    /// URL clients are redirected to.
    pub(crate) fn client_url(&self) -> String {
        let base = self.endpoint.as_str().trim_end_matches('/');
        format!("{base}/client/?hub={}", self.hub)
    }

    pub(crate) fn negotiate_redirect(&self) -> Result<NegotiateResponse, ServerError> {
        let url = self.client_url();
        let token = self.sign(&url)?;
        Ok(NegotiateResponse::redirect(url, token))
    }

    fn sign(&self, url: &str) -> Result<String, ServerError> {
        let aud = url.split('?').next().unwrap_or(url);
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(TOKEN_LIFETIME)
            .as_secs();
        jsonwebtoken::encode(&Header::default(), &Claims { aud, exp }, &self.key)
            .map_err(|e| ServerError::Relay(format!("failed to sign token: {e}")))
    }

    /// `{endpoint}/api/v1/hubs/{hub}/{suffix...}`
    fn hub_url(&self, suffix: &[&str]) -> Result<Url, ServerError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ServerError::Relay("relay endpoint cannot be a base".into()))?
            .pop_if_empty()
            .extend(["api", "v1", "hubs", self.hub.as_str()])
            .extend(suffix);
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<&PushBody<'_>>,
    ) -> Result<(), ServerError> {
        let token = self.sign(url.as_str())?;
        let mut req = self.http.request(method.clone(), url.clone()).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ServerError::Relay(format!("{method} {url}: {e}")))?;
        let status = resp.status();
        tracing::debug!(%method, %url, %status, "relay call");
        if !status.is_success() {
            return Err(ServerError::Relay(format!("{method} {url}: status {status}")));
        }
        Ok(())
    }

    pub(crate) async fn send(
        &self,
        target: &Target,
        message: &InvocationMessage,
    ) -> Result<(), ServerError> {
        let body = PushBody {
            target: &message.target,
            arguments: &message.arguments,
        };
        match target {
            Target::All => {
                let url = self.hub_url(&[])?;
                self.call(Method::POST, url, Some(&body)).await
            }
            Target::AllExcept(excluded) => {
                let mut url = self.hub_url(&[])?;
                {
                    let mut query = url.query_pairs_mut();
                    for id in excluded {
                        query.append_pair("excluded", id);
                    }
                }
                self.call(Method::POST, url, Some(&body)).await
            }
            Target::Group(group) => {
                let url = self.hub_url(&["groups", group])?;
                self.call(Method::POST, url, Some(&body)).await
            }
            Target::Connection(id) => {
                let url = self.hub_url(&["connections", id])?;
                self.call(Method::POST, url, Some(&body)).await
            }
            Target::Connections(ids) => {
                for id in ids {
                    let url = self.hub_url(&["connections", id])?;
                    self.call(Method::POST, url, Some(&body)).await?;
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError> {
        let url = self.hub_url(&["groups", group, "connections", connection_id])?;
        self.call(Method::PUT, url, None).await
    }

    pub(crate) async fn remove_from_group(
        &self,
        connection_id: &str,
        group: &str,
    ) -> Result<(), ServerError> {
        let url = self.hub_url(&["groups", group, "connections", connection_id])?;
        self.call(Method::DELETE, url, None).await
    }
}

/// One relay REST call, queued in submission order.
enum RelayCall {
    Push(Target, InvocationMessage),
    AddToGroup(String, String),
    RemoveFromGroup(String, String),
}

/// Fan-out through the relay. Calls are carried out one at a time by a
/// background worker, in the order they were made; failures are logged.
pub(crate) struct RelayFanout {
    calls: mpsc::UnboundedSender<RelayCall>,
}

impl RelayFanout {
    pub(crate) fn new(client: Arc<RelayClient>, runtime: tokio::runtime::Handle) -> Self {
        let (calls, rx) = mpsc::unbounded_channel();
        runtime.spawn(relay_worker(client, rx));
        Self { calls }
    }

    fn queue(&self, call: RelayCall) {
        if self.calls.send(call).is_err() {
            tracing::warn!("relay worker has stopped; call dropped");
        }
    }
}

/// Runs until every `RelayFanout` handle is dropped.
async fn relay_worker(client: Arc<RelayClient>, mut rx: mpsc::UnboundedReceiver<RelayCall>) {
    while let Some(call) = rx.recv().await {
        match call {
            RelayCall::Push(target, message) => {
                if let Err(e) = client.send(&target, &message).await {
                    tracing::warn!(target = %message.target, "relay push failed: {e}");
                }
            }
            RelayCall::AddToGroup(id, group) => {
                if let Err(e) = client.add_to_group(&id, &group).await {
                    tracing::warn!(connection_id = %id, %group, "relay group add failed: {e}");
                }
            }
            RelayCall::RemoveFromGroup(id, group) => {
                if let Err(e) = client.remove_from_group(&id, &group).await {
                    tracing::warn!(connection_id = %id, %group, "relay group remove failed: {e}");
                }
            }
        }
    }
    tracing::debug!("relay worker stopped");
}

impl Fanout for RelayFanout {
    fn push(&self, target: Target, message: InvocationMessage) {
        self.queue(RelayCall::Push(target, message));
    }

    fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError> {
        self.queue(RelayCall::AddToGroup(connection_id.to_string(), group.to_string()));
        Ok(())
    }

    fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError> {
        self.queue(RelayCall::RemoveFromGroup(connection_id.to_string(), group.to_string()));
        Ok(())
    }
}
