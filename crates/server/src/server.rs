//! Hub server.
//!
//! Binds one HTTP listener, serves the negotiate route and the transport
//! routes of a single hub endpoint, and owns the connection table, the
//! method registry and the push fan-out.

use std::fmt::Display;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use futures_util::FutureExt;
use hubline_protocol::constants::{
    DEFAULT_CLIENT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_LONG_POLL_TIMEOUT, DEFAULT_RECONNECT_WINDOW, TransportKind,
};
use hubline_protocol::{
    CloseMessage, CompletionMessage, FromArguments, HubMessage, IntoArguments, InvocationMessage,
    ProtocolError,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::clients::{ConnectionTable, DirectFanout, Fanout, Target};
use crate::connection::{self, Connection, HandshakeOutcome};
use crate::handler::{HandlerDescriptor, HandlerRegistry, HubContext};
use crate::negotiate;
use crate::relay::{RelayClient, RelayConnectionString, RelayFanout};
use crate::transport;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_address: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Interval between server pings on a connected transport.
    pub keep_alive_interval: Duration,
    /// Close a connection when nothing arrives from it for this long.
    pub client_timeout: Duration,
    /// Close a connection that has not completed the handshake in time.
    pub handshake_timeout: Duration,
    /// Maximum time a long-poll request is held open.
    pub long_poll_timeout: Duration,
    /// How long a detached stateful connection is kept for its client.
    pub reconnect_window: Duration,
    /// Transports offered during negotiation, in preference order.
    pub transports: Vec<TransportKind>,
    /// Grant stateful reconnect to clients that ask for it.
    pub allow_stateful_reconnect: bool,
    /// `Endpoint=...;AccessKey=...;`; enables relay mode when set.
    pub relay_connection_string: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            reconnect_window: DEFAULT_RECONNECT_WINDOW,
            transports: TransportKind::ALL.to_vec(),
            allow_stateful_reconnect: true,
            relay_connection_string: None,
        }
    }
}

type ConnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;
type DisconnectedCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// The hub server.
///
/// Created with [`HubServer::new`], configured with
/// [`register_endpoint`](Self::register_endpoint) and
/// [`on_invoke`](Self::on_invoke), then started with
/// [`start`](Self::start) or [`run`](Self::run).
pub struct HubServer {
    config: ServerConfig,
    endpoint: RwLock<Option<String>>,
    started: AtomicBool,
    handlers: HandlerRegistry,
    connections: Arc<ConnectionTable>,
    fanout: RwLock<Arc<dyn Fanout>>,
    relay: RwLock<Option<Arc<RelayClient>>>,
    on_connected: RwLock<Vec<ConnectedCallback>>,
    on_disconnected: RwLock<Vec<DisconnectedCallback>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let connections = Arc::new(ConnectionTable::default());
        let fanout: Arc<dyn Fanout> = Arc::new(DirectFanout::new(Arc::clone(&connections)));
        Arc::new(Self {
            config,
            endpoint: RwLock::new(None),
            started: AtomicBool::new(false),
            handlers: HandlerRegistry::default(),
            connections,
            fanout: RwLock::new(fanout),
            relay: RwLock::new(None),
            on_connected: RwLock::new(Vec::new()),
            on_disconnected: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            serve_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the hub to `path`, e.g. `/chat`.
    ///
    /// Must be called before [`start`](Self::start); calling it again
    /// before start replaces the route.
    pub fn register_endpoint(&self, path: &str) -> Result<(), ServerError> {
        if self.started.load(Ordering::Acquire) {
            return Err(ServerError::Configuration(
                "cannot register an endpoint after the server has started".into(),
            ));
        }
        validate_endpoint(path)?;
        *self.endpoint.write() = Some(path.to_string());
        Ok(())
    }

    /// Registers a hub method.
    ///
    /// `A` is decoded from the invocation arguments (a tuple of
    /// deserializable types, `()` or `Vec<Value>`), and the `Ok` value is
    /// sent back as the completion result. Names match case-insensitively;
    /// registering a name twice replaces the first handler.
    pub fn on_invoke<A, R, E, F, Fut>(&self, name: &str, handler: F) -> Result<(), ServerError>
    where
        A: FromArguments + Send + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
        F: Fn(HubContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.handlers.insert(HandlerDescriptor::new(name, handler))
    }

    /// Called with the connection id once a connection completes its
    /// handshake.
    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connected.write().push(Arc::new(callback));
    }

    /// Called with the connection id and close reason once a connected
    /// connection goes away.
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.on_disconnected.write().push(Arc::new(callback));
    }

    /// Queues `method(args)` on every connection matched by `target`.
    ///
    /// Returns once the message is queued; delivery happens on each
    /// connection's transport.
    pub fn push(
        &self,
        method: &str,
        args: impl IntoArguments,
        target: Target,
    ) -> Result<(), ServerError> {
        let message = InvocationMessage::notify(method, args.into_arguments()?);
        let fanout = Arc::clone(&*self.fanout.read());
        fanout.push(target, message);
        Ok(())
    }

    pub fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError> {
        let fanout = Arc::clone(&*self.fanout.read());
        fanout.add_to_group(connection_id, group)
    }

    pub fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError> {
        let fanout = Arc::clone(&*self.fanout.read());
        fanout.remove_from_group(connection_id, group)
    }

    /// Sends a Close message to the connection and closes it.
    pub fn disconnect(&self, connection_id: &str) -> Result<(), ServerError> {
        let conn = self
            .connections
            .get(connection_id)
            .ok_or_else(|| ServerError::NotFound(connection_id.to_string()))?;
        self.close_connection(&conn, Some("disconnected by server".into()), Some(CloseMessage::default()));
        Ok(())
    }

    /// Number of connections that completed the handshake and are open.
    pub fn connection_count(&self) -> usize {
        self.connections.live_count()
    }

    /// Returns the bound address. Only available after [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listener and serves in the background.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let endpoint = self.endpoint.read().clone().ok_or_else(|| {
            ServerError::Configuration("no hub endpoint registered".into())
        })?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::Configuration("server already started".into()));
        }

        match self.bind(&endpoint).await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                self.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn bind(self: &Arc<Self>, endpoint: &str) -> Result<SocketAddr, ServerError> {
        if let Some(raw) = &self.config.relay_connection_string {
            let conn = RelayConnectionString::parse(raw)?;
            let client = Arc::new(RelayClient::new(&conn, hub_name(endpoint)));
            *self.fanout.write() = Arc::new(RelayFanout::new(
                Arc::clone(&client),
                tokio::runtime::Handle::current(),
            ));
            *self.relay.write() = Some(client);
            tracing::info!(relay = %conn.endpoint, "relay mode enabled");
        }

        let router = self.router(endpoint);
        let listener = TcpListener::bind((self.config.bind_address, self.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!(%addr, endpoint, "hub server listening");

        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("hub server error: {e}");
            }
        });
        *self.serve_task.lock() = Some(task);
        Ok(addr)
    }

    /// Starts the server and waits until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        self.start().await?;
        self.cancel.cancelled().await;
        let task = self.serve_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!("hub server stopped");
        Ok(())
    }

    /// Closes every connection and stops the listener.
    pub fn shutdown(&self) {
        tracing::info!("hub server shutting down");
        for conn in self.connections.all() {
            self.close_connection(
                &conn,
                Some("server shutting down".into()),
                Some(CloseMessage::default()),
            );
        }
        self.cancel.cancel();
    }

    fn router(self: &Arc<Self>, endpoint: &str) -> Router {
        Router::new()
            .route(&format!("{endpoint}/negotiate"), post(negotiate::negotiate))
            .route(
                endpoint,
                get(transport::connect)
                    .post(transport::inbound)
                    .delete(transport::delete),
            )
            .with_state(Arc::clone(self))
    }

    pub(crate) fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub(crate) fn relay(&self) -> Option<Arc<RelayClient>> {
        self.relay.read().clone()
    }

    pub(crate) fn transport_enabled(&self, kind: TransportKind) -> bool {
        self.config.transports.contains(&kind)
    }

    /// Allocates a connection and starts its liveness task.
    ///
    /// With `legacy` (negotiate version 0) the connection id doubles as
    /// the transport token.
    pub(crate) fn create_connection(self: &Arc<Self>, stateful: bool, legacy: bool) -> Arc<Connection> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let token = if legacy {
            id.clone()
        } else {
            uuid::Uuid::new_v4().simple().to_string()
        };
        let conn = Connection::new(id, token, stateful, &self.cancel);
        self.connections.insert(Arc::clone(&conn));
        tokio::spawn(connection::liveness(Arc::clone(self), Arc::clone(&conn)));
        tracing::debug!(connection_id = %conn.id, stateful, "connection allocated");
        conn
    }

    /// Handles a payload POSTed by a Server-Sent Events or Long Polling
    /// client: the handshake first, hub messages afterwards.
    pub(crate) fn receive(self: &Arc<Self>, conn: &Arc<Connection>, payload: &[u8]) {
        conn.touch();
        if conn.is_handshaken() {
            self.dispatch_payload(conn, payload);
            return;
        }
        match conn.handshake(payload) {
            HandshakeOutcome::Accepted {
                response,
                first,
                rest,
            } => {
                conn.enqueue(response);
                if first {
                    self.connection_established(conn);
                }
                if !rest.is_empty() {
                    self.dispatch_payload(conn, rest);
                }
            }
            HandshakeOutcome::Rejected { response, reason } => {
                tracing::warn!(connection_id = %conn.id, "handshake rejected: {reason}");
                conn.enqueue(response);
                self.close_connection(conn, Some(reason), None);
            }
        }
    }

    /// Decodes hub messages from a handshaken connection and acts on them.
    pub(crate) fn dispatch_payload(self: &Arc<Self>, conn: &Arc<Connection>, payload: &[u8]) {
        conn.touch();
        let Some(protocol) = conn.protocol() else {
            return;
        };
        let messages = match protocol.parse(payload) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(connection_id = %conn.id, "invalid payload: {e}");
                let close = CloseMessage {
                    error: Some("Connection closed with an error.".into()),
                    allow_reconnect: false,
                };
                self.close_connection(conn, Some(format!("protocol error: {e}")), Some(close));
                return;
            }
        };

        for message in messages {
            match message {
                HubMessage::Invocation(invocation) => self.invoke(conn, invocation),
                HubMessage::Ping => {}
                HubMessage::Close(close) => {
                    tracing::debug!(connection_id = %conn.id, "client sent close");
                    self.close_connection(conn, close.error, None);
                    return;
                }
                HubMessage::Completion(c) => {
                    tracing::debug!(connection_id = %conn.id, invocation_id = %c.invocation_id, "ignoring unexpected completion");
                }
                HubMessage::Other { kind } => {
                    tracing::debug!(connection_id = %conn.id, kind, "ignoring unsupported message");
                }
            }
        }
    }

    fn invoke(self: &Arc<Self>, conn: &Arc<Connection>, invocation: InvocationMessage) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            let id = invocation.invocation_id.clone();
            let target = invocation.target.clone();
            let outcome = server.run_handler(&conn, invocation).await;
            match (id, outcome) {
                (Some(id), Ok(value)) => {
                    conn.send_message(&HubMessage::Completion(CompletionMessage::with_result(id, value)));
                }
                (Some(id), Err(error)) => {
                    conn.send_message(&HubMessage::Completion(CompletionMessage::with_error(id, error)));
                }
                (None, Err(error)) => {
                    tracing::warn!(connection_id = %conn.id, %target, "invocation failed: {error}");
                }
                (None, Ok(_)) => {}
            }
        });
    }

    async fn run_handler(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        invocation: InvocationMessage,
    ) -> Result<Value, String> {
        let Some(handler) = self.handlers.get(&invocation.target) else {
            tracing::debug!(connection_id = %conn.id, target = %invocation.target, "unknown hub method");
            return Err(format!("Unknown hub method '{}'", invocation.target));
        };
        if let Some(expected) = handler.arity {
            let actual = invocation.arguments.len();
            if expected != actual {
                return Err(ProtocolError::ArgumentCount { expected, actual }.to_string());
            }
        }

        let ctx = HubContext::new(conn.id.clone(), Arc::clone(self));
        match AssertUnwindSafe(handler.call(ctx, invocation.arguments))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!(connection_id = %conn.id, method = %handler.name, "hub method panicked: {detail}");
                Err(format!(
                    "An unexpected error occurred invoking '{}' on the server. {detail}",
                    handler.name
                ))
            }
        }
    }

    pub(crate) fn connection_established(&self, conn: &Arc<Connection>) {
        tracing::info!(
            connection_id = %conn.id,
            transport = ?conn.transport(),
            protocol = ?conn.protocol(),
            "client connected"
        );
        let callbacks = self.on_connected.read().clone();
        for cb in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| cb(&conn.id))).is_err() {
                tracing::error!(connection_id = %conn.id, "on_connected callback panicked");
            }
        }
    }

    /// Closes a connection once: queues `close` (if any), cancels its
    /// tasks, forgets it and fires the disconnected callbacks.
    pub(crate) fn close_connection(
        &self,
        conn: &Arc<Connection>,
        reason: Option<String>,
        close: Option<CloseMessage>,
    ) {
        if !conn.mark_closed() {
            return;
        }
        if let Some(close) = close {
            if conn.is_handshaken() {
                conn.send_message(&HubMessage::Close(close));
            }
        }
        conn.cancel_token().cancel();
        self.connections.remove(&conn.id);

        if !conn.is_handshaken() {
            tracing::debug!(connection_id = %conn.id, reason = ?reason, "connection dropped before handshake");
            return;
        }
        tracing::info!(connection_id = %conn.id, reason = ?reason, "client disconnected");
        let callbacks = self.on_disconnected.read().clone();
        for cb in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| cb(&conn.id, reason.as_deref()))).is_err() {
                tracing::error!(connection_id = %conn.id, "on_disconnected callback panicked");
            }
        }
    }

    /// A transport attachment ended without the connection being closed.
    ///
    /// Stateful WebSocket connections are detached and kept for the
    /// reconnect window; everything else is closed.
    pub(crate) fn transport_lost(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        epoch: u64,
        reason: Option<String>,
    ) {
        if conn.is_closed() {
            return;
        }
        let resumable = conn.stateful
            && conn.is_handshaken()
            && conn.transport() == Some(TransportKind::WebSockets);
        if !resumable {
            conn.detach(epoch);
            self.close_connection(conn, reason, None);
            return;
        }
        if !conn.detach(epoch) {
            // A newer attachment already took over.
            return;
        }

        tracing::info!(connection_id = %conn.id, reason = ?reason, "transport lost, awaiting reconnect");
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        let window = self.config.reconnect_window;
        tokio::spawn(async move {
            tokio::select! {
                _ = conn.cancel_token().cancelled() => return,
                _ = tokio::time::sleep(window) => {}
            }
            if conn.epoch() == epoch && !conn.is_attached() {
                server.close_connection(&conn, Some("reconnect window elapsed".into()), None);
            }
        });
    }
}

fn validate_endpoint(path: &str) -> Result<(), ServerError> {
    let valid = path.len() > 1
        && path.starts_with('/')
        && !path.ends_with('/')
        && !path.contains(['?', '#', '{', '}', '*'])
        && !path.chars().any(|c| c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(ServerError::Configuration(format!(
            "invalid hub endpoint '{path}'"
        )))
    }
}

/// Hub name used by the relay: the last segment of the endpoint path.
fn hub_name(endpoint: &str) -> &str {
    endpoint.rsplit('/').next().unwrap_or(endpoint)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn server() -> Arc<HubServer> {
        let server = HubServer::new(ServerConfig::default());
        server.register_endpoint("/chat").unwrap();
        server
    }

    #[test]
    fn endpoint_validation() {
        let server = HubServer::new(ServerConfig::default());
        assert!(server.register_endpoint("/chat").is_ok());
        assert!(server.register_endpoint("/hubs/chat").is_ok());
        for bad in ["", "/", "chat", "/chat/", "/ch at", "/{id}"] {
            assert!(
                matches!(server.register_endpoint(bad), Err(ServerError::Configuration(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn hub_name_is_last_segment() {
        assert_eq!(hub_name("/chat"), "chat");
        assert_eq!(hub_name("/hubs/Chat"), "Chat");
    }

    #[tokio::test]
    async fn start_requires_endpoint() {
        let server = HubServer::new(ServerConfig::default());
        assert!(matches!(
            server.start().await,
            Err(ServerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn endpoint_is_frozen_after_start() {
        let server = server();
        let addr = server.start().await.unwrap();
        assert!(addr.port() > 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(
            server.register_endpoint("/other"),
            Err(ServerError::Configuration(_))
        ));
        assert!(matches!(
            server.start().await,
            Err(ServerError::Configuration(_))
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn run_returns_after_shutdown() {
        let server = server();
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.local_addr().is_some());
        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn negotiate_allocates_connection() {
        let server = server();
        let app = server.router("/chat");
        let req = Request::builder()
            .method("POST")
            .uri("/chat/negotiate?negotiateVersion=1&useStatefulReconnect=true")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["negotiateVersion"], 1);
        assert_eq!(parsed["useStatefulReconnect"], true);
        assert_eq!(parsed["availableTransports"].as_array().unwrap().len(), 3);

        let token = parsed["connectionToken"].as_str().unwrap();
        let conn = server.connections().get_by_token(token).unwrap();
        assert!(conn.stateful);
        assert_eq!(server.connection_count(), 0, "not live until handshake");
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let server = server();
        let app = server.router("/chat");
        let req = Request::builder()
            .method("POST")
            .uri("/chat?id=nope")
            .body(Body::from("{}\u{1e}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn relay_mode_negotiate_redirects() {
        let server = HubServer::new(ServerConfig {
            relay_connection_string: Some(
                "Endpoint=https://relay.example.com;AccessKey=k;".into(),
            ),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        });
        server.register_endpoint("/chat").unwrap();
        server.start().await.unwrap();

        let app = server.router("/chat");
        let req = Request::builder()
            .method("POST")
            .uri("/chat/negotiate?negotiateVersion=1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["url"], "https://relay.example.com/client/?hub=chat");
        assert!(parsed["accessToken"].is_string());
        assert!(parsed.get("connectionId").is_none());
        server.shutdown();
    }

    #[tokio::test]
    async fn bad_relay_string_fails_start() {
        let server = HubServer::new(ServerConfig {
            relay_connection_string: Some("Endpoint=https://relay.example.com;".into()),
            ..ServerConfig::default()
        });
        server.register_endpoint("/chat").unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn push_and_group_errors() {
        let server = server();
        assert!(matches!(
            server.add_to_group("missing", "g"),
            Err(ServerError::NotFound(_))
        ));
        assert!(matches!(
            server.disconnect("missing"),
            Err(ServerError::NotFound(_))
        ));
        // No connections: push is a no-op.
        server.push("Receive", ("hello",), Target::All).unwrap();
    }

    #[tokio::test]
    async fn handler_panic_becomes_error() {
        let server = server();
        server
            .on_invoke("Boom", |_ctx, (): ()| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, String>(())
            })
            .unwrap();
        let conn = server.create_connection(false, false);
        let _ = conn.handshake(b"{\"protocol\":\"json\",\"version\":1}\x1e");
        let err = server
            .run_handler(&conn, InvocationMessage::call("1", "boom", vec![]))
            .await
            .unwrap_err();
        assert!(err.contains("kaboom"), "{err}");

        let err = server
            .run_handler(&conn, InvocationMessage::call("2", "Missing", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, "Unknown hub method 'Missing'");

        let err = server
            .run_handler(&conn, InvocationMessage::call("3", "Boom", vec![Value::Null]))
            .await
            .unwrap_err();
        assert_eq!(err, "Invocation provides 1 argument(s) but target expects 0.");
        server.shutdown();
    }

    #[tokio::test]
    async fn callbacks_fire_once_and_survive_panics() {
        use std::sync::atomic::AtomicUsize;

        let server = server();
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connected);
        server.on_connected(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        server.on_connected(|_| panic!("bad callback"));
        let d = Arc::clone(&disconnected);
        server.on_disconnected(move |_, reason| {
            assert_eq!(reason, Some("bye"));
            d.fetch_add(1, Ordering::SeqCst);
        });

        let conn = server.create_connection(false, false);
        server.receive(&conn, b"{\"protocol\":\"json\",\"version\":1}\x1e");
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 1);

        server.close_connection(&conn, Some("bye".into()), None);
        server.close_connection(&conn, Some("again".into()), None);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_deadline_closes_idle_connection() {
        let server = HubServer::new(ServerConfig {
            handshake_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        });
        let conn = server.create_connection(false, false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(conn.is_closed());
        assert!(server.connections().get(&conn.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn client_timeout_closes_silent_connection() {
        let server = HubServer::new(ServerConfig {
            client_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(1),
            ..ServerConfig::default()
        });
        let conn = server.create_connection(false, false);
        conn.attach(TransportKind::LongPolling).unwrap();
        server.receive(&conn, b"{\"protocol\":\"json\",\"version\":1}\x1e");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!conn.is_closed());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(conn.is_closed());
    }

    fn detached_stateful_connection(server: &Arc<HubServer>) -> Arc<Connection> {
        let conn = server.create_connection(true, false);
        let epoch = conn.attach(TransportKind::WebSockets).unwrap();
        assert!(matches!(
            conn.handshake(b"{\"protocol\":\"json\",\"version\":1}\x1e"),
            HandshakeOutcome::Accepted { .. }
        ));
        server.transport_lost(&conn, epoch, Some("socket dropped".into()));
        assert!(!conn.is_attached());
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn detached_connection_outlives_client_timeout() {
        let server = HubServer::new(ServerConfig {
            client_timeout: Duration::from_millis(100),
            reconnect_window: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(1),
            ..ServerConfig::default()
        });
        let conn = detached_stateful_connection(&server);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!conn.is_closed());

        // Reattaching starts a fresh timeout period.
        conn.attach(TransportKind::WebSockets).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_closed());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_window_closes_abandoned_connection() {
        let server = HubServer::new(ServerConfig {
            reconnect_window: Duration::from_secs(10),
            ..ServerConfig::default()
        });
        let conn = detached_stateful_connection(&server);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!conn.is_closed());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(conn.is_closed());
        assert_eq!(server.connection_count(), 0);
    }
}
