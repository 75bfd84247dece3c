//! Public types for the hub client.

use std::time::Duration;

use hubline_protocol::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_SERVER_TIMEOUT,
};
use hubline_protocol::{HubProtocol, TransportKind};
use url::Url;

use crate::ClientError;
use crate::connection::HubConnection;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Negotiation, transport connect or handshake in progress.
    Connecting,
    /// Handshake completed.
    Connected,
    /// Transport lost, retrying with the same connection token.
    Reconnecting,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a valid transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Connecting | Connected | Reconnecting, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

/// Events published to [`HubConnection::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Attempts before giving up and going to `Disconnected`.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = jitter_offset(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos(),
        );
        let with_jitter = (capped + jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Maps a sub-second nanosecond count onto `[-1.0, 1.0)`.
fn jitter_offset(nanos: u32) -> f64 {
    f64::from(nanos.min(999_999_999)) / 1_000_000_000.0 * 2.0 - 1.0
}

/// Everything a [`HubConnection`] needs to reach its hub.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Hub endpoint, e.g. `http://localhost:5000/chat`.
    pub url: String,
    /// Connect straight to the WebSocket endpoint without negotiating.
    pub skip_negotiation: bool,
    /// Transports to try, in preference order.
    pub transports: Vec<TransportKind>,
    pub protocol: HubProtocol,
    /// Ask the server to keep the connection across transport drops.
    pub stateful_reconnect: bool,
    pub keep_alive_interval: Duration,
    /// Bounds negotiation, transport connect and handshake together.
    pub handshake_timeout: Duration,
    /// Transport is considered lost when nothing arrives for this long.
    /// Also bounds each invocation.
    pub server_timeout: Duration,
    /// Sent as a bearer token on every request.
    pub access_token: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            skip_negotiation: false,
            transports: TransportKind::ALL.to_vec(),
            protocol: HubProtocol::Json,
            stateful_reconnect: false,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            access_token: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Checks the options and returns the parsed hub url.
    pub(crate) fn validate(&self) -> Result<Url, ClientError> {
        let url = Url::parse(&self.url).map_err(|e| {
            ClientError::Configuration(format!("invalid hub url '{}': {e}", self.url))
        })?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(ClientError::Configuration(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        if self.transports.is_empty() {
            return Err(ClientError::Configuration(
                "at least one transport must be enabled".into(),
            ));
        }
        if self.keep_alive_interval.is_zero() || self.server_timeout.is_zero() {
            return Err(ClientError::Configuration(
                "keep-alive interval and server timeout must be non-zero".into(),
            ));
        }
        if self.server_timeout <= self.keep_alive_interval {
            tracing::warn!(
                "server timeout {:?} is not longer than the keep-alive interval {:?}",
                self.server_timeout,
                self.keep_alive_interval
            );
        }
        Ok(url)
    }
}

/// Fluent construction of a [`HubConnection`].
#[derive(Debug, Clone)]
pub struct HubConnectionBuilder {
    options: ConnectionOptions,
}

impl HubConnectionBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            options: ConnectionOptions::new(url),
        }
    }

    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.options.skip_negotiation = skip;
        self
    }

    /// Restricts the client to a single transport.
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.options.transports = vec![kind];
        self
    }

    pub fn with_transports(mut self, kinds: Vec<TransportKind>) -> Self {
        self.options.transports = kinds;
        self
    }

    pub fn with_protocol(mut self, protocol: HubProtocol) -> Self {
        self.options.protocol = protocol;
        self
    }

    pub fn with_stateful_reconnect(mut self, enabled: bool) -> Self {
        self.options.stateful_reconnect = enabled;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.options.keep_alive_interval = interval;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.options.server_timeout = timeout;
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.options.access_token = Some(token.into());
        self
    }

    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.options.reconnect = config;
        self
    }

    pub fn build(self) -> Result<HubConnection, ClientError> {
        HubConnection::new(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Disconnected));
        assert!(Connecting.can_transition_to(Disconnected));
    }

    #[test]
    fn refused_transitions() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Disconnected.can_transition_to(Disconnected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(!Reconnecting.can_transition_to(Connecting));
    }

    #[test]
    fn reconnect_config_delay_backoff() {
        let config = ReconnectConfig::default();
        // Base delays: 250ms, 500ms, 1s, 2s, 4s, 8s, 15s (capped), 15s...
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let secs = config.delay_for_attempt((i + 1) as u32).as_secs_f64();
            let lo = base * 0.74;
            let hi = base * 1.26;
            assert!(
                secs >= lo && secs <= hi,
                "attempt {}: {secs:.3}s not in [{lo:.3}, {hi:.3}]",
                i + 1
            );
        }
    }

    #[test]
    fn jitter_spans_both_directions() {
        assert_eq!(jitter_offset(0), -1.0);
        assert_eq!(jitter_offset(500_000_000), 0.0);
        let top = jitter_offset(999_999_999);
        assert!(top > 0.99 && top < 1.0);
    }

    #[test]
    fn builder_applies_options() {
        let conn = HubConnectionBuilder::new("http://localhost:5000/chat")
            .with_transport(TransportKind::LongPolling)
            .with_protocol(HubProtocol::MessagePack)
            .handshake_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let options = conn.options();
        assert_eq!(options.url, "http://localhost:5000/chat");
        assert_eq!(options.transports, vec![TransportKind::LongPolling]);
        assert_eq!(options.protocol, HubProtocol::MessagePack);
        assert_eq!(options.handshake_timeout, Duration::from_secs(1));
        assert_eq!(options.server_timeout, DEFAULT_SERVER_TIMEOUT);
    }

    #[test]
    fn builder_rejects_bad_urls() {
        let err = HubConnectionBuilder::new("not a url").build().unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
        let err = HubConnectionBuilder::new("ftp://host/chat").build().unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
        let err = HubConnectionBuilder::new("http://host/chat")
            .with_transports(Vec::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }
}
