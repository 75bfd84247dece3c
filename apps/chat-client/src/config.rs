//! Client configuration management.
//!
//! Configuration is stored as TOML at `~/.config/hubline/client.toml`
//! unless a path is given on the command line. Durations are in
//! milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hubline_client::{ConnectionOptions, HubProtocol, ReconnectConfig, TransportKind};
use hubline_protocol::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_SERVER_TIMEOUT,
};
use serde::{Deserialize, Serialize};

/// Chat client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hub url, e.g. `http://localhost:5000/chat`.
    pub url: String,
    /// Text sent with `Hi` and `Broadcast`.
    pub message: String,
    /// `json` or `messagepack`.
    pub protocol: String,
    pub transports: Vec<TransportKind>,
    pub skip_negotiation: bool,
    pub stateful_reconnect: bool,
    pub keep_alive_interval_ms: u64,
    pub server_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        let reconnect = ReconnectConfig::default();
        Self {
            url: "http://localhost:5000/chat".into(),
            message: "Hello".into(),
            protocol: HubProtocol::Json.name().into(),
            transports: TransportKind::ALL.to_vec(),
            skip_negotiation: false,
            stateful_reconnect: false,
            keep_alive_interval_ms: millis(DEFAULT_KEEP_ALIVE_INTERVAL),
            server_timeout_ms: millis(DEFAULT_SERVER_TIMEOUT),
            handshake_timeout_ms: millis(DEFAULT_HANDSHAKE_TIMEOUT),
            access_token: None,
            reconnect_initial_delay_ms: millis(reconnect.initial_delay),
            reconnect_max_delay_ms: millis(reconnect.max_delay),
            reconnect_max_attempts: reconnect.max_attempts,
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// it with defaults if missing.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(config_path);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn connection_options(&self) -> anyhow::Result<ConnectionOptions> {
        let protocol = HubProtocol::from_name(&self.protocol)
            .ok_or_else(|| anyhow::anyhow!("unknown protocol '{}'", self.protocol))?;
        let mut options = ConnectionOptions::new(self.url.clone());
        options.protocol = protocol;
        options.transports = self.transports.clone();
        options.skip_negotiation = self.skip_negotiation;
        options.stateful_reconnect = self.stateful_reconnect;
        options.keep_alive_interval = Duration::from_millis(self.keep_alive_interval_ms);
        options.server_timeout = Duration::from_millis(self.server_timeout_ms);
        options.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        options.access_token = self.access_token.clone();
        options.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
            ..ReconnectConfig::default()
        };
        Ok(options)
    }
}

fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("hubline").join("client.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("hubline")
            .join("client.toml")
    }
}
