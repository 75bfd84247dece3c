//! Server configuration management.
//!
//! Configuration is stored as TOML at `~/.config/hubline/server.toml`
//! unless a path is given on the command line. Durations are in
//! milliseconds.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hubline_protocol::TransportKind;
use hubline_protocol::constants::{
    DEFAULT_CLIENT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_LONG_POLL_TIMEOUT, DEFAULT_RECONNECT_WINDOW,
};
use hubline_server::{RELAY_CONNECTION_STRING_ENV, ServerConfig};
use serde::{Deserialize, Serialize};

/// Chat server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: IpAddr,
    /// Listen port (0 = auto-assign).
    pub port: u16,
    /// Hub route, e.g. `/chat`.
    pub endpoint: String,
    pub keep_alive_interval_ms: u64,
    pub client_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub long_poll_timeout_ms: u64,
    pub reconnect_window_ms: u64,
    pub transports: Vec<TransportKind>,
    pub allow_stateful_reconnect: bool,
    /// `Endpoint=...;AccessKey=...;`; falls back to the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_connection_string: Option<String>,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            bind_address: server.bind_address,
            port: 5000,
            endpoint: "/chat".into(),
            keep_alive_interval_ms: millis(DEFAULT_KEEP_ALIVE_INTERVAL),
            client_timeout_ms: millis(DEFAULT_CLIENT_TIMEOUT),
            handshake_timeout_ms: millis(DEFAULT_HANDSHAKE_TIMEOUT),
            long_poll_timeout_ms: millis(DEFAULT_LONG_POLL_TIMEOUT),
            reconnect_window_ms: millis(DEFAULT_RECONNECT_WINDOW),
            transports: TransportKind::ALL.to_vec(),
            allow_stateful_reconnect: server.allow_stateful_reconnect,
            relay_connection_string: None,
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// it with defaults if missing.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path,
            None => config_path(),
        };
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;

        // May hold a relay access key.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Builds the library config, taking the relay connection string from
    /// the environment when the file has none.
    pub fn server_config(&self) -> ServerConfig {
        let relay_connection_string = self
            .relay_connection_string
            .clone()
            .or_else(|| std::env::var(RELAY_CONNECTION_STRING_ENV).ok())
            .filter(|s| !s.trim().is_empty());
        ServerConfig {
            bind_address: self.bind_address,
            port: self.port,
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            client_timeout: Duration::from_millis(self.client_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            long_poll_timeout: Duration::from_millis(self.long_poll_timeout_ms),
            reconnect_window: Duration::from_millis(self.reconnect_window_ms),
            transports: self.transports.clone(),
            allow_stateful_reconnect: self.allow_stateful_reconnect,
            relay_connection_string,
        }
    }
}

/// `~/.config/hubline/server.toml` on Linux, `%APPDATA%/hubline/server.toml`
/// on Windows.
fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("hubline").join("server.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("hubline")
            .join("server.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_library() {
        let config = Config::default();
        let server = config.server_config();
        assert_eq!(server.keep_alive_interval, Duration::from_secs(15));
        assert_eq!(server.client_timeout, Duration::from_secs(30));
        assert_eq!(server.long_poll_timeout, Duration::from_secs(90));
        assert_eq!(server.transports, TransportKind::ALL.to_vec());
        assert_eq!(config.endpoint, "/chat");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            port = 6000
            keep_alive_interval_ms = 500
            transports = ["socket", "polling"]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(
            config.server_config().keep_alive_interval,
            Duration::from_millis(500)
        );
        assert_eq!(
            config.transports,
            vec![TransportKind::WebSockets, TransportKind::LongPolling]
        );
        assert_eq!(config.endpoint, "/chat");
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("server.toml");

        let config = Config::load(Some(path.clone())).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load(Some(path)).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn file_relay_string_wins_over_environment() {
        let config = Config {
            relay_connection_string: Some("Endpoint=https://relay.test;AccessKey=k;".into()),
            ..Config::default()
        };
        assert_eq!(
            config.server_config().relay_connection_string.as_deref(),
            Some("Endpoint=https://relay.test;AccessKey=k;")
        );
    }

    #[test]
    fn config_path_is_under_hubline() {
        assert!(config_path().to_string_lossy().contains("hubline"));
    }
}
