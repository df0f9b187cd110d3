//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::outgoing::ReconnectConfig;

/// Default listen address for `docsync serve`.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:1323";

/// Default WebSocket path.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Default directory served on non-WebSocket paths (the page build output).
pub const DEFAULT_STATIC_DIR: &str = "public";

/// Default server URL for `docsync client`.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:1323/ws";

/// Main configuration, read from `config.json` in the config directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Only upgrade requests for this path
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Persist documents here (in-memory if unset)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Serve files from here on every other path (404 if unset)
    #[serde(default = "default_static_dir")]
    pub static_dir: Option<PathBuf>,

    /// Upgrade and `join` must each arrive within this
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_ws_path(),
            data_dir: None,
            static_dir: default_static_dir(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Sync server URL
    #[serde(default = "default_server_url")]
    pub server: String,

    /// Persist documents here (in-memory if unset)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server_url(),
            data_dir: None,
        }
    }
}

/// Client reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Give up after this many attempts (unlimited if unset)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
            max_attempts: settings.max_attempts,
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_ws_path() -> String {
    DEFAULT_WS_PATH.to_string()
}

fn default_static_dir() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_STATIC_DIR))
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Config {
    /// Load configuration from the config directory.
    ///
    /// Writes the defaults to `config.json` when the file does not exist.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// Load from `config_dir` if given, else use defaults.
    pub fn load_or_default(config_dir: Option<&Path>) -> Result<Self> {
        match config_dir {
            Some(dir) => Self::load(dir),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:1323");
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.server.static_dir, Some(PathBuf::from("public")));
        assert_eq!(config.server.handshake_timeout_ms, 5000);
        assert_eq!(config.client.server, "ws://localhost:1323/ws");

        let reconnect = ReconnectConfig::from(&config.reconnect);
        assert_eq!(reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(reconnect.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_load_writes_default() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("docsync");

        let config = Config::load(&nested).unwrap();

        assert_eq!(config, Config::default());
        assert!(nested.join("config.json").is_file());
        assert_eq!(Config::load(&nested).unwrap(), config);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"server":{"listen":"127.0.0.1:9000"},"reconnect":{"maxDelayMs":5}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.client, ClientConfig::default());
        // Unknown keys are ignored
        assert_eq!(config.reconnect, ReconnectSettings::default());
    }

    #[test]
    fn test_null_static_dir_disables_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"server":{"static_dir":null}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.server.static_dir, None);
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), "{not json").unwrap();

        let err = Config::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse"));
    }
}
