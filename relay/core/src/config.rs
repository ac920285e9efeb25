//! Relay Configuration
//!
//! Settings are layered, later layers overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. TOML file (`$XDG_CONFIG_HOME/chat-relay/relay.toml` unless a path is given)
//! 3. Environment variables
//! 4. CLI flags (applied by the daemon)
//!
//! ```toml
//! scheme = "wss"
//! host = "chat.aibox365.cn"
//! heartbeat_interval_ms = 5000
//! request_timeout_ms = 30000
//! fail_pending_on_close = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::HeartbeatConfig;

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path:?}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Relay settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Socket scheme, `ws` or `wss`
    pub scheme: String,
    /// Chat service host (optionally `host:port`)
    pub host: String,
    /// Login probe endpoint
    pub session_url: String,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// How long a completion waits for a terminal frame, in milliseconds
    pub request_timeout_ms: u64,
    /// Socket handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Capacity of the stream broadcast channel
    pub broadcast_capacity: usize,
    /// Bridge socket path (None = default runtime path)
    pub socket_path: Option<PathBuf>,
    /// Fail the pending request immediately when its socket closes
    ///
    /// When false the request waits out its timeout instead.
    pub fail_pending_on_close: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            scheme: "wss".to_string(),
            host: "chat.aibox365.cn".to_string(),
            session_url: "https://chat.aibox365.cn/api/user/session".to_string(),
            heartbeat_interval_ms: 5_000,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            broadcast_capacity: 1024,
            socket_path: None,
            fail_pending_on_close: true,
        }
    }
}

impl RelayConfig {
    /// Default config file location
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chat-relay").join("relay.toml"))
    }

    /// Load defaults, then the config file, then the environment
    ///
    /// An explicit `path` must exist; the default path is optional.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or a
    /// resulting value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = ?path, "Loaded relay config");
        Ok(config)
    }

    /// Parse TOML text; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from environment variables
    ///
    /// Environment variables:
    /// - `RELAY_SCHEME`: "ws" or "wss"
    /// - `RELAY_HOST`: Chat service host
    /// - `RELAY_SESSION_URL`: Login probe endpoint
    /// - `RELAY_HEARTBEAT_INTERVAL`: Heartbeat interval in ms
    /// - `RELAY_REQUEST_TIMEOUT`: Request timeout in ms
    /// - `RELAY_CONNECT_TIMEOUT`: Handshake timeout in ms
    /// - `RELAY_SOCKET`: Bridge socket path
    /// - `RELAY_FAIL_ON_CLOSE`: "0" or "false" to wait out the timeout on close
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RELAY_SCHEME") {
            self.scheme = v;
        }
        if let Some(v) = lookup("RELAY_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("RELAY_SESSION_URL") {
            self.session_url = v;
        }
        self.heartbeat_interval_ms = lookup("RELAY_HEARTBEAT_INTERVAL")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.heartbeat_interval_ms);
        self.request_timeout_ms = lookup("RELAY_REQUEST_TIMEOUT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.request_timeout_ms);
        self.connect_timeout_ms = lookup("RELAY_CONNECT_TIMEOUT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.connect_timeout_ms);
        if let Some(v) = lookup("RELAY_SOCKET") {
            self.socket_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RELAY_FAIL_ON_CLOSE") {
            self.fail_pending_on_close = v != "0" && v.to_lowercase() != "false";
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheme != "ws" && self.scheme != "wss" {
            return Err(ConfigError::Invalid(format!(
                "scheme must be ws or wss, got {:?}",
                self.scheme
            )));
        }
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.heartbeat_interval_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval and request timeout must be positive".to_string(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broadcast capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Heartbeat settings
    #[must_use]
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::default().with_interval(Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Handshake timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Bridge socket path, falling back to the runtime default
    #[cfg(unix)]
    #[must_use]
    pub fn bridge_socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

/// Get the default bridge socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/chat-relay-$UID/
#[cfg(unix)]
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("chat-relay")
            .join("relay.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/chat-relay-{uid}/relay.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.scheme, "wss");
        assert_eq!(config.heartbeat().interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.fail_pending_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml_str("host = \"localhost:9000\"\nscheme = \"ws\"\n").unwrap();
        assert_eq!(config.host, "localhost:9000");
        assert_eq!(config.scheme, "ws");
        assert_eq!(config.request_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "request_timeout_ms = 1500\nfail_pending_on_close = false").unwrap();

        let config = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert!(!config.fail_pending_on_close);
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = RelayConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("RELAY_HOST", "relay.test"),
            ("RELAY_HEARTBEAT_INTERVAL", "250"),
            ("RELAY_REQUEST_TIMEOUT", "not-a-number"),
            ("RELAY_FAIL_ON_CLOSE", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.host, "relay.test");
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert!(!config.fail_pending_on_close);
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let config = RelayConfig {
            scheme: "http".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path.to_string_lossy().ends_with("relay.sock"));
    }
}
