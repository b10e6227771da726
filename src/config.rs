//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `FOXY_HOMEBRIDGE_URL`,
//!    `FOXY_HOMEBRIDGE_USERNAME`, `FOXY_HOMEBRIDGE_PASSWORD`, `FOXY_PORT`
//! 2. **Config file** — path via `--config <path>`, `FOXY_CONFIG`, or
//!    `config.json` in CWD. JSON by default, TOML when the path ends in `.toml`
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The JSON file is the one written by the configuration wizard:
//!
//! ```json
//! {
//!   "homebridge": {
//!     "url": "http://192.168.1.10:8581",
//!     "username": "admin",
//!     "password": "secret",
//!     "event_stream": true
//!   },
//!   "port": 2322,
//!   "lightGroups": {
//!     "1": ["0e5f...a1", "9c2d...07"]
//!   },
//!   "logging": { "level": "info" },
//!   "timing": {
//!     "token_refresh_secs": 30,
//!     "warmup_interval_secs": 60,
//!     "warm_stale_secs": 60,
//!     "ready_timeout_ms": 3000,
//!     "request_timeout_ms": 7000,
//!     "connect_timeout_ms": 3000
//!   }
//! }
//! ```
//!
//! Installs that predate the config file kept their settings in the
//! environment (`HOMEBRIDGE_URL`, `HOMEBRIDGE_USERNAME`,
//! `HOMEBRIDGE_PASSWORD`, `PORT`, `HOMEBRIDGE_UUIDS`). When no config file
//! exists those are migrated into a single light group `"1"`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub homebridge: HomebridgeConfig,
    /// Port for the HTTP API (default 2322).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind (default `0.0.0.0`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Group id → ordered accessory unique ids.
    #[serde(default, rename = "lightGroups")]
    pub light_groups: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Upstream Homebridge (config-ui-x) connection settings.
#[derive(Clone, Deserialize, Serialize)]
pub struct HomebridgeConfig {
    /// Base URL of the Homebridge UI, e.g. `http://localhost:8581`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Use the Socket.IO event stream for warm-up and control (default true).
    /// When false every command goes over REST.
    #[serde(default = "default_event_stream")]
    pub event_stream: bool,
}

impl fmt::Debug for HomebridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HomebridgeConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("event_stream", &self.event_stream)
            .finish()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Keepalive and timeout tuning. The defaults match what Homebridge needs in
/// practice; most installs never touch this section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Seconds between unconditional re-logins (default 30).
    #[serde(default = "default_token_refresh_secs")]
    pub token_refresh_secs: u64,
    /// Seconds between passive warm-ups (default 60).
    #[serde(default = "default_warmup_interval_secs")]
    pub warmup_interval_secs: u64,
    /// Age after which the accessory cache counts as cold (default 60).
    #[serde(default = "default_warm_stale_secs")]
    pub warm_stale_secs: u64,
    /// Wait for `accessories-ready-for-control` (default 3000).
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Per-call timeout for REST requests (default 7000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Event-stream connect timeout (default 3000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl TimingConfig {
    pub fn token_refresh(&self) -> Duration {
        Duration::from_secs(self.token_refresh_secs)
    }
    pub fn warmup_interval(&self) -> Duration {
        Duration::from_secs(self.warmup_interval_secs)
    }
    pub fn warm_stale(&self) -> Duration {
        Duration::from_secs(self.warm_stale_secs)
    }
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_port() -> u16 {
    2322
}
fn default_listen() -> String {
    "0.0.0.0".to_string()
}
fn default_event_stream() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_token_refresh_secs() -> u64 {
    30
}
fn default_warmup_interval_secs() -> u64 {
    60
}
fn default_warm_stale_secs() -> u64 {
    60
}
fn default_ready_timeout_ms() -> u64 {
    3000
}
fn default_request_timeout_ms() -> u64 {
    7000
}
fn default_connect_timeout_ms() -> u64 {
    3000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            token_refresh_secs: default_token_refresh_secs(),
            warmup_interval_secs: default_warmup_interval_secs(),
            warm_stale_secs: default_warm_stale_secs(),
            ready_timeout_ms: default_ready_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Startup configuration failures. These are the only fatal errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file is missing ({0}). Please run the configuration script.")]
    Missing(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where a loaded config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// Built from legacy environment variables and written to this path.
    MigratedEnv(PathBuf),
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// `path` wins over `FOXY_CONFIG`, which wins over `./config.json`. If
    /// none of them exists but the legacy variables are set, a config is
    /// built from them and saved to the chosen path.
    pub fn load(path: Option<&Path>) -> Result<(Self, ConfigSource), ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FOXY_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let (mut config, source) = if path.exists() {
            (Self::from_file(&path)?, ConfigSource::File(path))
        } else if let Some(migrated) = Self::from_legacy_env(|k| std::env::var(k).ok()) {
            migrated.save(&path)?;
            (migrated, ConfigSource::MigratedEnv(path))
        } else {
            return Err(ConfigError::Missing(path));
        };

        config.apply_env_overrides(|k| std::env::var(k).ok());
        config.validate()?;
        Ok((config, source))
    }

    /// Parse a config file; format is picked from the extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_toml = path.extension().is_some_and(|e| e == "toml");
        let parsed = if is_toml {
            toml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Build a config from the pre-config-file environment variables.
    /// Returns `None` when `HOMEBRIDGE_URL` is not set.
    pub fn from_legacy_env(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let url = var("HOMEBRIDGE_URL")?;
        let uuids: Vec<String> = var("HOMEBRIDGE_UUIDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        let mut light_groups = IndexMap::new();
        light_groups.insert("1".to_string(), uuids);

        Some(Self {
            homebridge: HomebridgeConfig {
                url,
                username: var("HOMEBRIDGE_USERNAME").unwrap_or_default(),
                password: var("HOMEBRIDGE_PASSWORD").unwrap_or_default(),
                event_stream: default_event_stream(),
            },
            port: var("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(default_port),
            listen: default_listen(),
            light_groups,
            logging: LoggingConfig::default(),
            timing: TimingConfig::default(),
        })
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, body).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("FOXY_HOMEBRIDGE_URL") {
            self.homebridge.url = url;
        }
        if let Some(user) = var("FOXY_HOMEBRIDGE_USERNAME") {
            self.homebridge.username = user;
        }
        if let Some(pass) = var("FOXY_HOMEBRIDGE_PASSWORD") {
            self.homebridge.password = pass;
        }
        if let Some(port) = var("FOXY_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.homebridge.url.trim().is_empty() {
            return Err(ConfigError::Invalid("homebridge.url is empty".into()));
        }
        reqwest::Url::parse(&self.homebridge.url).map_err(|e| {
            ConfigError::Invalid(format!("homebridge.url {:?}: {e}", self.homebridge.url))
        })?;
        if self.homebridge.username.is_empty() {
            return Err(ConfigError::Invalid("homebridge.username is empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        for (group, devices) in &self.light_groups {
            if group.is_empty() {
                return Err(ConfigError::Invalid("light group with empty id".into()));
            }
            if devices.iter().any(String::is_empty) {
                return Err(ConfigError::Invalid(format!(
                    "light group {group} contains an empty UUID"
                )));
            }
        }
        let t = &self.timing;
        for (name, value) in [
            ("token_refresh_secs", t.token_refresh_secs),
            ("warmup_interval_secs", t.warmup_interval_secs),
            ("warm_stale_secs", t.warm_stale_secs),
            ("ready_timeout_ms", t.ready_timeout_ms),
            ("request_timeout_ms", t.request_timeout_ms),
            ("connect_timeout_ms", t.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("timing.{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Socket address string for the HTTP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}
