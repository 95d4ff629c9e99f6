//! Configuration loading and validation.
//!
//! Configuration is resolved in three layers, later layers winning:
//! built-in defaults, then `messaging.toml` (or the file named by
//! `$CUBIZ_MESSAGING_CONFIG`), then environment variable overrides.
//! Secrets never live in the file; the file names the environment
//! variable that holds them (`api_key_env`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::messaging::conversations::DEFAULT_PREVIEW_CHARS;

/// Environment variable that points at an alternate config file.
pub const CONFIG_PATH_VAR: &str = "CUBIZ_MESSAGING_CONFIG";

/// Config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "messaging.toml";

/// Top-level configuration for the messaging subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Message store selection and tuning.
    pub store: StoreConfig,

    /// Conversation list presentation.
    pub conversations: ConversationsConfig,

    /// Log output destinations.
    pub logging: LoggingConfig,
}

/// Which backing store to use and where it lives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the local SQLite database. Defaults to
    /// `~/.cubiz/data/messages.db` when unset.
    pub db_path: Option<PathBuf>,

    /// Remote gateway settings. When present the remote store is
    /// preferred over the local database.
    pub remote: Option<RemoteConfig>,
}

impl StoreConfig {
    /// Database path with the home-directory default applied.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the home
    /// directory cannot be determined.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => default_db_path(),
        }
    }
}

/// Connection settings for the remote message gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Gateway base URL, e.g. `https://gateway.example.com/rest/v1`.
    pub base_url: String,

    /// Environment variable name holding the API key.
    pub api_key_env: String,

    /// Seconds between subscription polls.
    pub poll_interval_secs: u64,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: default_api_key_env(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Conversation list presentation knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationsConfig {
    /// Maximum characters kept in a conversation preview.
    pub preview_max_chars: usize,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            preview_max_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

/// Log output destinations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated log files. Defaults to `~/.cubiz/logs`.
    pub logs_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Logs directory with the home-directory default applied.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home
    /// directory cannot be determined.
    pub fn resolved_logs_dir(&self) -> Result<PathBuf> {
        match &self.logs_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("logs")),
        }
    }
}

// Default value functions for serde

fn default_api_key_env() -> String {
    "CUBIZ_API_KEY".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl MessagingConfig {
    /// Load configuration from disk and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read
    /// or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse messaging config TOML")
    }

    fn load_from_file() -> Result<Self> {
        let path = config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading messaging config");
                Self::from_toml(&contents)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no messaging config file found, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(anyhow::anyhow!(
                "failed to read config at {}: {err}",
                path.display()
            )),
        }
    }

    /// Apply environment variable overrides through an injectable
    /// lookup, so tests can drive them without touching the process
    /// environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(path) = env("CUBIZ_DB_PATH") {
            self.store.db_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env("CUBIZ_REMOTE_URL") {
            let mut remote = self.store.remote.clone().unwrap_or_default();
            remote.base_url = url;
            self.store.remote = Some(remote);
        }
        if let Some(remote) = self.store.remote.as_mut() {
            if let Some(name) = env("CUBIZ_REMOTE_KEY_ENV") {
                remote.api_key_env = name;
            }
            if let Some(value) = env("CUBIZ_POLL_INTERVAL_SECS") {
                match value.parse() {
                    Ok(secs) => remote.poll_interval_secs = secs,
                    Err(_) => tracing::warn!(
                        var = "CUBIZ_POLL_INTERVAL_SECS",
                        value,
                        "ignoring invalid env override"
                    ),
                }
            }
        }
        if let Some(value) = env("CUBIZ_PREVIEW_MAX_CHARS") {
            match value.parse() {
                Ok(chars) => self.conversations.preview_max_chars = chars,
                Err(_) => tracing::warn!(
                    var = "CUBIZ_PREVIEW_MAX_CHARS",
                    value,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(dir) = env("CUBIZ_LOGS_DIR") {
            self.logging.logs_dir = Some(PathBuf::from(dir));
        }
    }
}

/// Resolve the config file path from an injectable environment lookup.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    match env(CONFIG_PATH_VAR) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(CONFIG_FILE),
    }
}

/// Resolve the application data directory (`~/.cubiz`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn data_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".cubiz"))
}

/// Default SQLite database path (`~/.cubiz/data/messages.db`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_db_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("data").join("messages.db"))
}
