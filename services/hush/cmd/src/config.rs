//! Configuration handling for the hush client.
//!
//! Values come from the YAML config file first, then `HUSH_*` environment
//! variables, then command-line flags (applied in `main`).

use anyhow::{bail, Context, Result};
use hush_session::{SessionConfig, DEFAULT_EVENT_LOG_CAPACITY};
use hush_storage::StorageMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Default device address
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8765";

/// Where the operator's name is kept between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferencesMode {
    /// Lost on exit
    Memory,
    /// JSON file on disk
    File,
    /// Redis server
    Redis,
}

impl FromStr for PreferencesMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(PreferencesMode::Memory),
            "file" => Ok(PreferencesMode::File),
            "redis" => Ok(PreferencesMode::Redis),
            other => bail!("unknown preferences mode '{}' (expected memory, file or redis)", other),
        }
    }
}

/// Preference store settings
#[derive(Debug, Clone, PartialEq)]
pub struct PreferencesConfig {
    /// Backend
    pub mode: PreferencesMode,
    /// File backend path
    pub path: PathBuf,
    /// Redis backend URL
    pub redis_url: String,
    /// Redis key prefix
    pub key_prefix: String,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            mode: PreferencesMode::File,
            path: PathBuf::from("hush-preferences.json"),
            redis_url: "redis://127.0.0.1/".to_string(),
            key_prefix: "hush:".to_string(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Device address, `host:port` or `ws://host:port`
    pub endpoint: String,
    /// Name used by `connect` when none is typed
    pub user_name: Option<String>,
    /// Connect attempt limit, disabled when `None`
    pub connect_timeout: Option<Duration>,
    /// Retained event log entries
    pub event_log_capacity: usize,
    /// Preference store
    pub preferences: PreferencesConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            user_name: None,
            connect_timeout: None,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            preferences: PreferencesConfig::default(),
        }
    }
}

/// On-disk layout; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    endpoint: Option<String>,
    user_name: Option<String>,
    connect_timeout: Option<String>,
    event_log_capacity: Option<usize>,
    preferences: Option<FilePreferences>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePreferences {
    mode: Option<String>,
    path: Option<PathBuf>,
    redis_url: Option<String>,
    key_prefix: Option<String>,
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let mut config = Self::default();
        let config_path = config_path.as_ref();

        match std::fs::read_to_string(config_path) {
            Ok(content) => match serde_yaml::from_str::<FileConfig>(&content) {
                Ok(file_config) => {
                    config.apply_file_config(file_config);
                    info!("Loaded configuration from {:?}", config_path);
                }
                Err(e) => warn!("Failed to parse config file {:?}, using defaults: {}", config_path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path),
        }

        config.apply_environment_overrides();

        info!(
            "Final configuration: endpoint={}, preferences={:?}, connect_timeout={:?}",
            config.endpoint, config.preferences.mode, config.connect_timeout
        );
        config
    }

    fn apply_file_config(&mut self, file: FileConfig) {
        if let Some(endpoint) = file.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(name) = file.user_name {
            self.user_name = Some(name);
        }
        if let Some(timeout) = file.connect_timeout {
            match parse_timeout(&timeout) {
                Ok(timeout) => self.connect_timeout = timeout,
                Err(e) => warn!("Ignoring connect_timeout: {:#}", e),
            }
        }
        if let Some(capacity) = file.event_log_capacity {
            self.event_log_capacity = capacity;
        }
        if let Some(prefs) = file.preferences {
            if let Some(mode) = prefs.mode {
                match mode.parse() {
                    Ok(mode) => self.preferences.mode = mode,
                    Err(e) => warn!("Ignoring preferences.mode: {:#}", e),
                }
            }
            if let Some(path) = prefs.path {
                self.preferences.path = path;
            }
            if let Some(url) = prefs.redis_url {
                self.preferences.redis_url = url;
            }
            if let Some(prefix) = prefs.key_prefix {
                self.preferences.key_prefix = prefix;
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("HUSH_ENDPOINT") {
            info!("Endpoint overridden by environment: {}", endpoint);
            self.endpoint = endpoint;
        }

        if let Some(name) = lookup("HUSH_USER_NAME") {
            self.user_name = Some(name);
        }

        if let Some(mode) = lookup("HUSH_PREFERENCES_MODE") {
            match mode.parse() {
                Ok(mode) => {
                    self.preferences.mode = mode;
                    info!("Preferences mode overridden by environment: {:?}", mode);
                }
                Err(e) => warn!("Ignoring HUSH_PREFERENCES_MODE: {:#}", e),
            }
        }

        if let Some(path) = lookup("HUSH_PREFERENCES_PATH") {
            self.preferences.path = PathBuf::from(path);
        }

        if let Some(url) = lookup("HUSH_REDIS_URL") {
            self.preferences.redis_url = url;
        }

        if let Some(timeout) = lookup("HUSH_CONNECT_TIMEOUT") {
            match parse_timeout(&timeout) {
                Ok(timeout) => {
                    self.connect_timeout = timeout;
                    info!("Connect timeout overridden by environment: {:?}", timeout);
                }
                Err(e) => warn!("Ignoring HUSH_CONNECT_TIMEOUT: {:#}", e),
            }
        }
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            event_log_capacity: self.event_log_capacity,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Preference backend derived from this configuration
    pub fn storage_mode(&self) -> StorageMode {
        match self.preferences.mode {
            PreferencesMode::Memory => StorageMode::InMemory,
            PreferencesMode::File => StorageMode::File {
                path: self.preferences.path.clone(),
            },
            PreferencesMode::Redis => StorageMode::Redis {
                url: self.preferences.redis_url.clone(),
                key_prefix: self.preferences.key_prefix.clone(),
            },
        }
    }
}

/// Parse a human duration; `off`, `none` and `0` disable the timeout
pub fn parse_timeout(value: &str) -> Result<Option<Duration>> {
    let value = value.trim();
    match value.to_ascii_lowercase().as_str() {
        "" | "off" | "none" | "0" => Ok(None),
        _ => {
            let timeout = humantime::parse_duration(value)
                .with_context(|| format!("invalid duration '{}'", value))?;
            Ok(Some(timeout).filter(|t| !t.is_zero()))
        }
    }
}
