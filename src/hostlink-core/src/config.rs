use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            supervisor: SupervisorConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

/// Where and how verbosely the binaries log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    /// Rotated log files kept in the log directory.
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Mirror log records to stderr.
    #[serde(default)]
    pub console: bool,
    /// File name stem of the rolling log. Defaults to `hostlink.log`.
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            max_log_files: default_max_log_files(),
            console: false,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning for the plugin connection supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Upper bound on the IPC handshake wait.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a sent envelope waits for its reply before it is logged as a timeout.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Connection attempts made by `apply` and by `send` on a suspended plugin.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Base delay between reconnect attempts. Zero retries back to back.
    #[serde(default)]
    pub retry_backoff_ms: u64,
    /// Random extra delay added on top of the backoff.
    #[serde(default)]
    pub retry_jitter_ms: u64,
    #[serde(default = "default_notification_workers")]
    pub notification_workers: usize,
    /// Pending notifications per worker before a state change waits for room.
    #[serde(default = "default_notification_queue_capacity")]
    pub notification_queue_capacity: usize,
    /// Newest communication-history entries retained per plugin.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Enabled flag for plugins that have no persisted setting yet.
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
    #[serde(default = "default_service_domain")]
    pub service_domain: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            retry_backoff_ms: 0,
            retry_jitter_ms: 0,
            notification_workers: default_notification_workers(),
            notification_queue_capacity: default_notification_queue_capacity(),
            history_capacity: default_history_capacity(),
            default_enabled: default_enabled(),
            service_domain: default_service_domain(),
        }
    }
}

impl SupervisorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Directory holding plugin manifests. Defaults to `<data dir>/plugins`.
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,
    /// Manifests beyond this count make discovery fail with "too many entries".
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            plugins_dir: None,
            max_entries: default_max_entries(),
        }
    }
}

impl CatalogConfig {
    pub fn resolve_plugins_dir(&self, dirs: &AppDirs) -> PathBuf {
        self.plugins_dir
            .clone()
            .unwrap_or_else(|| dirs.plugins_dir())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("supervisor.{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}

impl Config {
    /// Reads `config.toml` from the config directory. A missing file yields the defaults.
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Self::parse(&contents, path)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, PathBuf::new())
    }

    fn parse(contents: &str, path: PathBuf) -> Result<Self, ConfigError> {
        let config: Config = match toml::from_str(contents) {
            Ok(config) => config,
            Err(source) => return Err(ConfigError::Parse { path, source }),
        };
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        let supervisor = &self.supervisor;
        let required = [
            ("max_connect_attempts", u64::from(supervisor.max_connect_attempts)),
            ("notification_workers", supervisor.notification_workers as u64),
            (
                "notification_queue_capacity",
                supervisor.notification_queue_capacity as u64,
            ),
            ("connect_timeout_ms", supervisor.connect_timeout_ms),
        ];
        match required.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ValidationError::ZeroValue { field: *field }),
            None => Ok(()),
        }
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_max_log_files() -> usize {
    7
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_max_connect_attempts() -> u32 {
    5
}

fn default_notification_workers() -> usize {
    2
}

fn default_notification_queue_capacity() -> usize {
    1024
}

fn default_history_capacity() -> usize {
    256
}

fn default_enabled() -> bool {
    true
}

fn default_service_domain() -> String {
    "localhost.hostlink".to_string()
}

fn default_max_entries() -> usize {
    512
}
