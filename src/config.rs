//! Persistent configuration model and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default media receiver application id.
pub const DEFAULT_APP_ID: &str = "CC1AD845";

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Receiver control-plane settings.
    pub cast: CastConfig,
    #[serde(default)]
    /// Log output preferences.
    pub logging: LoggingConfig,
}

/// Receiver control-plane settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CastConfig {
    /// Receiver application launched and driven by the client.
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Source id stamped on every outbound message.
    #[serde(default = "default_sender_id")]
    pub sender_id: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Silence tolerated before probing the receiver.
    #[serde(default = "default_ping_wait_ms")]
    pub ping_wait_ms: u64,
    /// Time allowed for each probe to be answered.
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,
    #[serde(default = "default_pong_retries")]
    pub pong_retries: u8,
    /// Lead applied to seek targets to absorb the request round trip.
    #[serde(default = "default_seek_forward_offset_ms")]
    pub seek_forward_offset_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Launch attempts allowed per authenticated connection.
    #[serde(default = "default_launch_retries")]
    pub launch_retries: u8,
    #[serde(default = "default_true")]
    pub stop_app_on_disconnect: bool,
    /// Receivers present self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

/// Log output preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            sender_id: default_sender_id(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_wait_ms: default_ping_wait_ms(),
            pong_wait_ms: default_pong_wait_ms(),
            pong_retries: default_pong_retries(),
            seek_forward_offset_ms: default_seek_forward_offset_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            launch_retries: default_launch_retries(),
            stop_app_on_disconnect: true,
            accept_invalid_certs: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CastConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_wait(&self) -> Duration {
        Duration::from_millis(self.ping_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn seek_forward_offset(&self) -> Duration {
        Duration::from_millis(self.seek_forward_offset_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_app_id() -> String {
    DEFAULT_APP_ID.to_string()
}

fn default_sender_id() -> String {
    "sender-castctl".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    6_000
}

fn default_ping_wait_ms() -> u64 {
    6_000
}

fn default_pong_wait_ms() -> u64 {
    500
}

fn default_pong_retries() -> u8 {
    2
}

fn default_seek_forward_offset_ms() -> u64 {
    1_000
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_launch_retries() -> u8 {
    3
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// Clamps values that would make the control loop spin or stall.
pub fn sanitize_config(mut config: Config) -> Config {
    let cast = &mut config.cast;
    if cast.app_id.trim().is_empty() {
        cast.app_id = default_app_id();
    }
    if cast.sender_id.trim().is_empty() {
        cast.sender_id = default_sender_id();
    }
    cast.connect_timeout_ms = cast.connect_timeout_ms.clamp(500, 60_000);
    cast.ping_wait_ms = cast.ping_wait_ms.clamp(1_000, 60_000);
    cast.pong_wait_ms = cast.pong_wait_ms.clamp(100, 10_000);
    cast.pong_retries = cast.pong_retries.max(1);
    cast.seek_forward_offset_ms = cast.seek_forward_offset_ms.min(10_000);
    cast.max_payload_bytes = cast.max_payload_bytes.clamp(4 * 1024, 1024 * 1024);
    config
}

/// Location of `config.toml` under the platform config directory.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(config_dir.join("castctl").join("config.toml"))
}

/// Reads the config file, writing defaults first when it does not exist yet.
///
/// The flag is true when the defaults were just written. Callers log it,
/// since this usually runs before the logger is configured.
pub fn load_or_create(path: &Path) -> Result<(Config, bool), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    let created = !path.exists();
    if created {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, toml::to_string(&Config::default())?).map_err(io_err)?;
    }
    let content = std::fs::read_to_string(path).map_err(io_err)?;
    let config = toml::from_str::<Config>(&content)?;
    Ok((sanitize_config(config), created))
}
