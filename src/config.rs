//! Configuration.
//!
//! Loaded from a TOML file. Every section and field is optional and falls
//! back to the defaults below; unknown fields are rejected.
//!
//! ```toml
//! [scheduler]
//! processors = 4
//! io_worker = "event"
//!
//! [h2]
//! max_concurrent_streams = 100
//! initial_window_size = 1048576
//!
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [server]
//! listen = "0.0.0.0:8443"
//! ```

use crate::http::h2::settings::{Http2Settings, SettingsBuilder};
use crate::http::h2::SessionConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Scheduler threads
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// HTTP/2 settings advertised to clients
    #[serde(default)]
    pub h2: H2Config,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Listener
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.h2.settings()?;
        if self.server.backlog == 0 {
            return Err(ConfigError::Invalid("server.backlog must be > 0".into()));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// Where suspended I/O waits are parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IoWorkerKind {
    /// Pool of threads polling one source at a time
    Naive,
    /// Readiness multiplexing through the OS notification mechanism
    #[default]
    Event,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Processor threads (default: available parallelism)
    pub processors: Option<usize>,

    /// I/O worker threads (default: 1)
    pub io_workers: Option<usize>,

    /// I/O worker variant: "naive" or "event"
    #[serde(default)]
    pub io_worker: IoWorkerKind,

    /// Timer worker threads
    #[serde(default = "default_timer_workers")]
    pub timer_workers: usize,

    /// Longest single poll of an I/O worker, in milliseconds
    #[serde(default = "default_io_tick_ms")]
    pub io_tick_ms: u64,

    /// Consecutive `Continue` steps before a task goes to the back of the queue
    #[serde(default = "default_continue_budget")]
    pub continue_budget: u32,

    /// How long shutdown waits for live tasks, in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_timer_workers() -> usize {
    1
}

fn default_io_tick_ms() -> u64 {
    10
}

fn default_continue_budget() -> u32 {
    64
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processors: None,
            io_workers: None,
            io_worker: IoWorkerKind::default(),
            timer_workers: default_timer_workers(),
            io_tick_ms: default_io_tick_ms(),
            continue_budget: default_continue_budget(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Get the number of processor threads.
    pub fn processors(&self) -> usize {
        self.processors
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }

    /// Get the number of I/O worker threads.
    pub fn io_workers(&self) -> usize {
        self.io_workers.unwrap_or(1)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processors == Some(0) {
            return Err(ConfigError::Invalid("scheduler.processors must be > 0".into()));
        }
        if self.io_workers == Some(0) {
            return Err(ConfigError::Invalid("scheduler.io_workers must be > 0".into()));
        }
        if self.io_tick_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.io_tick_ms must be > 0".into()));
        }
        if self.continue_budget == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.continue_budget must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP/2 configuration.
///
/// Settings left at their RFC 7540 initial value are not sent.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct H2Config {
    /// SETTINGS_HEADER_TABLE_SIZE
    #[serde(default = "H2Config::default_header_table_size")]
    pub header_table_size: u32,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (unset = unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// SETTINGS_INITIAL_WINDOW_SIZE
    #[serde(default = "H2Config::default_initial_window_size")]
    pub initial_window_size: u32,

    /// SETTINGS_MAX_FRAME_SIZE; larger inbound frames are a connection error
    #[serde(default = "H2Config::default_max_frame_size")]
    pub max_frame_size: u32,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (unset = unlimited)
    pub max_header_list_size: Option<u32>,

    /// Expect the client connection preface
    #[serde(default = "H2Config::default_require_preface")]
    pub require_preface: bool,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            header_table_size: Self::default_header_table_size(),
            max_concurrent_streams: None,
            initial_window_size: Self::default_initial_window_size(),
            max_frame_size: Self::default_max_frame_size(),
            max_header_list_size: None,
            require_preface: Self::default_require_preface(),
        }
    }
}

impl H2Config {
    fn default_header_table_size() -> u32 {
        Http2Settings::DEFAULT.header_table_size()
    }

    fn default_initial_window_size() -> u32 {
        Http2Settings::DEFAULT.initial_window_size()
    }

    fn default_max_frame_size() -> u32 {
        Http2Settings::DEFAULT.max_frame_size()
    }

    fn default_require_preface() -> bool {
        true
    }

    /// Settings advertised to clients
    pub fn settings(&self) -> Result<Http2Settings, ConfigError> {
        let mut builder = SettingsBuilder::new()
            .header_table_size(self.header_table_size)
            .initial_window_size(self.initial_window_size)
            .max_frame_size(self.max_frame_size);
        if let Some(max) = self.max_concurrent_streams {
            builder = builder.max_concurrent_streams(max);
        }
        if let Some(max) = self.max_header_list_size {
            builder = builder.max_header_list_size(max);
        }
        builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("h2: {}", e)))
    }

    /// Per-connection session configuration
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            local_settings: self.settings()?,
            require_preface: self.require_preface,
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human readable
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "h2sched::http=debug"
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps
    #[serde(default = "LoggingConfig::default_true")]
    pub timestamps: bool,

    /// Include the event target
    #[serde(default = "LoggingConfig::default_true")]
    pub target: bool,

    /// Include thread names
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_true() -> bool {
        true
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "ServerConfig::default_listen")]
    pub listen: SocketAddr,

    /// Listen backlog
    #[serde(default = "ServerConfig::default_backlog")]
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            backlog: Self::default_backlog(),
        }
    }
}

impl ServerConfig {
    fn default_listen() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 8080))
    }

    fn default_backlog() -> u32 {
        1024
    }
}
