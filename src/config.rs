//! Configuration module for framed-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::{DEFAULT_MAX_FRAME_SIZE, HEADER_LEN, MAX_WIRE_LENGTH};
use crate::handler::HandlerType;
use crate::runtime::session::SessionLimits;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// How accepted connections are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// A supervised thread per connection.
    Thread,
    /// A fixed pool of worker threads.
    #[default]
    Pool,
    /// One thread multiplexing non-blocking connections.
    EventLoop,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "framed-server")]
#[command(author = "framed-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed framing TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Connection dispatch strategy
    #[arg(short = 'd', long, value_enum)]
    pub dispatch: Option<DispatchMode>,

    /// Maximum concurrent connections (pool size for `pool`)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Maximum payload size in bytes
    #[arg(short = 'f', long)]
    pub max_frame_size: Option<usize>,

    /// Receive buffer size per connection in bytes (defaults to max frame size + 4)
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Read deadline in milliseconds (0 = none)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Write deadline in milliseconds (0 = none)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Built-in message handler
    #[arg(long, value_enum)]
    pub handler: Option<HandlerType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Connection dispatch strategy
    #[serde(default)]
    pub dispatch: DispatchMode,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Accepted connections allowed to wait for a pool worker
    #[serde(default = "default_pending_connections")]
    pub pending_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Built-in message handler
    #[serde(default)]
    pub handler: HandlerType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            dispatch: DispatchMode::default(),
            max_connections: default_max_connections(),
            pending_connections: default_pending_connections(),
            backlog: default_backlog(),
            handler: HandlerType::default(),
        }
    }
}

/// Framing and deadline configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum payload size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Receive buffer size in bytes
    pub buffer_size: Option<usize>,
    /// Read deadline in milliseconds (0 = none)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write deadline in milliseconds (0 = none)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            buffer_size: None,
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

/// Readiness loop tuning
#[derive(Debug, Deserialize)]
pub struct EventLoopConfig {
    /// Readiness events processed per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Reads per connection per readiness event
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            read_budget: default_read_budget(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_pending_connections() -> usize {
    64
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_read_budget() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub dispatch: DispatchMode,
    pub max_connections: usize,
    pub pending_connections: usize,
    pub backlog: i32,
    pub max_frame_size: usize,
    pub buffer_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub event_capacity: usize,
    pub read_budget: usize,
    pub handler: HandlerType,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over file values.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        let max_frame_size = cli.max_frame_size.unwrap_or(file.protocol.max_frame_size);
        let buffer_size = cli
            .buffer_size
            .or(file.protocol.buffer_size)
            .unwrap_or_else(|| max_frame_size.saturating_add(HEADER_LEN));

        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            dispatch: cli.dispatch.unwrap_or(file.server.dispatch),
            max_connections: cli
                .max_connections
                .unwrap_or(file.server.max_connections),
            pending_connections: file.server.pending_connections,
            backlog: file.server.backlog,
            max_frame_size,
            buffer_size,
            read_timeout: millis(
                cli.read_timeout_ms
                    .unwrap_or(file.protocol.read_timeout_ms),
            ),
            write_timeout: millis(
                cli.write_timeout_ms
                    .unwrap_or(file.protocol.write_timeout_ms),
            ),
            event_capacity: file.event_loop.event_capacity,
            read_budget: file.event_loop.read_budget,
            handler: cli.handler.unwrap_or(file.server.handler),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    /// Reject settings that would fail on every connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size > MAX_WIRE_LENGTH {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_size",
                reason: format!("{} exceeds the 32-bit length prefix", self.max_frame_size),
            });
        }
        if self.buffer_size < self.max_frame_size.saturating_add(HEADER_LEN) {
            return Err(ConfigError::InsufficientBufferCapacity {
                buffer_size: self.buffer_size,
                max_frame_size: self.max_frame_size,
            });
        }
        for (field, value) in [
            ("max_connections", self.max_connections),
            ("event_capacity", self.event_capacity),
            ("read_budget", self.read_budget),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        self.socket_addr()?;
        Ok(())
    }

    /// Resolve the listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidAddress(self.listen.clone()))
    }

    /// Limits applied to every connection.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_frame_size: self.max_frame_size,
            buffer_size: self.buffer_size,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("Buffer size {buffer_size} cannot hold a {max_frame_size}-byte frame and its 4-byte header")]
    InsufficientBufferCapacity {
        buffer_size: usize,
        max_frame_size: usize,
    },

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
