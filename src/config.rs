//! Configuration module for the echo-relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Concurrency ceiling used when nothing else is configured.
pub const DEFAULT_MAX_CLIENTS: usize = 100;

/// Largest accepted read buffer. Every handler allocates one up front.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-relay")]
#[command(author = "echo-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interface to bind to (defaults to all interfaces)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrently served clients
    #[arg(short = 'm', long)]
    pub max_clients: Option<usize>,

    /// Receive/send deadline per connection in seconds
    #[arg(long)]
    pub io_timeout: Option<u64>,

    /// Maximum number of bytes read as one message
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long)]
    pub shutdown_grace: Option<u64>,

    /// Listen backlog passed to the kernel
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Prefix connection log lines with a local timestamp
    #[arg(long)]
    pub timestamps: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Admission and per-connection limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrently served clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Receive/send deadline in seconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// Read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Drain period on shutdown in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            io_timeout_secs: default_io_timeout(),
            buffer_size: default_buffer_size(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Timestamp connection log lines
    #[serde(default)]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_io_timeout() -> u64 {
    30 // 30 seconds
}

fn default_buffer_size() -> usize {
    1024
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_clients: usize,
    pub io_timeout: Duration,
    pub buffer_size: usize,
    pub shutdown_grace: Duration,
    pub log_level: String,
    pub timestamps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from parsed CLI args.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_clients: cli.max_clients.unwrap_or(toml_config.limits.max_clients),
            io_timeout: Duration::from_secs(
                cli.io_timeout.unwrap_or(toml_config.limits.io_timeout_secs),
            ),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.limits.buffer_size),
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace
                    .unwrap_or(toml_config.limits.shutdown_grace_secs),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            timestamps: cli.timestamps || toml_config.logging.timestamps,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be at most {MAX_BUFFER_SIZE} bytes"
            )));
        }
        if self.io_timeout.is_zero() {
            return Err(ConfigError::Invalid("io_timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
