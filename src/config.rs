//! Configuration module for the socket engine.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the socket server
#[derive(Parser, Debug, Default)]
#[command(name = "socket-engine")]
#[command(author = "socket-engine authors")]
#[command(version = "0.1.0")]
#[command(about = "A command-dispatching TCP socket server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:2012)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections (sizes the proxy pool)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Disable the performance monitor
    #[arg(long)]
    pub disable_performance: bool,

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
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the byte stream of a connection is split into requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// `KEY body\r\n` text lines.
    #[default]
    Line,
    /// Fixed-width key, 4-byte big-endian body length, then the body.
    LengthPrefixed,
}

/// Listener and session configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent connections, also the proxy pool capacity
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Size of each pooled receive buffer
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Largest request a decoder accepts
    #[serde(default = "default_max_request_length")]
    pub max_request_length: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Framing rule for all connections
    #[serde(default)]
    pub framing: FramingMode,
    /// Width of the key field for length-prefixed framing
    #[serde(default = "default_key_width")]
    pub key_width: usize,
    /// Records buffered per exception channel subscriber
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            receive_buffer_size: default_receive_buffer_size(),
            max_request_length: default_max_request_length(),
            backlog: default_backlog(),
            framing: FramingMode::default(),
            key_width: default_key_width(),
            error_channel_capacity: default_error_channel_capacity(),
        }
    }
}

/// Runtime thread limits
#[derive(Debug, Deserialize)]
pub struct ThreadsConfig {
    #[serde(default = "default_max_working_threads")]
    pub max_working_threads: usize,
    #[serde(default = "default_min_threads")]
    pub min_working_threads: usize,
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
    #[serde(default = "default_min_threads")]
    pub min_blocking_threads: usize,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            max_working_threads: default_max_working_threads(),
            min_working_threads: default_min_threads(),
            max_blocking_threads: default_max_blocking_threads(),
            min_blocking_threads: default_min_threads(),
        }
    }
}

/// Performance monitor configuration
#[derive(Debug, Deserialize)]
pub struct PerformanceConfig {
    /// Turn the monitor off entirely
    #[serde(default)]
    pub disabled: bool,
    /// Sampling interval in seconds
    #[serde(default = "default_perf_interval")]
    pub interval: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval: default_perf_interval(),
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
    "127.0.0.1:2012".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_receive_buffer_size() -> usize {
    4 * 1024
}

fn default_max_request_length() -> usize {
    64 * 1024
}

fn default_backlog() -> u32 {
    1024
}

fn default_key_width() -> usize {
    4
}

fn default_error_channel_capacity() -> usize {
    1024
}

fn default_max_working_threads() -> usize {
    num_cpus()
}

fn default_max_blocking_threads() -> usize {
    512
}

fn default_min_threads() -> usize {
    1
}

fn default_perf_interval() -> u64 {
    60 // 60 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub receive_buffer_size: usize,
    pub max_request_length: usize,
    pub backlog: u32,
    pub framing: FramingMode,
    pub key_width: usize,
    pub error_channel_capacity: usize,
    pub max_working_threads: usize,
    pub min_working_threads: usize,
    pub max_blocking_threads: usize,
    pub min_blocking_threads: usize,
    pub disable_performance: bool,
    pub performance_interval: u64,
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            receive_buffer_size: toml_config.server.receive_buffer_size,
            max_request_length: toml_config.server.max_request_length,
            backlog: toml_config.server.backlog,
            framing: toml_config.server.framing,
            key_width: toml_config.server.key_width,
            error_channel_capacity: toml_config.server.error_channel_capacity,
            max_working_threads: cli
                .workers
                .unwrap_or(toml_config.threads.max_working_threads),
            min_working_threads: toml_config.threads.min_working_threads,
            max_blocking_threads: toml_config.threads.max_blocking_threads,
            min_blocking_threads: toml_config.threads.min_blocking_threads,
            disable_performance: cli.disable_performance || toml_config.performance.disabled,
            performance_interval: toml_config.performance.interval,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        let non_zero = [
            ("server.max_connections", self.max_connections),
            ("server.receive_buffer_size", self.receive_buffer_size),
            ("server.max_request_length", self.max_request_length),
            ("server.key_width", self.key_width),
            ("server.error_channel_capacity", self.error_channel_capacity),
            ("threads.max_working_threads", self.max_working_threads),
            ("threads.max_blocking_threads", self.max_blocking_threads),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        // The length-prefixed header carries a u32 body length.
        if u32::try_from(self.max_request_length).is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.max_request_length must not exceed {}",
                u32::MAX
            )));
        }

        if self.performance_interval == 0 {
            return Err(ConfigError::Invalid(
                "performance.interval must be greater than 0".into(),
            ));
        }
        if self.min_working_threads > self.max_working_threads {
            return Err(ConfigError::Invalid(format!(
                "threads.min_working_threads ({}) exceeds threads.max_working_threads ({})",
                self.min_working_threads, self.max_working_threads
            )));
        }
        if self.min_blocking_threads > self.max_blocking_threads {
            return Err(ConfigError::Invalid(format!(
                "threads.min_blocking_threads ({}) exceeds threads.max_blocking_threads ({})",
                self.min_blocking_threads, self.max_blocking_threads
            )));
        }

        Ok(())
    }

    /// The parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", self.listen)))
    }

    /// Sampling interval of the performance monitor.
    pub fn performance_interval(&self) -> Duration {
        Duration::from_secs(self.performance_interval)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
