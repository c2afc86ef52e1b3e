//! Configuration module for the echo-mux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Concurrency strategy used to serve clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Single-threaded TCP reactor (epoll/kqueue).
    Reactor,
    /// Single-threaded UDP reactor with per-peer sessions.
    Datagram,
    /// One forked process per TCP connection.
    Fork,
    /// One worker thread per TCP connection.
    Thread,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-mux")]
#[command(author = "echo-mux authors")]
#[command(version = "0.1.0")]
#[command(about = "An echo server with pluggable connection multiplexing", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 0.0.0.0 or ::)
    #[arg(short = 'l', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Concurrency strategy
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Listen backlog for TCP modes
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Read chunk size in bytes (also the datagram payload cap)
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Initial capacity of the readiness event batch
    #[arg(long)]
    pub events: Option<usize>,

    /// Reads performed for one connection before yielding to others
    #[arg(long)]
    pub read_budget: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: default_mode(),
            backlog: default_backlog(),
        }
    }
}

/// I/O tuning
#[derive(Debug, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            events_capacity: default_events_capacity(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    12321
}

fn default_mode() -> Mode {
    Mode::Reactor
}

fn default_backlog() -> i32 {
    10
}

fn default_buffer_size() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    128
}

fn default_read_budget() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub mode: Mode,
    pub backlog: i32,
    pub buffer_size: usize,
    pub events_capacity: usize,
    pub read_budget: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already parsed arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        if config.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero"));
        }
        if config.read_budget == 0 {
            return Err(ConfigError::Invalid("read_budget must be non-zero"));
        }
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.io.buffer_size),
            events_capacity: cli.events.unwrap_or(toml_config.io.events_capacity).max(1),
            read_budget: cli.read_budget.unwrap_or(toml_config.io.read_budget),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Configuration bound to an ephemeral loopback port.
    #[cfg(test)]
    pub fn loopback(mode: Mode) -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            mode,
            ..Config::default()
        }
    }
}

impl CliArgs {
    fn empty() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            mode: None,
            backlog: None,
            buffer_size: None,
            events: None,
            read_budget: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 12321);
        assert_eq!(config.server.mode, Mode::Reactor);
        assert_eq!(config.io.buffer_size, 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            mode = "datagram"
            backlog = 64

            [io]
            buffer_size = 4096
            read_budget = 4

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.mode, Mode::Datagram);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.io.buffer_size, 4096);
        assert_eq!(config.io.events_capacity, 128);
        assert_eq!(config.io.read_budget, 4);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 7000\nmode = \"fork\"\n[logging]\nlevel = \"warn\"").unwrap();

        let cli = CliArgs::parse_from([
            "echo-mux",
            "--config",
            file.path().to_str().unwrap(),
            "--port",
            "8000",
        ]);
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.mode, Mode::Fork);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_missing_file_is_error() {
        let cli = CliArgs::parse_from(["echo-mux", "-c", "/nonexistent/echo-mux.toml"]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let cli = CliArgs::parse_from(["echo-mux", "--buffer-size", "0"]);
        assert!(matches!(Config::from_args(cli), Err(ConfigError::Invalid(_))));
    }
}
