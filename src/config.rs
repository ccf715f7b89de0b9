//! Configuration module for the framed-rpc server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Concurrency strategy used to serve connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// One OS thread per accepted connection.
    Thread,
    /// One forked process per accepted connection.
    Process,
    /// Fixed pool of forked workers racing on accept().
    Prefork,
    /// Single-threaded readiness event loop (optionally pre-forked).
    Event,
    /// One connection at a time on the accepting thread. Baseline only.
    Sequential,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Thread => "thread",
            StrategyKind::Process => "process",
            StrategyKind::Prefork => "prefork",
            StrategyKind::Event => "event",
            StrategyKind::Sequential => "sequential",
        }
    }
}

/// Command-line arguments for the RPC server
#[derive(Parser, Debug)]
#[command(name = "framed-rpc")]
#[command(version)]
#[command(about = "Length-prefixed JSON RPC server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., localhost:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Concurrency strategy
    #[arg(short = 's', long, value_enum)]
    pub strategy: Option<StrategyKind>,

    /// Prefork pool size
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Number of pre-forked event loop processes
    #[arg(long)]
    pub event_workers: Option<usize>,

    /// Seconds of read inactivity before a connection is closed (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

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
    pub pool: PoolConfig,
    #[serde(default)]
    pub event: EventConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Idle timeout in seconds, 0 disables
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            strategy: default_strategy(),
            backlog: default_backlog(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Process pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Number of pre-forked workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pause after a failed fork, in milliseconds
    #[serde(default = "default_fork_backoff_ms")]
    pub fork_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fork_backoff_ms: default_fork_backoff_ms(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct EventConfig {
    /// Pre-forked event loop processes (1 = no fork)
    #[serde(default = "default_event_workers")]
    pub workers: usize,
    /// Bytes requested per non-blocking read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Live connections per event loop
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            workers: default_event_workers(),
            read_chunk: default_read_chunk(),
            max_connections: default_max_connections(),
        }
    }
}

/// Wire protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
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
    "localhost:8080".to_string()
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Thread
}

fn default_backlog() -> i32 {
    128
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_workers() -> usize {
    2
}

fn default_fork_backoff_ms() -> u64 {
    100
}

fn default_event_workers() -> usize {
    1
}

fn default_read_chunk() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_size() -> u32 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub addr: SocketAddr,
    pub strategy: StrategyKind,
    pub backlog: i32,
    pub idle_timeout: Option<Duration>,
    pub workers: usize,
    pub fork_backoff: Duration,
    pub event_workers: usize,
    pub read_chunk: usize,
    pub max_connections: usize,
    pub max_frame_size: u32,
    pub log_level: String,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(file.server.listen);
        let addr = resolve(&listen)?;

        let workers = cli.workers.unwrap_or(file.pool.workers);
        if workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1".into()));
        }
        let event_workers = cli.event_workers.unwrap_or(file.event.workers);
        if event_workers == 0 {
            return Err(ConfigError::Invalid("event.workers must be at least 1".into()));
        }
        if file.event.read_chunk == 0 {
            return Err(ConfigError::Invalid("event.read_chunk must be at least 1".into()));
        }
        if file.event.max_connections == 0 {
            return Err(ConfigError::Invalid("event.max_connections must be at least 1".into()));
        }
        if file.protocol.max_frame_size == 0 {
            return Err(ConfigError::Invalid("protocol.max_frame_size must be at least 1".into()));
        }
        if file.server.backlog <= 0 {
            return Err(ConfigError::Invalid("server.backlog must be positive".into()));
        }

        let idle_secs = cli.idle_timeout.unwrap_or(file.server.idle_timeout);

        Ok(Config {
            listen,
            addr,
            strategy: cli.strategy.unwrap_or(file.server.strategy),
            backlog: file.server.backlog,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            workers,
            fork_backoff: Duration::from_millis(file.pool.fork_backoff_ms),
            event_workers,
            read_chunk: file.event.read_chunk,
            max_connections: file.event.max_connections,
            max_frame_size: file.protocol.max_frame_size,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }
}

/// Resolve a `host:port` string, preferring IPv4 when several addresses come back.
fn resolve(listen: &str) -> Result<SocketAddr, ConfigError> {
    let addrs: Vec<SocketAddr> = listen
        .to_socket_addrs()
        .map_err(|e| ConfigError::Invalid(format!("cannot resolve '{listen}': {e}")))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ConfigError::Invalid(format!("'{listen}' resolved to no addresses")))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_cli() -> CliArgs {
        CliArgs::parse_from(["framed-rpc"])
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "localhost:8080");
        assert_eq!(config.server.strategy, StrategyKind::Thread);
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.event.read_chunk, 1024);
        assert_eq!(config.protocol.max_frame_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            strategy = "prefork"
            idle_timeout = 0

            [pool]
            workers = 4

            [event]
            workers = 3
            read_chunk = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.strategy, StrategyKind::Prefork);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.event.workers, 3);
        assert_eq!(config.event.read_chunk, 4096);
        assert_eq!(config.logging.level, "debug");

        let resolved = Config::merge(no_cli(), config).unwrap();
        assert_eq!(resolved.addr.port(), 9000);
        assert!(resolved.idle_timeout.is_none());
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::parse_from([
            "framed-rpc",
            "--listen",
            "127.0.0.1:7001",
            "--strategy",
            "event",
            "--workers",
            "5",
            "--log-level",
            "trace",
        ]);
        let file: TomlConfig = toml::from_str("[server]\nstrategy = \"process\"\n").unwrap();

        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.strategy, StrategyKind::Event);
        assert_eq!(config.workers, 5);
        assert_eq!(config.addr, "127.0.0.1:7001".parse().unwrap());
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_zero_pool_rejected() {
        let file: TomlConfig = toml::from_str("[pool]\nworkers = 0\n").unwrap();
        assert!(matches!(
            Config::merge(no_cli(), file),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_limits_rejected() {
        for toml_str in [
            "[event]\nmax_connections = 0\n",
            "[protocol]\nmax_frame_size = 0\n",
            "[event]\nread_chunk = 0\n",
        ] {
            let file: TomlConfig = toml::from_str(toml_str).unwrap();
            assert!(
                matches!(Config::merge(no_cli(), file), Err(ConfigError::Invalid(_))),
                "accepted {toml_str:?}"
            );
        }
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("localhost:8080").unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());

        assert!(resolve("not an address").is_err());
    }
}
