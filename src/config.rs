//! Configuration module for the line-pool server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::pool::PoolConfig;
use crate::processor::ProcessorKind;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "line-pool")]
#[command(version)]
#[command(about = "A line-based TCP request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Workers kept alive while idle
    #[arg(long)]
    pub core_size: Option<usize>,

    /// Maximum concurrent connections (and workers)
    #[arg(long)]
    pub max_size: Option<usize>,

    /// Tasks that may wait for a free worker
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Seconds an extra worker may sit idle before retiring
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Request processor
    #[arg(long, value_enum)]
    pub processor: Option<ProcessorKind>,

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
    pub pool: PoolConfig,
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
    #[serde(default)]
    pub processor: ProcessorKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            processor: ProcessorKind::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub pool: PoolConfig,
    pub processor: ProcessorKind,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file named by `--config`, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let pool = PoolConfig {
            core_size: cli.core_size.unwrap_or(toml_config.pool.core_size),
            max_size: cli.max_size.unwrap_or(toml_config.pool.max_size),
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.pool.queue_capacity),
            idle_timeout: cli
                .idle_timeout
                .map_or(toml_config.pool.idle_timeout, Duration::from_secs),
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            pool,
            processor: cli.processor.unwrap_or(toml_config.server.processor),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.core_size == 0 {
            return Err(ConfigError::Invalid("core_size must be at least 1".into()));
        }
        if pool.max_size < pool.core_size {
            return Err(ConfigError::Invalid(format!(
                "max_size ({}) must not be below core_size ({})",
                pool.max_size, pool.core_size
            )));
        }
        if pool.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
