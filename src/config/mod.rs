//! Configuration Module
//!
//! TOML-based configuration for mqtt-notify:
//! - Log level
//! - The broker set handed to the bridge
//! - `${VAR}` / `${VAR:-default}` substitution inside the file
//! - Environment variable overrides (`MQTT_NOTIFY__*`)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::{BridgeConfig, BrokerConfig, DEFAULT_CLIENT_ID, DEFAULT_PORT};
pub use validate::{validate, ValidationError};

mod broker;
mod validate;

/// Log levels accepted in `[log] level`
const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Broker set failed structural validation
    Invalid(ValidationError),
    /// Any other validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid bridge configuration: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Invalid(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<ValidationError> for ConfigError {
    fn from(e: ValidationError) -> Self {
        ConfigError::Invalid(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Brokers to bridge
    pub bridge: BridgeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTT_NOTIFY__` prefix with double underscores for nesting:
    ///    - `MQTT_NOTIFY__LOG__LEVEL=debug` overrides `log.level`
    ///
    /// A missing file is not an error; the defaults (one local broker
    /// subscribed to `*`) are used instead.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().set_default("log.level", "info")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTT_NOTIFY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}', expected one of {}",
                self.log.level,
                LOG_LEVELS.join(", ")
            )));
        }

        for (index, broker) in self.bridge.brokers.iter().enumerate() {
            if broker.client_id.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "broker {} ({}): client_id cannot be empty",
                    index, broker.address
                )));
            }
            if broker.reconnect_interval.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "broker {} ({}): reconnect_interval must be greater than zero",
                    index, broker.address
                )));
            }
            if broker.max_packet_size == 0 {
                return Err(ConfigError::Validation(format!(
                    "broker {} ({}): max_packet_size must be greater than zero",
                    index, broker.address
                )));
            }
            if broker.reconnect_interval > broker.max_reconnect_interval {
                return Err(ConfigError::Validation(format!(
                    "broker {} ({}): reconnect_interval exceeds max_reconnect_interval",
                    index, broker.address
                )));
            }
        }

        validate(&self.bridge)?;
        Ok(())
    }
}
