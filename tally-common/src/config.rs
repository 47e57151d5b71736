//! Configuration types for the Tally server

use serde::{Deserialize, Deserializer};
use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable that overrides the config file location
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Config file location used when `CONFIG_PATH` is unset or empty
pub const DEFAULT_CONFIG_PATH: &str = "/data/counter/config/config.yaml";

/// Snapshot file location used when no usable config is available
pub const DEFAULT_STATS_FILE: &str = "/data/counter/count/count.json";

/// Main server configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TallyConfig {
    /// Port to listen on, kept as text as it appears in the config file
    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: String,

    /// Path of the persisted stats snapshot
    #[serde(default = "default_file")]
    pub file: PathBuf,

    /// Address to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Seconds between periodic snapshot flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Enable access logging
    #[serde(default = "default_true")]
    pub access_log: bool,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            file: default_file(),
            bind_address: default_bind_address(),
            flush_interval_secs: default_flush_interval(),
            access_log: true,
        }
    }
}

// Default value functions
fn default_port() -> String {
    "8080".to_string()
}

fn default_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATS_FILE)
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_flush_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Accepts `port: "8080"` as well as `port: 8080`.
fn deserialize_port<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(text) => text,
        Port::Number(number) => number.to_string(),
    })
}

/// Resolve the config file path from the value of `CONFIG_PATH`
pub fn resolve_config_path(env_value: Option<OsString>) -> PathBuf {
    match env_value {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

/// Config file path for this process
pub fn config_path_from_env() -> PathBuf {
    resolve_config_path(std::env::var_os(CONFIG_PATH_ENV))
}

impl TallyConfig {
    /// Load configuration from a file, picking the format from its extension
    ///
    /// `.toml` files are parsed as TOML, everything else as YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            _ => Self::from_yaml(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, substituting defaults on any failure
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config from {}: {}", path.display(), e);
                warn!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Check values serde cannot reject on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address()?;

        match self.port.trim().parse::<u16>() {
            Ok(0) => {
                return Err(ConfigError::ValidationError(
                    "Server port cannot be 0".to_string(),
                ))
            }
            Ok(_) => {}
            Err(_) => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid port '{}'",
                    self.port
                )))
            }
        }

        if self.flush_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "flush_interval_secs cannot be 0".to_string(),
            ));
        }

        if self.file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Stats file path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address for the listener
    ///
    /// `bind_address` is a bare IP literal, so IPv6 needs no brackets.
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.bind_address.trim().parse().map_err(|_| {
            ConfigError::ValidationError(format!("Invalid bind address '{}'", self.bind_address))
        })?;
        let port: u16 = self
            .port
            .trim()
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("Invalid port '{}'", self.port)))?;
        Ok(SocketAddr::new(ip, port))
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
