use crate::bus::{BusKind, AVAHI_BUS_NAME};
use crate::types::Protocol;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub browse: BrowseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to reach the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Message bus the daemon is on
    #[serde(default)]
    pub kind: BusKind,

    /// Well-known bus name of the daemon
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Client-side limit for method calls in milliseconds (0 = wait forever)
    #[serde(default)]
    pub call_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            service_name: default_service_name(),
            call_timeout_ms: 0,
        }
    }
}

impl BusConfig {
    /// Client-side call timeout, `None` when disabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }
}

fn default_service_name() -> String {
    AVAHI_BUS_NAME.to_string()
}

/// Address family preference for browsing and resolving.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolPreference {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl ProtocolPreference {
    pub fn protocol(self) -> Protocol {
        match self {
            ProtocolPreference::Any => Protocol::Unspec,
            ProtocolPreference::Ipv4 => Protocol::Inet,
            ProtocolPreference::Ipv6 => Protocol::Inet6,
        }
    }
}

/// Defaults for the `browse`, `resolve` and `records` commands.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BrowseConfig {
    /// Domain to browse (empty = the daemon's default, usually "local")
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub protocol: ProtocolPreference,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set
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

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "avahi-dbus", "avahi-dbus")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, or defaults if there is no file
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Load and validate config from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if zbus::names::WellKnownName::try_from(self.bus.service_name.as_str()).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "service_name '{}' is not a valid bus name",
                self.bus.service_name
            )));
        }

        if self.bus.call_timeout_ms > 3_600_000 {
            return Err(ConfigError::ValidationError(
                "call_timeout_ms cannot exceed one hour".into(),
            ));
        }

        if self.browse.domain.contains(char::is_whitespace) {
            return Err(ConfigError::ValidationError(
                "browse domain must not contain whitespace".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save config to `path`, creating parent directories as needed
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

/// Show current configuration
pub fn show() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = Config::config_path()?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

/// Write the current (or default) configuration to disk
pub fn init() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = config.save()?;
    println!("Wrote {}", path.display());
    Ok(())
}
