//! Configuration loading for pcmix hosts
//!
//! The core library never reads files or environment variables; hosts load a
//! [`TomlConfig`] here and hand plain values to the library.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line argument (`--config`)
//! 2. Environment variable (`PCMIX_CONFIG`)
//! 3. Platform config file (`<config_dir>/pcmix/config.toml`)
//! 4. Built-in defaults (code constants)
//!
//! A missing config file is never fatal: defaults are used and a warning is logged.

use crate::error::{Error, Result};
use crate::format::SampleFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "PCMIX_CONFIG";

/// Configuration loaded from TOML
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct TomlConfig {
    /// Audio output settings
    #[serde(default)]
    pub audio: AudioConfig,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[audio]` section
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Context sample rate in Hz
    ///
    /// Default: 44100
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Sample depth of player sources
    #[serde(default)]
    pub sample_format: SampleFormat,

    /// Sample depth written to the device
    #[serde(default = "default_output_format")]
    pub output_format: SampleFormat,

    /// Backend dialect
    #[serde(default)]
    pub backend: BackendSetting,

    /// "default", "null", or an output device name
    #[serde(default = "default_device")]
    pub device: String,

    /// Device buffer latency in milliseconds
    ///
    /// Default: 100
    #[serde(default = "default_buffer_ms")]
    pub buffer_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            sample_format: SampleFormat::default(),
            output_format: default_output_format(),
            backend: BackendSetting::default(),
            device: default_device(),
            buffer_ms: default_buffer_ms(),
        }
    }
}

impl AudioConfig {
    /// Interpret the `device` string.
    pub fn device_selection(&self) -> DeviceSelection {
        DeviceSelection::parse(&self.device)
    }
}

/// Backend dialect requested in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendSetting {
    /// The dialect the current platform uses
    #[default]
    Auto,
    Blocking,
    Ring,
    Callback,
    Native,
}

impl std::str::FromStr for BackendSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendSetting::Auto),
            "blocking" => Ok(BackendSetting::Blocking),
            "ring" => Ok(BackendSetting::Ring),
            "callback" => Ok(BackendSetting::Callback),
            "native" => Ok(BackendSetting::Native),
            other => Err(Error::InvalidInput(format!("unknown backend '{}'", other))),
        }
    }
}

/// Which output device to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    /// The host's default output device
    Default,
    /// Discard output at real-time pace (headless machines)
    Null,
    /// A device looked up by name, falling back to the default
    Named(String),
}

impl DeviceSelection {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "default" => DeviceSelection::Default,
            "null" => DeviceSelection::Null,
            name => DeviceSelection::Named(name.to_string()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_output_format() -> SampleFormat {
    SampleFormat::Float32
}

fn default_device() -> String {
    "default".to_string()
}

fn default_buffer_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load configuration following the priority order.
    ///
    /// Missing files fall back to defaults; a file that exists but fails to
    /// parse is an error.
    pub fn load_or_default(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path, CONFIG_ENV_VAR) {
            Some(path) if path.exists() => {
                let config = Self::load(&path)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using built-in defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                debug!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !(8000..=384_000).contains(&self.audio.sample_rate) {
            return Err(Error::Config(format!(
                "sample_rate {} out of range 8000..=384000",
                self.audio.sample_rate
            )));
        }
        if self.audio.buffer_ms == 0 {
            return Err(Error::Config("buffer_ms must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Config file path following the priority order, without checking existence
/// for explicit choices (so a typo in `--config` is reported, not ignored).
pub fn resolve_config_path(cli_path: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config file, only if present
    default_config_path().filter(|p| p.exists())
}

/// `<config_dir>/pcmix/config.toml` for the current platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pcmix").join("config.toml"))
}
