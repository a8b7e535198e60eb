//! # Configuration Management
//!
//! Centralized configuration for multiplexed connections.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()`
//! - Direct instantiation with defaults or `default_with_overrides()`
//!
//! ## Ration
//! The initial inbound ration is the per-session byte credit advertised to the
//! peer in the connection header. Only bits 8-23 may be set because the wire
//! field carries the ration shifted right by eight. Zero means unlimited.

use crate::error::{MuxError, Result};
use crate::protocol::handshake::RATION_MASK;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes opening every connection header ("MUX1")
pub const MAGIC_BYTES: [u8; 4] = [0x4D, 0x55, 0x58, 0x31];

/// Default per-session inbound credit (64 KiB)
pub const DEFAULT_INBOUND_RATION: u32 = 0x0001_0000;

/// Default size of the reader loop's receive buffer
pub const DEFAULT_RECEIVE_BUFFER: usize = 8 * 1024;

/// Configuration for one multiplexed connection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Per-session inbound credit advertised to the peer (0 = unlimited)
    pub initial_inbound_ration: u32,

    /// How long the initiator waits for the responder's header
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// How long to wait for an Error frame to be flushed before teardown
    #[serde(with = "duration_serde")]
    pub error_flush_timeout: Duration,

    /// How long the responder waits for a Shutdown frame to be flushed
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Size of the reader loop's fixed receive buffer in bytes
    pub receive_buffer_size: usize,

    /// Whether the initiator asks the responder to negotiate the version down
    pub negotiate_version: bool,

    /// Number of queued outbound buffers after which a warning is logged
    pub max_frame_queue: usize,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_inbound_ration: DEFAULT_INBOUND_RATION,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            error_flush_timeout: timeout::ERROR_FLUSH_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER,
            negotiate_version: false,
            max_frame_queue: 1024,
            logging: LoggingConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| MuxError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| MuxError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| MuxError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(ration) = std::env::var("MUX_PROTOCOL_INBOUND_RATION") {
            config.initial_inbound_ration = ration.parse::<u32>().map_err(|e| {
                MuxError::ConfigError(format!("Invalid MUX_PROTOCOL_INBOUND_RATION: {e}"))
            })?;
        }

        if let Ok(timeout) = std::env::var("MUX_PROTOCOL_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("MUX_PROTOCOL_ERROR_FLUSH_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.error_flush_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(size) = std::env::var("MUX_PROTOCOL_RECEIVE_BUFFER") {
            if let Ok(val) = size.parse::<usize>() {
                config.receive_buffer_size = val;
            }
        }

        if let Ok(flag) = std::env::var("MUX_PROTOCOL_NEGOTIATE_VERSION") {
            config.negotiate_version = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MuxError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| MuxError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.initial_inbound_ration & !RATION_MASK != 0 {
            errors.push(format!(
                "Initial inbound ration {:#010x} has bits outside {:#010x}",
                self.initial_inbound_ration, RATION_MASK
            ));
        }

        if self.handshake_timeout.as_millis() < 10 {
            errors.push("Handshake timeout too short (minimum: 10ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.error_flush_timeout.is_zero() {
            errors.push("Error flush timeout must be greater than 0".to_string());
        } else if self.error_flush_timeout.as_secs() > 60 {
            errors.push("Error flush timeout too long (maximum: 60s)".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            errors.push("Shutdown timeout must be greater than 0".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.receive_buffer_size < 64 {
            errors.push(format!(
                "Receive buffer too small: {} bytes (minimum: 64)",
                self.receive_buffer_size
            ));
        } else if self.receive_buffer_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Receive buffer too large: {} bytes (maximum: 16 MB)",
                self.receive_buffer_size
            ));
        }

        if self.max_frame_queue == 0 {
            errors.push("Max frame queue must be greater than 0".to_string());
        }

        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MuxError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Whether to include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mux-protocol"),
            log_level: Level::INFO,
            json_format: false,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
