//! Configuration management
//!
//! Defaults, TOML files and `PEERTRUST_*` environment overrides for the
//! protocol wait budgets, the PIN key-derivation cost, the keystore location
//! and logging.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::core_identity::KdfParams;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: ProtocolConfig,
    pub store: StoreConfig,
    pub kdf: KdfParams,
    pub logging: LoggingConfig,
}

/// Wait budgets and limits shared by the SIEP, PCAP and SMAP sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a session waits for a local human decision (accept, refuse,
    /// sync approval, device code or PIN entry)
    #[serde(with = "humantime_serde")]
    pub decision_timeout: Duration,

    /// How long a session waits for the next message from the remote peer
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,

    /// Upper bound for a granted write-authorization to become visible
    #[serde(with = "humantime_serde")]
    pub authorization_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub authorization_poll_interval: Duration,

    /// Proof attempts a device-sync receiver accepts before aborting
    pub max_device_code_attempts: u32,

    /// Local PIN prompts before an unlock is abandoned
    pub max_pin_attempts: u32,

    /// Largest accepted protocol frame in bytes
    pub max_frame_size: usize,
}

/// Keystore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,

    /// Encrypt keystore files with a passphrase (AES-256-GCM)
    pub encrypt_at_rest: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(600),
            peer_timeout: Duration::from_secs(60),
            authorization_timeout: Duration::from_secs(30),
            authorization_poll_interval: Duration::from_millis(250),
            max_device_code_attempts: 1,
            max_pin_attempts: 3,
            max_frame_size: 64 * 1024,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            encrypt_at_rest: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

fn parse_env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern `PEERTRUST_<SECTION>_<KEY>`, for example
    /// `PEERTRUST_PROTOCOL_DECISION_TIMEOUT=2m`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_env_duration("PEERTRUST_PROTOCOL_DECISION_TIMEOUT")? {
            config.protocol.decision_timeout = v;
        }
        if let Some(v) = parse_env_duration("PEERTRUST_PROTOCOL_PEER_TIMEOUT")? {
            config.protocol.peer_timeout = v;
        }
        if let Some(v) = parse_env_duration("PEERTRUST_PROTOCOL_AUTHORIZATION_TIMEOUT")? {
            config.protocol.authorization_timeout = v;
        }
        if let Some(v) = parse_env("PEERTRUST_PROTOCOL_MAX_DEVICE_CODE_ATTEMPTS")? {
            config.protocol.max_device_code_attempts = v;
        }
        if let Some(v) = parse_env("PEERTRUST_PROTOCOL_MAX_PIN_ATTEMPTS")? {
            config.protocol.max_pin_attempts = v;
        }

        if let Ok(dir) = env::var("PEERTRUST_STORE_DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_env("PEERTRUST_STORE_ENCRYPT_AT_REST")? {
            config.store.encrypt_at_rest = v;
        }

        if let Some(v) = parse_env("PEERTRUST_KDF_MEMORY_KIB")? {
            config.kdf.memory_kib = v;
        }
        if let Some(v) = parse_env("PEERTRUST_KDF_ITERATIONS")? {
            config.kdf.iterations = v;
        }

        if let Ok(level) = env::var("PEERTRUST_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(v) = parse_env("PEERTRUST_LOG_JSON")? {
            config.logging.json_format = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.protocol;
        for (name, value) in [
            ("decision_timeout", p.decision_timeout),
            ("peer_timeout", p.peer_timeout),
            ("authorization_timeout", p.authorization_timeout),
            ("authorization_poll_interval", p.authorization_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if p.authorization_poll_interval > p.authorization_timeout {
            return Err(ConfigError::ValidationFailed(
                "authorization_poll_interval exceeds authorization_timeout".to_string(),
            ));
        }

        if p.max_device_code_attempts == 0 || p.max_pin_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "attempt limits must be greater than 0".to_string(),
            ));
        }

        if p.max_frame_size < 1024 {
            return Err(ConfigError::ValidationFailed(
                "max_frame_size must be at least 1 KiB".to_string(),
            ));
        }

        self.kdf
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol.max_device_code_attempts, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.protocol.decision_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.protocol.max_pin_attempts = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.protocol.authorization_poll_interval = Duration::from_secs(60);
        assert!(config.validate().is_err());

        config = Config::default();
        config.kdf.iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peertrust.toml");

        let mut config = Config::default();
        config.protocol.decision_timeout = Duration::from_secs(90);
        config.kdf.memory_kib = 4096;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.protocol.decision_timeout, Duration::from_secs(90));
        assert_eq!(loaded.kdf.memory_kib, 4096);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[protocol]\ndecision_timeout = \"2m\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.protocol.decision_timeout, Duration::from_secs(120));
        assert_eq!(loaded.protocol.peer_timeout, Duration::from_secs(60));
        assert_eq!(loaded.logging.level, "info");
    }
}
