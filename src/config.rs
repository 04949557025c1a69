//! Configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/flight_logger.toml` (optional; every field has a default)
//! 2. Environment variables prefixed with `FLIGHT_LOGGER_`, sections separated
//!    by a double underscore
//!
//! Example: `FLIGHT_LOGGER_SYNC__INTERVAL_WRITES=10`.
//!
//! # Example
//! ```no_run
//! use flight_logger::config::LoggerConfig;
//!
//! let config = LoggerConfig::load()?;
//! config.validate()?;
//! println!("Logging to {}", config.storage.root.join(&config.storage.log_path).display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::{parse_log_level, OutputFormat};
use crate::pipeline::{SessionOptions, DEFAULT_LOG_PATH, MAX_CHUNK_SIZE};
use crate::recovery::RetryPolicy;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/flight_logger.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Name and diagnostics output.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Card location and log file.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Where console bytes come from.
    #[serde(default)]
    pub source: SourceConfig,
    /// Durability cadence.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Remount pacing.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name reported at startup.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Diagnostics format (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Where the log lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Mount point of the card.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Log file, relative to `root`, or to the volume root of `image`.
    #[serde(default = "default_log_path")]
    pub log_path: String,
    /// Raw card device or FAT disk image. When set the logger runs the FAT
    /// filesystem itself and `root` is unused.
    #[serde(default)]
    pub image: Option<PathBuf>,
}

/// Kind of byte source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Standard input.
    #[default]
    Stdin,
    /// A regular file or FIFO.
    File,
    /// A serial port (8N1, no flow control).
    Serial,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Stdin => write!(f, "stdin"),
            SourceKind::File => write!(f, "file"),
            SourceKind::Serial => write!(f, "serial"),
        }
    }
}

/// Byte source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source type.
    #[serde(default)]
    pub kind: SourceKind,
    /// File path or serial device; required unless `kind` is stdin.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Serial line rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Bytes per read.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Durability cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Successful writes between durability syncs.
    #[serde(default = "default_interval_writes")]
    pub interval_writes: u16,
}

/// Recovery pacing. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Wait after each teardown step of a remount. Also paces an idle source.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Failed attempts before the cooldown applies; unset retries on the
    /// backoff schedule forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Hold-off after the first failed attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Hold-off ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Hold-off growth per consecutive failure.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Pause once `max_attempts` is used up.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

/// Whether `name` fits FAT's 8.3 root-directory naming.
fn is_short_name(name: &str) -> bool {
    let (base, ext) = name.split_once('.').unwrap_or((name, ""));
    (1..=8).contains(&base.len())
        && ext.len() <= 3
        && !ext.contains('.')
        && !name.contains(['/', '\\'])
}

// Default value functions
fn default_name() -> String {
    "flight-logger".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("/mnt/sd")
}

fn default_log_path() -> String {
    DEFAULT_LOG_PATH.to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_chunk_size() -> usize {
    128
}

fn default_interval_writes() -> u16 {
    20
}

fn default_settle_delay_ms() -> u64 {
    50
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_cooldown_ms() -> u64 {
    60_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            log_path: default_log_path(),
            image: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            path: None,
            baud_rate: default_baud_rate(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_writes: default_interval_writes(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            max_attempts: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl LoggerConfig {
    /// Load from the default file and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file is not an
    /// error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack, for callers that merge their own overrides on top.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLIGHT_LOGGER_").split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_log_level(&self.application.log_level)?;

        let log_path = self.storage.log_path.as_str();
        if log_path.is_empty() {
            return Err(ConfigError("storage.log_path must not be empty".to_string()));
        }
        if Path::new(log_path).is_absolute() {
            return Err(ConfigError(format!(
                "storage.log_path '{log_path}' must be relative to storage.root"
            )));
        }
        if self.storage.image.is_some() && !is_short_name(log_path) {
            return Err(ConfigError(format!(
                "storage.log_path '{log_path}' must be an 8.3 name in the root directory \
                 when storage.image is set"
            )));
        }

        if self.source.kind != SourceKind::Stdin && self.source.path.is_none() {
            return Err(ConfigError(format!(
                "source.path is required for a {} source",
                self.source.kind
            )));
        }
        if self.source.kind == SourceKind::Serial && self.source.baud_rate == 0 {
            return Err(ConfigError("source.baud_rate must be positive".to_string()));
        }
        if self.source.chunk_size == 0 || self.source.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError(format!(
                "invalid source.chunk_size {}. Must be 1-{MAX_CHUNK_SIZE}",
                self.source.chunk_size
            )));
        }

        if self.sync.interval_writes == 0 {
            return Err(ConfigError("sync.interval_writes must be at least 1".to_string()));
        }

        let recovery = &self.recovery;
        if recovery.max_attempts == Some(0) {
            return Err(ConfigError(
                "recovery.max_attempts must be at least 1 when set".to_string(),
            ));
        }
        if recovery.backoff_multiplier == 0 {
            return Err(ConfigError(
                "recovery.backoff_multiplier must be at least 1".to_string(),
            ));
        }
        if recovery.initial_backoff_ms > recovery.max_backoff_ms {
            return Err(ConfigError(format!(
                "recovery.initial_backoff_ms ({}) exceeds recovery.max_backoff_ms ({})",
                recovery.initial_backoff_ms, recovery.max_backoff_ms
            )));
        }

        Ok(())
    }

    /// Recovery pacing as a [`RetryPolicy`].
    pub fn retry_policy(&self) -> RetryPolicy {
        let recovery = &self.recovery;
        RetryPolicy {
            settle_delay: Duration::from_millis(recovery.settle_delay_ms),
            max_attempts: recovery.max_attempts,
            initial_backoff: Duration::from_millis(recovery.initial_backoff_ms),
            max_backoff: Duration::from_millis(recovery.max_backoff_ms),
            multiplier: recovery.backoff_multiplier,
            cooldown: Duration::from_millis(recovery.cooldown_ms),
        }
    }

    /// Pipeline parameters for [`LoggerSession::start`](crate::pipeline::LoggerSession::start).
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            log_path: self.storage.log_path.clone(),
            chunk_size: self.source.chunk_size,
            sync_interval: self.sync.interval_writes,
            retry: self.retry_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = LoggerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_options(), SessionOptions::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = LoggerConfig::load_from("absent.toml")?;
            assert_eq!(config, LoggerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn file_and_env_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "flight_logger.toml",
                r#"
                [application]
                log_level = "debug"
                log_format = "json"

                [storage]
                root = "/media/card"
                log_path = "console.log"

                [source]
                kind = "serial"
                path = "/dev/ttyS1"
                baud_rate = 57600

                [recovery]
                max_attempts = 5
                cooldown_ms = 30000
                "#,
            )?;
            jail.set_env("FLIGHT_LOGGER_SYNC__INTERVAL_WRITES", "5");
            jail.set_env("FLIGHT_LOGGER_SOURCE__CHUNK_SIZE", "64");

            let config = LoggerConfig::load_from("flight_logger.toml")?;
            assert_eq!(config.application.log_format, OutputFormat::Json);
            assert_eq!(config.storage.root, PathBuf::from("/media/card"));
            assert_eq!(config.source.kind, SourceKind::Serial);
            assert_eq!(config.source.baud_rate, 57_600);
            assert_eq!(config.source.chunk_size, 64);
            assert_eq!(config.sync.interval_writes, 5);
            assert!(config.validate().is_ok());

            let policy = config.retry_policy();
            assert_eq!(policy.max_attempts, Some(5));
            assert_eq!(policy.cooldown, Duration::from_secs(30));
            assert_eq!(policy.settle_delay, Duration::from_millis(50));
            Ok(())
        });
    }

    #[test]
    fn unknown_source_kind_fails_extraction() {
        Jail::expect_with(|jail| {
            jail.create_file("flight_logger.toml", "[source]\nkind = \"usb\"\n")?;
            assert!(LoggerConfig::load_from("flight_logger.toml").is_err());
            Ok(())
        });
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = LoggerConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_source_requires_path() {
        let mut config = LoggerConfig::default();
        config.source.kind = SourceKind::File;
        let err = config.validate().unwrap_err();
        assert!(err.0.contains("source.path"));

        config.source.path = Some(PathBuf::from("console.fifo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn image_requires_short_log_name() {
        let mut config = LoggerConfig::default();
        config.storage.image = Some(PathBuf::from("/dev/mmcblk0"));
        assert!(config.validate().is_ok());

        config.storage.log_path = "console.log".to_string();
        assert!(config.validate().is_ok());

        for bad in ["logs/data.txt", "telemetry.txt", "data.text"] {
            config.storage.log_path = bad.to_string();
            assert!(config.validate().is_err(), "{bad}");
        }
    }

    #[test]
    fn out_of_range_values_rejected() {
        let mut config = LoggerConfig::default();
        config.sync.interval_writes = 0;
        assert!(config.validate().is_err());

        let mut config = LoggerConfig::default();
        config.source.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = LoggerConfig::default();
        config.recovery.max_attempts = Some(0);
        assert!(config.validate().is_err());

        let mut config = LoggerConfig::default();
        config.recovery.initial_backoff_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = LoggerConfig::default();
        config.storage.log_path = "/data.txt".to_string();
        assert!(config.validate().is_err());
    }
}
