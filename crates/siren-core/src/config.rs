//! Application configuration management.
//!
//! Configuration is read from a TOML file and layered with environment
//! overrides of the form `SIREN__<SECTION>__<KEY>` (for example
//! `SIREN__PUSH__ENDPOINT=https://relay.example/send`).
//!
//! The authentication code lifetime is deliberately absent: codes always live
//! for [`CODE_TTL_MINUTES`](crate::codes::CODE_TTL_MINUTES).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SIREN";

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The layered sources could not be merged or deserialised.
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    /// The configuration could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be serialised to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field is invalid.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path, e.g. `alerts.max_attempts`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Where records are persisted.
    pub storage: StorageConfig,
    /// Authentication code bookkeeping.
    pub codes: CodesConfig,
    /// Alert delivery policy.
    pub alerts: AlertsConfig,
    /// Relationship graph policy.
    pub relationships: RelationshipsConfig,
    /// Push gateway selection.
    pub push: PushConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:8080`.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One JSON file per collection under `data_dir`.
    #[default]
    File,
    /// Process memory only; everything is lost on restart.
    Memory,
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Which backend to use.
    pub backend: StorageBackend,
    /// Data directory; defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
}

/// Authentication code bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodesConfig {
    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds a dead (expired, consumed, cancelled) code is kept before purge.
    pub retention_secs: u64,
}

impl Default for CodesConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl CodesConfig {
    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Alert delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertsConfig {
    /// Total delivery attempts per recipient for retryable failures.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after every further attempt.
    pub backoff_multiplier: f64,
    /// Per-attempt timeout for a push gateway call, in milliseconds.
    pub delivery_timeout_ms: u64,
    /// IANA timezone used when rendering the alert text.
    pub timezone: String,
    /// Notification title.
    pub title: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            delivery_timeout_ms: 5_000,
            timezone: "UTC".to_string(),
            title: "SIREN Ring Emergency".to_string(),
        }
    }
}

/// Relationship graph policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelationshipsConfig {
    /// Whether the same contact may be added to an owner more than once.
    pub allow_duplicates: bool,
}

impl Default for RelationshipsConfig {
    fn default() -> Self {
        Self {
            allow_duplicates: true,
        }
    }
}

/// Push gateway implementation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    /// Log notifications instead of sending them (development only).
    #[default]
    Log,
    /// POST notifications to an HTTP push relay.
    Http,
}

/// Push gateway selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PushConfig {
    /// Which gateway to construct.
    pub mode: PushMode,
    /// Relay URL for [`PushMode::Http`].
    pub endpoint: Option<String>,
    /// Bearer token sent to the relay.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    /// HTTP request timeout towards the relay, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            mode: PushMode::Log,
            endpoint: None,
            auth_token: None,
            request_timeout_ms: 4_000,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// JSON rolling files plus compact stdout when `true`.
    pub production: bool,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rolling log files.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            production: false,
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`, layered with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or a
    /// load/validation error if it cannot be used.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::build(Some(path))
    }

    /// Load configuration from `path` if it exists, otherwise defaults,
    /// layered with environment overrides in both cases.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// resulting configuration is invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::build(Some(path))
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Self::build(None)
        }
    }

    fn build(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse configuration from a TOML string without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or the result is invalid.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Save configuration to `path` as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if self.server.bind.parse::<SocketAddr>().is_err() {
            invalid("server.bind", "must be a socket address such as 0.0.0.0:8080");
        }
        if self.codes.sweep_interval_secs == 0 {
            invalid("codes.sweep_interval_secs", "must be at least 1");
        }
        if !(1..=10).contains(&self.alerts.max_attempts) {
            invalid("alerts.max_attempts", "must be between 1 and 10");
        }
        if self.alerts.backoff_multiplier < 1.0 || !self.alerts.backoff_multiplier.is_finite() {
            invalid("alerts.backoff_multiplier", "must be a finite number >= 1.0");
        }
        if self.alerts.delivery_timeout_ms == 0 {
            invalid("alerts.delivery_timeout_ms", "must be at least 1");
        }
        if !is_valid_timezone(&self.alerts.timezone) {
            invalid("alerts.timezone", "must be an IANA timezone name (e.g. Europe/Berlin)");
        }
        if self.alerts.title.trim().is_empty() {
            invalid("alerts.title", "must not be empty");
        }
        if self.push.mode == PushMode::Http {
            match self.push.endpoint.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(_) => invalid("push.endpoint", "must be an http(s) URL"),
                None => invalid("push.endpoint", "is required when push.mode = \"http\""),
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Resolved data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// Returns `true` if `tz` names a known IANA timezone.
#[must_use]
pub fn is_valid_timezone(tz: &str) -> bool {
    tz.parse::<chrono_tz::Tz>().is_ok()
}

/// Default configuration file location.
///
/// Linux servers: `/etc/siren/config.toml`; elsewhere the platform config dir.
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/siren/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "siren").map_or_else(
            || PathBuf::from("./config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

/// Default data directory.
///
/// Linux servers: `/var/lib/siren`; elsewhere the platform data dir.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/siren")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "siren").map_or_else(
            || PathBuf::from("./data"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alerts.max_attempts, 3);
        assert!(config.relationships.allow_duplicates);
        assert_eq!(config.push.mode, PushMode::Log);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [alerts]
            timezone = "Europe/Berlin"

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.alerts.timezone, "Europe/Berlin");
        assert_eq!(config.alerts.max_attempts, 3);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_http_push_requires_endpoint() {
        let err = Config::from_toml_str("[push]\nmode = \"http\"\n").unwrap_err();
        assert!(err.to_string().contains("push.endpoint"));
    }

    #[test]
    fn test_multiple_errors_are_collected() {
        let mut config = Config::default();
        config.alerts.timezone = "Mars/Olympus".to_string();
        config.alerts.max_attempts = 0;
        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_timezone_validation() {
        assert!(is_valid_timezone("America/New_York"));
        assert!(is_valid_timezone("UTC"));
        assert!(!is_valid_timezone("Not/AZone"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.codes.sweep_interval_secs = 5;
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.codes.sweep_interval_secs, 5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/siren.toml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
