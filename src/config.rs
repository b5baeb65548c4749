//! Configuration surface.
//!
//! Loaded from TOML. Every section and field is optional; missing values take
//! the defaults below. Durations are written as (possibly fractional) seconds.
//!
//! ```toml
//! [server]
//! address = "0.0.0.0:4000"
//! idle_timeout = 60
//! read_timeout = 10
//! write_timeout = 30
//! shutdown_grace = 5
//!
//! [rate_limit]
//! enabled = true
//! requests_per_second = 2.0
//! burst = 4
//!
//! [sweep]
//! interval = 60
//! idle_threshold = 180
//!
//! [logging]
//! filter = "info"
//! format = "pretty"
//! ```

use crate::application::store::RateLimiterStore;
use crate::application::sweeper::SweepConfig;
use crate::domain::bucket::Quota;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub sweep: SweepSettings,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.rate_limit.validate()?;
        self.sweep.validate()?;
        Ok(())
    }
}

/// Listener and lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind, `host:port`
    pub address: String,
    /// Close a connection after this long without socket activity
    #[serde(with = "seconds")]
    pub idle_timeout: Duration,
    /// Deadline for reading a request's headers
    #[serde(with = "seconds")]
    pub read_timeout: Duration,
    /// Deadline for producing a response
    #[serde(with = "seconds")]
    pub write_timeout: Duration,
    /// Upper bound on connection draining at shutdown
    #[serde(with = "seconds")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:4000".to_string(),
            idle_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Default settings listening on `address`.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Reject an empty address and zero durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("server.address must not be empty".into()));
        }
        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("shutdown_grace", self.shutdown_grace),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "server.{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Per-client rate limiting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 2.0,
            burst: 4,
        }
    }
}

impl RateLimitConfig {
    /// The quota to enforce, or `None` when limiting is disabled.
    pub fn quota(&self) -> Result<Option<Quota>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        Quota::new(self.requests_per_second, self.burst)
            .map(Some)
            .map_err(|err| ConfigError::Invalid(format!("rate_limit: {err}")))
    }

    /// Validate the quota when limiting is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quota().map(|_| ())
    }

    /// Build a store with the system clock and default storage.
    pub fn build_store(&self) -> Result<RateLimiterStore, ConfigError> {
        Ok(match self.quota()? {
            Some(quota) => RateLimiterStore::new(quota),
            None => RateLimiterStore::disabled(),
        })
    }
}

/// Eviction sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepSettings {
    #[serde(with = "seconds")]
    pub interval: Duration,
    #[serde(with = "seconds")]
    pub idle_threshold: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        let defaults = SweepConfig::default();
        Self {
            interval: defaults.interval,
            idle_threshold: defaults.idle_threshold,
        }
    }
}

impl SweepSettings {
    /// Convert into a validated [`SweepConfig`].
    pub fn sweep_config(&self) -> Result<SweepConfig, ConfigError> {
        SweepConfig::new(self.interval, self.idle_threshold)
            .map_err(|err| ConfigError::Invalid(format!("sweep: {err}")))
    }

    /// Reject zero durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sweep_config().map(|_| ())
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Serde adapter for durations written as seconds.
mod seconds {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid duration of {secs} seconds")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_constants() {
        let config = RuntimeConfig::default();
        assert_eq!(config.server.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.server.read_timeout, Duration::from_secs(10));
        assert_eq!(config.server.write_timeout, Duration::from_secs(30));
        assert_eq!(config.server.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.sweep.interval, Duration::from_secs(60));
        assert_eq!(config.sweep.idle_threshold, Duration::from_secs(180));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fractional_seconds() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [server]
            shutdown_grace = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(config.server.shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_negative_duration_is_a_parse_error() {
        let err = RuntimeConfig::from_toml_str("[sweep]\ninterval = -1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_disabled_limit_skips_quota_validation() {
        let config = RateLimitConfig {
            enabled: false,
            requests_per_second: 0.0,
            burst: 0,
        };
        assert!(config.validate().is_ok());
        assert!(!config.build_store().unwrap().is_enabled());
    }
}
