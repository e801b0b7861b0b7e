//! Configuration module for the export pipeline.
//!
//! Configuration is layered with the `config` crate: built-in defaults, then
//! optional config files, then `EXPORT__*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use config::ConfigError;

/// Errors raised when a loaded configuration is unusable
#[derive(Error, Debug)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// What to do with a media file that could not be fetched after all retries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailurePolicy {
    /// Log and drop the file, keep exporting
    #[default]
    BestEffort,
    /// Abort the whole export
    FailJob,
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the curation backend
    #[serde(default = "default_host")]
    pub host: String,
    /// Value of the `X-Request-Service-Id` header
    #[serde(default)]
    pub service_id: String,
    /// Pre-issued bearer token
    #[serde(default)]
    pub access_token: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Maximum datarow ids sent in one `id_set` filter
    #[serde(default = "default_id_chunk_size")]
    pub id_chunk_size: usize,
}

fn default_host() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    50
}

fn default_id_chunk_size() -> usize {
    1000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            service_id: String::new(),
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            page_size: default_page_size(),
            id_chunk_size: default_id_chunk_size(),
        }
    }
}

/// Export pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Datarows per flush batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent media downloads
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Concurrent local file writes
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
    /// Total download attempts per media file
    #[serde(default = "default_fetch_max_attempts")]
    pub fetch_max_attempts: u32,
    /// Delay before the first retry, doubled on each following retry
    #[serde(default = "default_fetch_initial_delay_ms")]
    pub fetch_initial_delay_ms: u64,
    #[serde(default)]
    pub fetch_failure_policy: FetchFailurePolicy,
}

fn default_batch_size() -> usize {
    50
}

// Lower these on hosts with a small open-file limit.
fn default_fetch_concurrency() -> usize {
    100
}

fn default_write_concurrency() -> usize {
    100
}

fn default_fetch_max_attempts() -> u32 {
    5
}

fn default_fetch_initial_delay_ms() -> u64 {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fetch_concurrency: default_fetch_concurrency(),
            write_concurrency: default_write_concurrency(),
            fetch_max_attempts: default_fetch_max_attempts(),
            fetch_initial_delay_ms: default_fetch_initial_delay_ms(),
            fetch_failure_policy: FetchFailurePolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Get the first retry delay as Duration
    pub fn fetch_initial_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_initial_delay_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Main configuration for the export service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExportConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub export: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExportConfig {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/export.{toml,yaml,json}`
    /// 2. `/etc/dataverse/export.{toml,yaml,json}`
    /// 3. Environment variables, e.g. `EXPORT__BACKEND__HOST`
    pub fn load() -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config/export").required(false))
            .add_source(config::File::with_name("/etc/dataverse/export").required(false))
            .add_source(
                config::Environment::with_prefix("EXPORT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("EXPORT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Get backend request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.backend.host.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "backend.host".to_string(),
            ));
        }
        if !self.backend.host.starts_with("http://") && !self.backend.host.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                key: "backend.host".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        let positive = [
            ("backend.page_size", self.backend.page_size),
            ("backend.id_chunk_size", self.backend.id_chunk_size),
            ("export.batch_size", self.export.batch_size),
            ("export.fetch_concurrency", self.export.fetch_concurrency),
            ("export.write_concurrency", self.export.write_concurrency),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.export.fetch_max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                key: "export.fetch_max_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExportConfig::default();
        assert_eq!(config.export.batch_size, 50);
        assert_eq!(config.export.fetch_concurrency, 100);
        assert_eq!(config.export.fetch_max_attempts, 5);
        assert_eq!(config.export.fetch_failure_policy, FetchFailurePolicy::BestEffort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = ExportConfig::default();
        config.export.write_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { key, .. }) if key == "export.write_concurrency"
        ));
    }

    #[test]
    fn test_host_scheme_required() {
        let mut config = ExportConfig::default();
        config.backend.host = "backend.local".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_failure_policy_deserialize() {
        let policy: FetchFailurePolicy = serde_json::from_str("\"fail_job\"").unwrap();
        assert_eq!(policy, FetchFailurePolicy::FailJob);
    }
}
