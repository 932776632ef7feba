//! Configuration management for the resize client.
//!
//! Everything here is fixed per deployment, never per request: where grants
//! are issued, where the pipeline deposits results, and how long to wait.

use crate::object_key::LegacyKeyStyle;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the resize client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Issuing endpoint configuration
    #[serde(default)]
    pub issuer: IssuerConfig,

    /// Output bucket and key layout
    #[serde(default)]
    pub output: OutputConfig,

    /// Poll loop configuration
    #[serde(default)]
    pub polling: PollingConfig,

    /// Initial transform parameters for a new session
    #[serde(default)]
    pub transform: TransformDefaults,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Issuing endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    /// Base address of the API serving `/get-upload-url`
    #[serde(default = "default_issuer_base_url")]
    pub base_url: String,

    /// Timeout applied to every HTTP request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Where the pipeline writes its results.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Output bucket name
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Bucket region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (path-style, for MinIO, LocalStack, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Output format written by the pipeline (extension of every result)
    #[serde(default = "default_output_format")]
    pub format: String,

    /// Marker prefixed to the parameter segment of predicted keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How legacy `quality<N>/` keys are rewritten
    #[serde(default)]
    pub legacy_key_style: LegacyKeyStyle,
}

/// Poll loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Delay between existence probes in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Maximum number of probes before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Transform parameters a fresh session starts with.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformDefaults {
    #[serde(default = "default_quality")]
    pub quality: u8,

    #[serde(default = "default_max_width")]
    pub max_width: u32,

    #[serde(default = "default_max_height")]
    pub max_height: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_issuer_base_url() -> String {
    "https://13rp2fscr2.execute-api.eu-north-1.amazonaws.com/api".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_bucket() -> String {
    "vyomuchat-image-resizer-output".to_string()
}
fn default_region() -> String {
    "eu-north-1".to_string()
}
fn default_output_format() -> String {
    "jpeg".to_string()
}
fn default_key_prefix() -> String {
    "resized-".to_string()
}
fn default_interval_ms() -> u64 {
    2000
}
fn default_max_attempts() -> u32 {
    15
}
fn default_quality() -> u8 {
    85
}
fn default_max_width() -> u32 {
    800
}
fn default_max_height() -> u32 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            base_url: default_issuer_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            format: default_output_format(),
            key_prefix: default_key_prefix(),
            legacy_key_style: LegacyKeyStyle::default(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for TransformDefaults {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            max_width: default_max_width(),
            max_height: default_max_height(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (e.g., RESIZE_CLIENT__POLLING__MAX_ATTEMPTS)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("RESIZE_CLIENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("RESIZE_CLIENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.issuer.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "issuer.base_url".to_string(),
            ));
        }
        if !self.issuer.base_url.starts_with("http://")
            && !self.issuer.base_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "issuer.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.output.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("output.bucket".to_string()));
        }
        if self.output.format.is_empty() {
            return Err(ConfigValidationError::MissingField("output.format".to_string()));
        }

        if self.polling.interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "polling.interval_ms".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }
        if self.polling.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "polling.max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if !(1..=100).contains(&self.transform.quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "transform.quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }
        if self.transform.max_width == 0 || self.transform.max_height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "transform.max_width/max_height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl IssuerConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Full URL of the grant endpoint.
    pub fn grant_url(&self) -> String {
        format!("{}/get-upload-url", self.base_url.trim_end_matches('/'))
    }
}

impl OutputConfig {
    /// Public URL of an object in the output bucket.
    pub fn object_url(&self, key: &str) -> String {
        match self.endpoint_url {
            Some(ref endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket,
                key
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

impl PollingConfig {
    /// Get probe interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
