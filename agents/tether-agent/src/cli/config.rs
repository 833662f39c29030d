//! Configuration module
//!
//! Handles loading and validating agent configuration from TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ClientError;

/// Main configuration structure for the Tether Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier stamped on every shipped record
    #[serde(default = "default_source_id")]
    pub source_id: String,

    /// Collector connection settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Batch shipping settings
    #[serde(default)]
    pub shipping: ShippingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Base URL of the collector
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path logs are posted to
    #[serde(default = "default_logs_path")]
    pub logs_path: String,

    /// Path requested by the health check
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Base64-encoded client certificate (DER)
    #[serde(default)]
    pub certificate: Option<String>,

    /// File holding the base64-encoded client certificate
    #[serde(default)]
    pub certificate_file: Option<PathBuf>,

    /// Maximum idle pooled connections kept per host
    #[serde(default = "default_max_connections")]
    pub max_connections_per_host: usize,

    /// Lifetime of a pooled connection before it is rebuilt
    #[serde(default = "default_connection_lifetime")]
    pub pooled_connection_lifetime_secs: u64,

    /// Idle timeout for pooled connections
    #[serde(default = "default_idle_timeout")]
    pub pooled_connection_idle_timeout_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a healthy check result is trusted
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Attempts per operation, including the first one
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Delay before the first retry, doubled on each further retry
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

/// Batch shipping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingConfig {
    /// Enable log shipping
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Records per upload
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep between batch cycles in milliseconds
    #[serde(default = "default_processing_interval")]
    pub processing_interval_ms: u64,

    /// Failed uploads tolerated per record before it is dropped
    #[serde(default = "default_max_record_retries")]
    pub max_record_retries: u32,

    /// Time allowed for the worker to stop on shutdown
    #[serde(default = "default_worker_join_timeout")]
    pub worker_join_timeout_ms: u64,

    /// Time allowed for in-flight uploads on shutdown
    #[serde(default = "default_pending_upload_timeout")]
    pub pending_upload_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_source_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_logs_path() -> String {
    "/api/logs".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_max_connections() -> usize {
    10
}

fn default_connection_lifetime() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_processing_interval() -> u64 {
    1000
}

fn default_max_record_retries() -> u32 {
    3
}

fn default_worker_join_timeout() -> u64 {
    5000
}

fn default_pending_upload_timeout() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            logs_path: default_logs_path(),
            health_path: default_health_path(),
            certificate: None,
            certificate_file: None,
            max_connections_per_host: default_max_connections(),
            pooled_connection_lifetime_secs: default_connection_lifetime(),
            pooled_connection_idle_timeout_secs: default_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            batch_size: default_batch_size(),
            processing_interval_ms: default_processing_interval(),
            max_record_retries: default_max_record_retries(),
            worker_join_timeout_ms: default_worker_join_timeout(),
            pending_upload_timeout_ms: default_pending_upload_timeout(),
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

impl CollectorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pooled_connection_lifetime(&self) -> Duration {
        Duration::from_secs(self.pooled_connection_lifetime_secs)
    }

    pub fn pooled_connection_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pooled_connection_idle_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Resolve the base64 certificate text, inline value first.
    pub fn load_certificate(&self) -> Result<String, ClientError> {
        if let Some(inline) = self.certificate.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok(inline.trim().to_string());
        }

        let path = self.certificate_file.as_ref().ok_or_else(|| {
            ClientError::InvalidConfig("no client certificate configured".to_string())
        })?;

        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::InvalidConfig(format!(
                "failed to read certificate file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(content.trim().to_string())
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.base_url.trim().is_empty() {
            return Err(ClientError::InvalidConfig("collector.base_url is empty".into()));
        }
        if self.max_connections_per_host == 0 {
            return Err(ClientError::InvalidConfig(
                "collector.max_connections_per_host must be positive".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ClientError::InvalidConfig(
                "collector.request_timeout_secs must be positive".into(),
            ));
        }
        if self.pooled_connection_lifetime_secs == 0 {
            return Err(ClientError::InvalidConfig(
                "collector.pooled_connection_lifetime_secs must be positive".into(),
            ));
        }
        if self.pooled_connection_idle_timeout_secs == 0 {
            return Err(ClientError::InvalidConfig(
                "collector.pooled_connection_idle_timeout_secs must be positive".into(),
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(ClientError::InvalidConfig(
                "collector.health_check_interval_secs must be positive".into(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(ClientError::InvalidConfig(
                "collector.max_retry_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl ShippingConfig {
    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    pub fn pending_upload_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_upload_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.batch_size == 0 {
            return Err(ClientError::InvalidConfig(
                "shipping.batch_size must be positive".into(),
            ));
        }
        if self.processing_interval_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "shipping.processing_interval_ms must be positive".into(),
            ));
        }
        if self.max_record_retries == 0 {
            return Err(ClientError::InvalidConfig(
                "shipping.max_record_retries must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            source_id: default_source_id(),
            collector: CollectorConfig::default(),
            shipping: ShippingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ClientError> {
        self.collector.validate()?;
        self.shipping.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default_config();
        assert!(!config.source_id.is_empty());
        assert_eq!(config.collector.base_url, "http://localhost:8080");
        assert_eq!(config.collector.logs_path, "/api/logs");
        assert_eq!(config.shipping.batch_size, 100);
        assert_eq!(config.shipping.max_record_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_content = r#"
            source_id = "worker-7"

            [shipping]
            batch_size = 25
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.source_id, "worker-7");
        assert_eq!(config.shipping.batch_size, 25);
        assert_eq!(config.shipping.processing_interval_ms, 1000);
        assert_eq!(config.collector.health_path, "/health");
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut config = Config::default_config();
        config.shipping.batch_size = 0;
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = Config::default_config();
        config.shipping.processing_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_idle_timeout() {
        let mut config = Config::default_config();
        config.collector.pooled_connection_idle_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_health_check_interval() {
        let mut config = Config::default_config();
        config.collector.health_check_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_dev_config_references_no_missing_files() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let config = Config::load(root.join("config/dev.toml")).unwrap();

        assert!(config.validate().is_ok());
        if let Some(file) = &config.collector.certificate_file {
            assert!(root.join(file).exists(), "{} is missing", file.display());
        }
    }

    #[test]
    fn test_load_certificate_prefers_inline() {
        let mut collector = CollectorConfig::default();
        collector.certificate = Some("  QUJD  ".to_string());
        collector.certificate_file = Some(PathBuf::from("/does/not/exist"));
        assert_eq!(collector.load_certificate().unwrap(), "QUJD");
    }

    #[test]
    fn test_load_certificate_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.b64");
        std::fs::write(&path, "QUJD\n").unwrap();

        let mut collector = CollectorConfig::default();
        collector.certificate_file = Some(path);
        assert_eq!(collector.load_certificate().unwrap(), "QUJD");
    }

    #[test]
    fn test_missing_certificate_is_config_error() {
        let collector = CollectorConfig::default();
        assert!(matches!(
            collector.load_certificate(),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");

        let mut config = Config::default_config();
        config.collector.base_url = "https://collector.example.com".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.collector.base_url, "https://collector.example.com");
    }
}
