//! Configuration for the telemetry pipelines
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - `AMPYOBS_*` environment variable overrides
//! - Validation before anything is started

use crate::cardinality::LabelSchema;
use crate::redaction::{RedactionRule, Redactor, DEFAULT_MARKER};
use crate::resource::{default_instance_id, Resource};
use crate::retry::RetryPolicy;
use crate::sampler::{Sampler, DEFAULT_SAMPLE_RATIO};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default collector base URL (OTLP/HTTP port)
pub const DEFAULT_COLLECTOR_ENDPOINT: &str = "http://localhost:4318";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Level for the library's own diagnostics and the log pipeline threshold
    pub log_level: String,

    pub service: ServiceSettings,
    pub collector: CollectorSettings,
    pub sampling: SamplingSettings,
    pub redaction: RedactionSettings,
    pub buffer: BufferSettings,
    pub retry: RetrySettings,
    pub shutdown: ShutdownSettings,

    /// Extra allowed metric label values, keyed by label name
    pub labels: BTreeMap<String, Vec<String>>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            service: ServiceSettings::default(),
            collector: CollectorSettings::default(),
            sampling: SamplingSettings::default(),
            redaction: RedactionSettings::default(),
            buffer: BufferSettings::default(),
            retry: RetrySettings::default(),
            shutdown: ShutdownSettings::default(),
            labels: BTreeMap::new(),
        }
    }
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub name: String,
    pub version: String,
    /// dev, paper or prod
    pub environment: String,
    /// Defaults to the hostname
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "ampy-service".to_string(),
            version: String::new(),
            environment: "dev".to_string(),
            instance_id: None,
            region: None,
        }
    }
}

impl ServiceSettings {
    pub fn resource(&self) -> Resource {
        let mut resource = Resource::new(&self.name, &self.environment)
            .with_version(&self.version)
            .with_instance_id(
                self.instance_id
                    .clone()
                    .unwrap_or_else(default_instance_id),
            );
        if let Some(region) = &self.region {
            resource = resource.with_region(region);
        }
        resource
    }
}

/// Where batches are sent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Base URL; `host:port` is accepted and normalized
    pub endpoint: String,
    /// http, jsonl or stdout
    pub protocol: String,
    /// Output file for the jsonl protocol
    pub jsonl_path: String,
    /// Append to an existing jsonl file
    pub jsonl_append: bool,
    pub timeout_ms: u64,
    pub gzip: bool,
    /// Extra request headers for the http protocol
    pub headers: BTreeMap<String, String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_COLLECTOR_ENDPOINT.to_string(),
            protocol: "http".to_string(),
            jsonl_path: "ampyobs.jsonl".to_string(),
            jsonl_append: true,
            timeout_ms: 10_000,
            gzip: false,
            headers: BTreeMap::new(),
        }
    }
}

impl CollectorSettings {
    pub fn normalized_endpoint(&self) -> String {
        normalize_endpoint(&self.endpoint)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// parent (default ratio), ratio (configured ratio), always_on, always_off
    pub sampler: String,
    pub ratio: f64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            sampler: "parent".to_string(),
            ratio: DEFAULT_SAMPLE_RATIO,
        }
    }
}

impl SamplingSettings {
    /// All kinds are parent-based; they differ only in the root ratio
    pub fn sampler(&self) -> Sampler {
        match self.sampler.to_lowercase().as_str() {
            "ratio" => Sampler::ratio_based(self.ratio),
            "always_on" => Sampler::always_on(),
            "always_off" => Sampler::always_off(),
            _ => Sampler::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionSettings {
    pub marker: String,
    /// Append the built-in rules after the configured ones
    pub include_defaults: bool,
    pub rules: Vec<RedactionRule>,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            include_defaults: true,
            rules: Vec::new(),
        }
    }
}

impl RedactionSettings {
    pub fn redactor(&self) -> Result<Redactor, crate::redaction::RedactionError> {
        if self.include_defaults {
            Redactor::with_custom_rules(&self.rules, &self.marker)
        } else {
            Redactor::new(&self.rules, &self.marker)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub logs_capacity: usize,
    pub metrics_capacity: usize,
    pub traces_capacity: usize,
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Period of self-metric emission into the metrics pipeline; 0 disables it
    pub self_metrics_interval_ms: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            logs_capacity: 2048,
            metrics_capacity: 2048,
            traces_capacity: 2048,
            max_batch_size: 512,
            batch_timeout_ms: 5_000,
            self_metrics_interval_ms: 10_000,
        }
    }
}

impl BufferSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            attempt_timeout_ms: policy.attempt_timeout.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Forced flush window per signal
    pub flush_deadline_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            flush_deadline_ms: 5_000,
        }
    }
}

impl ShutdownSettings {
    pub fn flush_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_deadline_ms)
    }
}

impl TelemetryConfig {
    /// Check every setting that could otherwise fail later
    pub fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.log_level, valid_levels
            )));
        }

        if self.service.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Service name cannot be empty".to_string(),
            ));
        }

        let valid_protocols = ["http", "jsonl", "stdout"];
        if !valid_protocols.contains(&self.collector.protocol.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid collector protocol: {}. Must be one of: {:?}",
                self.collector.protocol, valid_protocols
            )));
        }

        let valid_samplers = ["parent", "ratio", "always_on", "always_off"];
        if !valid_samplers.contains(&self.sampling.sampler.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid sampler: {}. Must be one of: {:?}",
                self.sampling.sampler, valid_samplers
            )));
        }

        let capacities = [
            ("logs", self.buffer.logs_capacity),
            ("metrics", self.buffer.metrics_capacity),
            ("traces", self.buffer.traces_capacity),
        ];
        for (signal, capacity) in capacities {
            if capacity == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Buffer capacity for {} cannot be 0",
                    signal
                )));
            }
            if self.buffer.max_batch_size > capacity {
                return Err(ConfigError::ValidationError(format!(
                    "max_batch_size {} exceeds {} capacity {}",
                    self.buffer.max_batch_size, signal, capacity
                )));
            }
        }
        if self.buffer.max_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_batch_size cannot be 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        self.redaction
            .redactor()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        LabelSchema::from_config(&self.labels)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(())
    }
}

/// Turn a configured endpoint into a base URL.
///
/// Empty means the default collector; `host:port` and `:port` get an
/// `http://` scheme (and `localhost` for a bare port); trailing slashes go.
pub fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_COLLECTOR_ENDPOINT.to_string();
    }
    let url = if trimmed.contains("://") {
        trimmed.to_string()
    } else if let Some(port) = trimmed.strip_prefix(':') {
        format!("http://localhost:{}", port)
    } else {
        format!("http://{}", trimmed)
    };
    url.trim_end_matches('/').to_string()
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. AMPYOBS_CONFIG environment variable
    /// 3. ~/.config/ampyobs/config.toml
    /// 4. /etc/ampyobs/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<TelemetryConfig> {
        let config_path = self.find_config_file()?;

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            TelemetryConfig::default()
        };

        self.apply_env_overrides(&mut config);

        config.validate()?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Ok(env_path) = std::env::var("AMPYOBS_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("AMPYOBS_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Ok(Some(path));
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/ampyobs/config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<TelemetryConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: TelemetryConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut TelemetryConfig) {
        apply_overrides(config, |key| std::env::var(key).ok());
    }

    /// Save configuration to a file
    pub fn save(&self, config: &TelemetryConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ampyobs").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// `AMPYOBS_*` overrides read through `lookup`
fn apply_overrides(config: &mut TelemetryConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("AMPYOBS_SERVICE_NAME") {
        config.service.name = val;
    }
    if let Some(val) = lookup("AMPYOBS_SERVICE_VERSION") {
        config.service.version = val;
    }
    if let Some(val) = lookup("AMPYOBS_ENVIRONMENT") {
        config.service.environment = val;
    }
    if let Some(val) = lookup("AMPYOBS_COLLECTOR_ENDPOINT") {
        config.collector.endpoint = val;
    }
    if let Some(val) = lookup("AMPYOBS_COLLECTOR_PROTOCOL") {
        config.collector.protocol = val;
    }
    if let Some(val) = lookup("AMPYOBS_SAMPLER") {
        config.sampling.sampler = val;
    }
    if let Some(val) = lookup("AMPYOBS_SAMPLE_RATIO") {
        match val.parse() {
            Ok(ratio) => config.sampling.ratio = ratio,
            Err(_) => warn!("Ignoring unparsable AMPYOBS_SAMPLE_RATIO: {}", val),
        }
    }
    if let Some(val) = lookup("AMPYOBS_LOG_LEVEL") {
        config.log_level = val;
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(target_os = "windows"))]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.collector.endpoint, "http://localhost:4318");
        assert_eq!(config.sampling.sampler, "parent");
        assert_eq!(config.sampling.ratio, 0.25);
        assert_eq!(config.buffer.traces_capacity, 2048);
        assert_eq!(config.buffer.max_batch_size, 512);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.shutdown.flush_deadline(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            log_level = "debug"

            [service]
            name = "oms"
        "#;
        let config: TelemetryConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.service.name, "oms");
        assert_eq!(config.service.environment, "dev");
        assert_eq!(config.collector.protocol, "http");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            log_level = "warn"

            [service]
            name = "broker-gateway"
            version = "2.1.0"
            environment = "paper"
            instance_id = "gw-1"
            region = "us-east-1"

            [collector]
            endpoint = "otel-collector:4318"
            protocol = "http"
            gzip = true

            [collector.headers]
            x-tenant = "ampy"

            [sampling]
            sampler = "ratio"
            ratio = 0.5

            [redaction]
            marker = "***"
            include_defaults = false

            [[redaction.rules]]
            pattern = "^account$"
            scope = "logs"

            [[redaction.rules]]
            pattern = "acct-[0-9]+"
            target = "value"

            [buffer]
            traces_capacity = 4096
            max_batch_size = 256

            [retry]
            max_attempts = 3

            [labels]
            broker = ["alpaca", "ibkr"]
            topic = ["ampy/paper/orders/v1"]
        "#;

        let config: TelemetryConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.environment, "paper");
        assert_eq!(config.collector.normalized_endpoint(), "http://otel-collector:4318");
        assert!(config.collector.gzip);
        assert_eq!(config.collector.headers.get("x-tenant").map(String::as_str), Some("ampy"));
        assert_eq!(config.sampling.sampler().ratio(), 0.5);
        assert_eq!(config.redaction.rules.len(), 2);
        assert_eq!(config.buffer.traces_capacity, 4096);
        assert_eq!(config.retry.policy().max_attempts, 3);
        assert_eq!(config.labels["broker"], vec!["alpaca", "ibkr"]);
        assert!(config.validate().is_ok());

        let redactor = config.redaction.redactor().unwrap();
        assert_eq!(redactor.rules().count(), 2);
        assert_eq!(redactor.marker(), "***");

        let resource = config.service.resource();
        assert_eq!(resource.instance_id, "gw-1");
        assert_eq!(resource.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = TelemetryConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = TelemetryConfig::default();
        config.collector.protocol = "grpc".to_string();
        assert!(config.validate().is_err());

        config = TelemetryConfig::default();
        config.sampling.sampler = "tail".to_string();
        assert!(config.validate().is_err());

        config = TelemetryConfig::default();
        config.buffer.logs_capacity = 0;
        assert!(config.validate().is_err());

        config = TelemetryConfig::default();
        config.buffer.max_batch_size = 4096;
        assert!(config.validate().is_err());

        config = TelemetryConfig::default();
        config.redaction.rules.push(RedactionRule::key("(broken"));
        assert!(config.validate().is_err());

        config = TelemetryConfig::default();
        config.labels.insert("symbol".to_string(), vec!["AAPL".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_ratio_falls_back_instead_of_failing() {
        let mut config = TelemetryConfig::default();
        config.sampling.sampler = "ratio".to_string();
        config.sampling.ratio = 3.0;
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.sampler().ratio(), DEFAULT_SAMPLE_RATIO);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AMPYOBS_SERVICE_NAME", "signals"),
            ("AMPYOBS_ENVIRONMENT", "prod"),
            ("AMPYOBS_COLLECTOR_ENDPOINT", ":4318"),
            ("AMPYOBS_SAMPLER", "ratio"),
            ("AMPYOBS_SAMPLE_RATIO", "0.1"),
            ("AMPYOBS_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = TelemetryConfig::default();
        apply_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.service.name, "signals");
        assert_eq!(config.service.environment, "prod");
        assert_eq!(config.collector.normalized_endpoint(), "http://localhost:4318");
        assert_eq!(config.sampling.sampler().ratio(), 0.1);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint(""), DEFAULT_COLLECTOR_ENDPOINT);
        assert_eq!(normalize_endpoint("collector:4318"), "http://collector:4318");
        assert_eq!(normalize_endpoint("https://otel.example.com/"), "https://otel.example.com");
        assert_eq!(normalize_endpoint(":9999"), "http://localhost:9999");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = TelemetryConfig::default();
        config.service.name = "ingest".to_string();
        config.labels.insert("topic".to_string(), vec!["ampy/dev/bars/v1".to_string()]);
        config.redaction.rules.push(RedactionRule::value("acct-[0-9]+"));

        let loader = ConfigLoader::new().with_cli_path(Some(path.clone()));
        loader.save(&config, &path).unwrap();

        let loaded = loader.load_from_file(&path).unwrap();
        assert_eq!(loaded.service.name, "ingest");
        assert_eq!(loaded.labels["topic"], vec!["ampy/dev/bars/v1"]);
        assert_eq!(loaded.redaction.rules, config.redaction.rules);
    }

    #[test]
    fn test_missing_cli_path_is_an_error() {
        let loader = ConfigLoader::new().with_cli_path(Some(PathBuf::from("/nonexistent/ampyobs.toml")));
        assert!(matches!(loader.load(), Err(ConfigError::NotFound(_))));
    }
}
