//! Outdial Configuration System
//!
//! TOML-based configuration with environment variable override support.

use od_common::OptimizedBatchConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub primary: ProviderEndpointConfig,
    pub secondary: ProviderEndpointConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub dispatch: DispatchSettings,
    pub sweeper: SweeperSettings,
    pub driver: DriverSettings,

    /// Seed a demo campaign into the memory store
    pub dev_mode: bool,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Campaign store backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// memory or sqlite
    #[serde(rename = "type")]
    pub store_type: String,
    /// Database URL for sqlite, e.g. sqlite://data/outdial.db?mode=rwc
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: "memory".to_string(),
            url: "sqlite://data/outdial.db?mode=rwc".to_string(),
        }
    }
}

/// Endpoint of one voice provider. Credentials live on the agent bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpointConfig {
    pub enabled: bool,
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ProviderEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:9000".to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ProviderEndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_secs: u64,
    /// 0 disables the per-call timeout
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_secs: 60,
            call_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }
}

/// Defaults for new campaign queues
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub chunk_size: u32,
    pub concurrency_limit: usize,
    pub max_attempts: u32,
    pub retry_delay_minutes: u32,
    pub delay_between_chunks_ms: u64,
    pub delay_between_calls_ms: u64,
    pub max_processing_time_ms: u64,
    /// Batch expiry when the campaign has none
    pub default_expiry_days: i64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let batch = OptimizedBatchConfig::default();
        Self {
            chunk_size: 50,
            concurrency_limit: batch.concurrency_limit,
            max_attempts: batch.max_attempts,
            retry_delay_minutes: batch.retry_delay_minutes,
            delay_between_chunks_ms: batch.delay_between_chunks_ms,
            delay_between_calls_ms: batch.delay_between_calls_ms,
            max_processing_time_ms: batch.max_processing_time_ms,
            default_expiry_days: 30,
        }
    }
}

impl DispatchSettings {
    pub fn batch_config(&self) -> OptimizedBatchConfig {
        OptimizedBatchConfig {
            concurrency_limit: self.concurrency_limit,
            max_attempts: self.max_attempts,
            retry_delay_minutes: self.retry_delay_minutes,
            delay_between_chunks_ms: self.delay_between_chunks_ms,
            delay_between_calls_ms: self.delay_between_calls_ms,
            max_processing_time_ms: self.max_processing_time_ms,
        }
    }
}

/// Stale recipient sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Recipients in `calling` longer than this are requeued
    pub calling_stale_minutes: u64,
    /// Recipients handed to the primary provider in a batch are requeued
    /// this long after their scheduled dial time
    pub batch_stale_minutes: u64,
    /// Recipients in `queued` longer than this are released
    pub queued_stale_minutes: u64,
    pub batch_limit: u32,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            calling_stale_minutes: 60,
            batch_stale_minutes: 24 * 60,
            queued_stale_minutes: 10,
            batch_limit: 500,
        }
    }
}

/// Background campaign driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub enabled: bool,
    pub workers: usize,
    pub channel_capacity: usize,
    /// How often live queues are re-submitted
    pub tick_interval_secs: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
            channel_capacity: 256,
            tick_interval_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::new().load()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.chunk_size == 0 {
            return Err(ConfigError::ValidationError("dispatch.chunk_size must be > 0".into()));
        }
        if self.dispatch.concurrency_limit == 0 {
            return Err(ConfigError::ValidationError("dispatch.concurrency_limit must be > 0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::ValidationError("circuit_breaker thresholds must be > 0".into()));
        }
        if !matches!(self.store.store_type.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "store.type must be memory or sqlite, got {}",
                self.store.store_type
            )));
        }
        if self.driver.enabled && self.driver.workers == 0 {
            return Err(ConfigError::ValidationError("driver.workers must be > 0".into()));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Outdial Configuration
# Environment variables (OUTDIAL_*) override these settings

dev_mode = false

[http]
port = 8080
host = "0.0.0.0"

[store]
type = "memory"  # memory or sqlite
url = "sqlite://data/outdial.db?mode=rwc"

[primary]
enabled = true
base_url = "http://localhost:9000"
request_timeout_ms = 30000
connect_timeout_ms = 10000

[secondary]
enabled = true
base_url = "http://localhost:9100"
request_timeout_ms = 15000
connect_timeout_ms = 10000

[circuit_breaker]
failure_threshold = 5
success_threshold = 2
reset_timeout_secs = 60
call_timeout_ms = 30000

[dispatch]
chunk_size = 50
concurrency_limit = 5
max_attempts = 3
retry_delay_minutes = 30
delay_between_chunks_ms = 1000
delay_between_calls_ms = 100
max_processing_time_ms = 25000
default_expiry_days = 30

[sweeper]
enabled = true
interval_secs = 60
calling_stale_minutes = 60
batch_stale_minutes = 1440
queued_stale_minutes = 10
batch_limit = 500

[driver]
enabled = true
workers = 4
channel_capacity = 256
tick_interval_secs = 60
"#
        .to_string()
    }
}
