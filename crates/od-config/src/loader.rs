//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "outdial.toml",
    "config.toml",
    "./config/outdial.toml",
    "./config/config.toml",
    "/etc/outdial/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("OUTDIAL_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_parsed<T: FromStr>(target: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
        *target = parsed;
    }
}

fn set_string(target: &mut String, value: Option<String>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Apply `OUTDIAL_*` overrides read through `lookup`
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // HTTP
    set_parsed(&mut config.http.port, lookup("OUTDIAL_HTTP_PORT"));
    set_string(&mut config.http.host, lookup("OUTDIAL_HTTP_HOST"));

    // Store
    set_string(&mut config.store.store_type, lookup("OUTDIAL_STORE_TYPE"));
    set_string(&mut config.store.url, lookup("OUTDIAL_STORE_URL"));

    // Providers
    set_parsed(&mut config.primary.enabled, lookup("OUTDIAL_PRIMARY_ENABLED"));
    set_string(&mut config.primary.base_url, lookup("OUTDIAL_PRIMARY_BASE_URL"));
    set_parsed(&mut config.primary.request_timeout_ms, lookup("OUTDIAL_PRIMARY_TIMEOUT_MS"));
    set_parsed(&mut config.secondary.enabled, lookup("OUTDIAL_SECONDARY_ENABLED"));
    set_string(&mut config.secondary.base_url, lookup("OUTDIAL_SECONDARY_BASE_URL"));
    set_parsed(&mut config.secondary.request_timeout_ms, lookup("OUTDIAL_SECONDARY_TIMEOUT_MS"));

    // Circuit breaker
    set_parsed(&mut config.circuit_breaker.failure_threshold, lookup("OUTDIAL_BREAKER_FAILURE_THRESHOLD"));
    set_parsed(&mut config.circuit_breaker.success_threshold, lookup("OUTDIAL_BREAKER_SUCCESS_THRESHOLD"));
    set_parsed(&mut config.circuit_breaker.reset_timeout_secs, lookup("OUTDIAL_BREAKER_RESET_SECS"));
    set_parsed(&mut config.circuit_breaker.call_timeout_ms, lookup("OUTDIAL_BREAKER_CALL_TIMEOUT_MS"));

    // Dispatch
    set_parsed(&mut config.dispatch.chunk_size, lookup("OUTDIAL_CHUNK_SIZE"));
    set_parsed(&mut config.dispatch.concurrency_limit, lookup("OUTDIAL_CONCURRENCY_LIMIT"));
    set_parsed(&mut config.dispatch.max_attempts, lookup("OUTDIAL_MAX_ATTEMPTS"));
    set_parsed(&mut config.dispatch.delay_between_calls_ms, lookup("OUTDIAL_DELAY_BETWEEN_CALLS_MS"));
    set_parsed(&mut config.dispatch.max_processing_time_ms, lookup("OUTDIAL_MAX_PROCESSING_TIME_MS"));

    // Sweeper / driver
    set_parsed(&mut config.sweeper.enabled, lookup("OUTDIAL_SWEEPER_ENABLED"));
    set_parsed(&mut config.sweeper.interval_secs, lookup("OUTDIAL_SWEEPER_INTERVAL_SECS"));
    set_parsed(&mut config.driver.enabled, lookup("OUTDIAL_DRIVER_ENABLED"));
    set_parsed(&mut config.driver.workers, lookup("OUTDIAL_DRIVER_WORKERS"));

    set_parsed(&mut config.dev_mode, lookup("OUTDIAL_DEV_MODE"));
}
