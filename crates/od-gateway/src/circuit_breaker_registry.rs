//! Circuit Breaker Registry - one breaker per provider name
//!
//! The registry is an explicit object shared by `Arc` between the gateway,
//! the engine and the HTTP API, so breaker state survives across chunks.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get or create the breaker for `name` with the registry defaults
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone()))),
        )
    }

    /// Register a breaker with its own settings. An existing breaker is kept.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Stats for every breaker, sorted by name
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn get_stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.breakers.read().get(name).map(|b| b.stats())
    }

    /// Reset a specific circuit breaker
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.read().get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Get count of open circuit breakers
    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .count()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_get_or_create_returns_shared_instance() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("primary");
        let b = registry.get_or_create("primary");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.stats().len(), 1);
    }

    #[test]
    fn test_open_count_and_reset() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            call_timeout: None,
        });

        registry.get_or_create("primary").record_failure();
        registry.get_or_create("secondary");
        assert_eq!(registry.open_count(), 1);

        assert!(registry.reset("primary"));
        assert_eq!(registry.open_count(), 0);
        assert!(!registry.reset("unknown"));
    }

    #[test]
    fn test_custom_config_kept_for_existing_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let custom = CircuitBreakerConfig {
            failure_threshold: 9,
            ..Default::default()
        };
        registry.get_or_create_with("secondary", custom.clone());
        let again = registry.get_or_create_with("secondary", CircuitBreakerConfig::default());
        assert_eq!(again.config().failure_threshold, 9);
    }

    #[test]
    fn test_stats_sorted_by_name() {
        let registry = CircuitBreakerRegistry::default();
        registry.get_or_create("secondary");
        registry.get_or_create("primary");
        let names: Vec<_> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["primary", "secondary"]);
    }
}
