//! Circuit breaker protecting calls to one external provider
//!
//! State machine:
//! - `Closed` → `Open` after `failure_threshold` consecutive failures
//! - `Open` → `HalfOpen` once `reset_timeout` has elapsed since the last failure
//! - `HalfOpen` → `Closed` after `success_threshold` consecutive successes
//! - `HalfOpen` → `Open` on any failure
//!
//! All bookkeeping for one call happens under a single lock, so concurrent
//! callers never observe a half-applied transition.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Rejecting calls until the reset timeout passes
    Open,
    /// Letting calls through to probe recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Time before an open breaker lets a probe through
    pub reset_timeout: Duration,
    /// Per-call timer; a timeout counts as a failure
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            call_timeout: None,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker '{name}' is open; retry after {retry_at}")]
    Open { name: String, retry_at: DateTime<Utc> },

    #[error("Call through circuit breaker '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("{0}")]
    Operation(E),
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Only set while open
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    next_attempt_at: Option<DateTime<Utc>>,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `operation` through the breaker. Every error counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(operation, |_| true).await
    }

    /// Run `operation` through the breaker. Errors for which `is_failure` returns
    /// false (e.g. a 4xx configuration problem) are returned without tripping it.
    pub async fn execute_with<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        if let Err(retry_at) = self.try_acquire() {
            metrics::counter!("outdial.breaker.rejected_total").increment(1);
            debug!(breaker = %self.name, %retry_at, "Circuit breaker open, rejecting call");
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_at,
            });
        }

        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => {
                    self.record_failure();
                    return Err(BreakerError::Timeout {
                        name: self.name.clone(),
                        after: limit,
                    });
                }
            },
            None => operation().await,
        };

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.record_failure();
                } else {
                    self.record_neutral();
                }
                Err(BreakerError::Operation(e))
            }
        }
    }

    /// Admit a call, promoting `Open` to `HalfOpen` once the reset timeout passed.
    /// Returns the retry instant when the call is rejected.
    fn try_acquire(&self) -> Result<(), DateTime<Utc>> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        match inner.next_attempt {
            Some(next) if Instant::now() < next => {
                inner.rejected_calls += 1;
                Err(inner.next_attempt_at.unwrap_or_else(Utc::now))
            }
            _ => {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.next_attempt = None;
                inner.next_attempt_at = None;
                debug!(breaker = %self.name, "Circuit breaker transitioning to half-open");
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;
        inner.failure_count = 0;
        inner.last_success_at = Some(Utc::now());

        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                info!(
                    breaker = %self.name,
                    successes = inner.success_count,
                    "Circuit breaker closed"
                );
                inner.state = CircuitState::Closed;
                inner.success_count = 0;
            }
        }
    }

    /// The provider answered, but with an error that says nothing about its
    /// health. Breaks the failure streak without counting toward closing.
    fn record_neutral(&self) {
        self.inner.lock().failure_count = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.failure_count += 1;
        inner.last_failure_at = Some(Utc::now());

        let should_open = match inner.state {
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            // Any failure in half-open reopens
            CircuitState::HalfOpen => true,
            // Late failure from a call admitted before opening pushes the retry out
            CircuitState::Open => true,
        };

        if should_open {
            if inner.state != CircuitState::Open {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    previous = %inner.state,
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.success_count = 0;
            inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
            inner.next_attempt_at = chrono::Duration::from_std(self.config.reset_timeout)
                .ok()
                .map(|timeout| Utc::now() + timeout);
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            next_attempt_at: inner.next_attempt_at,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Force the breaker back to closed, keeping lifetime call totals
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt = None;
        inner.next_attempt_at = None;
        info!(breaker = %self.name, "Circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                reset_timeout: reset,
                call_timeout: None,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_operation() {
        let cb = breaker(3, 2, Duration::from_secs(60));
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().rejected_calls, 1);
        assert!(cb.stats().next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 2, Duration::from_secs(60));
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.failure_count(), 2);

        cb.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.failure_count(), 0);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_then_closed_after_successes() {
        let cb = breaker(1, 2, Duration::from_millis(20));
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        cb.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.stats().next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 3, Duration::from_millis(20));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                call_timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_non_tripping_errors_leave_breaker_closed() {
        let cb = breaker(1, 1, Duration::from_secs(60));
        let result = cb
            .execute_with(|| async { Err::<(), _>(400u16) }, |status| *status >= 500)
            .await;

        assert!(matches!(result, Err(BreakerError::Operation(400))));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_tripping_errors_do_not_close_half_open() {
        let cb = breaker(1, 1, Duration::from_millis(20));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = cb
            .execute_with(|| async { Err::<(), _>(404u16) }, |status| *status >= 500)
            .await;
        assert!(matches!(result, Err(BreakerError::Operation(404))));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.stats().successful_calls, 0);

        cb.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_tripping_errors_break_failure_streak() {
        let cb = breaker(2, 1, Duration::from_secs(60));
        fail(&cb).await;
        let _ = cb
            .execute_with(|| async { Err::<(), _>(400u16) }, |status| *status >= 500)
            .await;
        assert_eq!(cb.failure_count(), 0);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_closes_open_breaker() {
        let cb = breaker(1, 1, Duration::from_secs(60));
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failed_calls, 1);
    }
}
