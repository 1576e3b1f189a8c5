//! Outdial Provider Gateway
//!
//! Dispatches campaign chunks to external voice providers:
//! - Primary provider: one schedule-aware batch per chunk
//! - Secondary provider: per-call fallback with bounded concurrency
//! - Both wrapped by circuit breakers from a shared registry

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod error;
pub mod gateway;
pub mod primary;
pub mod provider;
pub mod secondary;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use error::{GatewayError, ProviderError, Result};
pub use gateway::{BatchDispatchResult, DispatchOptions, DispatchOutcome, OutcomeStatus, ProviderGateway};
pub use primary::{BatchPayload, BatchSubmission, CallListEntry, CallVariables, HttpPrimaryProvider, PrimaryProvider};
pub use provider::{HttpProviderConfig, PrimaryCredentials, ProviderKind, ResolvedProviders, SecondaryCredentials};
pub use secondary::{CallCreated, CallMetadata, CallRequest, HttpSecondaryProvider, SecondaryProvider};
