use crate::circuit_breaker::BreakerError;
use crate::provider::ProviderKind;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure of a single HTTP exchange with a provider.
///
/// Messages carry status codes and truncated bodies only, never credentials.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Client setup failed: {0}")]
    Setup(String),
}

impl ProviderError {
    /// Whether this error counts against the provider's circuit breaker.
    /// 4xx responses are configuration problems (and 429 is rate limiting), not outages.
    pub fn trips_breaker(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500,
            Self::Setup(_) => false,
            _ => true,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connection(e.without_url().to_string())
        } else {
            Self::Transport(e.without_url().to_string())
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Never retried; surfaced verbatim
    #[error("{0}")]
    Validation(String),

    #[error("{provider} provider error: {source}")]
    Provider {
        provider: ProviderKind,
        #[source]
        source: ProviderError,
    },

    #[error("{provider} provider circuit open; retry after {retry_at}")]
    CircuitOpen {
        provider: ProviderKind,
        retry_at: DateTime<Utc>,
    },

    #[error("{provider} provider timed out after {after_ms}ms")]
    Timeout { provider: ProviderKind, after_ms: u64 },
}

impl GatewayError {
    pub(crate) fn from_breaker(provider: ProviderKind, err: BreakerError<ProviderError>) -> Self {
        match err {
            BreakerError::Open { retry_at, .. } => Self::CircuitOpen { provider, retry_at },
            BreakerError::Timeout { after, .. } => Self::Timeout {
                provider,
                after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            },
            BreakerError::Operation(ProviderError::Timeout) => Self::Timeout {
                provider,
                after_ms: 0,
            },
            BreakerError::Operation(source) => Self::Provider { provider, source },
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Retry instant when the failure was a fast-fail from an open breaker
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::CircuitOpen { retry_at, .. } => Some(*retry_at),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
