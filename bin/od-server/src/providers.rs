//! Provider clients selected from configuration

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use od_config::{AppConfig, ProviderEndpointConfig};
use od_gateway::{
    BatchPayload, BatchSubmission, CallCreated, CallRequest, HttpPrimaryProvider, HttpProviderConfig,
    HttpSecondaryProvider, PrimaryCredentials, PrimaryProvider, ProviderError, ProviderKind, SecondaryCredentials,
    SecondaryProvider,
};
use tracing::{info, warn};

pub type Providers = (Arc<dyn PrimaryProvider>, Arc<dyn SecondaryProvider>);

pub fn build(config: &AppConfig) -> Result<Providers> {
    let primary: Arc<dyn PrimaryProvider> = if config.primary.enabled {
        info!(base_url = %config.primary.base_url, "Primary provider configured");
        Arc::new(HttpPrimaryProvider::new(http_config(&config.primary))?)
    } else {
        warn!("Primary provider disabled, chunks go straight to fallback");
        Arc::new(DisabledProvider(ProviderKind::Primary))
    };

    let secondary: Arc<dyn SecondaryProvider> = if config.secondary.enabled {
        info!(base_url = %config.secondary.base_url, "Secondary provider configured");
        Arc::new(HttpSecondaryProvider::new(http_config(&config.secondary))?)
    } else {
        warn!("Secondary provider disabled, no per-call fallback");
        Arc::new(DisabledProvider(ProviderKind::Secondary))
    };

    Ok((primary, secondary))
}

fn http_config(endpoint: &ProviderEndpointConfig) -> HttpProviderConfig {
    HttpProviderConfig {
        base_url: endpoint.base_url.clone(),
        request_timeout: endpoint.request_timeout(),
        connect_timeout: endpoint.connect_timeout(),
    }
}

/// Stands in for a provider switched off in configuration. Setup errors do
/// not count against the breaker.
struct DisabledProvider(ProviderKind);

impl DisabledProvider {
    fn error(&self) -> ProviderError {
        ProviderError::Setup(format!("{} provider is disabled", self.0.as_str()))
    }
}

#[async_trait]
impl PrimaryProvider for DisabledProvider {
    async fn submit_batch(
        &self,
        _credentials: &PrimaryCredentials,
        _payload: &BatchPayload,
    ) -> Result<BatchSubmission, ProviderError> {
        Err(self.error())
    }
}

#[async_trait]
impl SecondaryProvider for DisabledProvider {
    async fn create_call(
        &self,
        _credentials: &SecondaryCredentials,
        _request: &CallRequest,
    ) -> Result<CallCreated, ProviderError> {
        Err(self.error())
    }
}
