//! Secondary provider - one synchronous request per call

use crate::error::ProviderError;
use crate::primary::CallVariables;
use crate::provider::{truncate_body, HttpProviderConfig, SecondaryCredentials};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Body of `POST {base_url}/calls`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub agent_id: String,
    pub phone_number_id: String,
    pub to_number: String,
    pub variables: CallVariables,
    pub metadata: CallMetadata,
}

/// Echoed back by the provider on status callbacks
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub campaign_id: String,
    pub recipient_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCreated {
    pub call_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCallResponse {
    #[serde(default, alias = "id")]
    call_id: Option<String>,
}

#[async_trait]
pub trait SecondaryProvider: Send + Sync {
    async fn create_call(
        &self,
        credentials: &SecondaryCredentials,
        request: &CallRequest,
    ) -> Result<CallCreated, ProviderError>;
}

pub struct HttpSecondaryProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpSecondaryProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = config.build_client()?;
        info!(
            base_url = %config.base_url,
            timeout_ms = config.request_timeout.as_millis() as u64,
            "Secondary provider client initialized"
        );
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SecondaryProvider for HttpSecondaryProvider {
    async fn create_call(
        &self,
        credentials: &SecondaryCredentials,
        request: &CallRequest,
    ) -> Result<CallCreated, ProviderError> {
        debug!(recipient_id = %request.metadata.recipient_id, "Creating call on secondary provider");

        let response = self
            .client
            .post(self.config.endpoint("calls"))
            .bearer_auth(&credentials.api_key)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_reqwest)?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let parsed: CreateCallResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        match parsed.call_id.filter(|id| !id.is_empty()) {
            Some(call_id) => Ok(CallCreated { call_id }),
            None => Err(ProviderError::InvalidResponse("response carries no call id".to_string())),
        }
    }
}
