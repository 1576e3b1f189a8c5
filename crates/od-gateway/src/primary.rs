//! Primary provider - one batch submission per chunk
//!
//! The provider owns scheduling: it receives `nbf`/`exp` and the block rules
//! and places the calls itself within the allowed windows.

use crate::error::ProviderError;
use crate::provider::{truncate_body, HttpProviderConfig, PrimaryCredentials};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use od_common::ContactDetails;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Template variables substituted into the agent's prompt. Missing fields are sent empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CallVariables {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub company_name: String,
    pub reason_for_call: String,
    pub address: String,
    #[serde(rename = "ADDRESS_LINE_2")]
    pub address_line_2: String,
    pub city: String,
    pub state: String,
    pub post_code: String,
    pub country: String,
}

impl From<&ContactDetails> for CallVariables {
    fn from(contact: &ContactDetails) -> Self {
        let field = |value: &Option<String>| value.clone().unwrap_or_default();
        Self {
            first_name: field(&contact.first_name),
            last_name: field(&contact.last_name),
            email: field(&contact.email),
            company_name: field(&contact.company_name),
            reason_for_call: field(&contact.reason_for_call),
            address: field(&contact.address),
            address_line_2: field(&contact.address_line_2),
            city: field(&contact.city),
            state: field(&contact.state),
            post_code: field(&contact.post_code),
            country: field(&contact.country),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallListEntry {
    pub phone: String,
    pub variables: CallVariables,
}

/// Body of `POST {base_url}/batches`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub agent_id: String,
    pub workspace_id: String,
    pub batch_ref: String,
    pub cli: String,
    pub call_list: Vec<CallListEntry>,
    pub nbf: DateTime<Utc>,
    pub exp: DateTime<Utc>,
    pub block_rules: Vec<String>,
}

/// Accepted batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSubmission {
    pub batch_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchAcceptedResponse {
    #[serde(default, alias = "id")]
    batch_id: Option<String>,
}

#[async_trait]
pub trait PrimaryProvider: Send + Sync {
    async fn submit_batch(
        &self,
        credentials: &PrimaryCredentials,
        payload: &BatchPayload,
    ) -> Result<BatchSubmission, ProviderError>;
}

pub struct HttpPrimaryProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpPrimaryProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = config.build_client()?;
        info!(
            base_url = %config.base_url,
            timeout_ms = config.request_timeout.as_millis() as u64,
            "Primary provider client initialized"
        );
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PrimaryProvider for HttpPrimaryProvider {
    async fn submit_batch(
        &self,
        credentials: &PrimaryCredentials,
        payload: &BatchPayload,
    ) -> Result<BatchSubmission, ProviderError> {
        debug!(
            batch_ref = %payload.batch_ref,
            calls = payload.call_list.len(),
            nbf = %payload.nbf,
            exp = %payload.exp,
            "Submitting batch to primary provider"
        );

        let response = self
            .client
            .post(self.config.endpoint("batches"))
            .bearer_auth(&credentials.api_key)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                batch_ref = %payload.batch_ref,
                status_code = status.as_u16(),
                "Primary provider rejected batch"
            );
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        // Empty or non-JSON 2xx bodies are still an accepted batch
        let body = response.text().await.unwrap_or_default();
        let batch_id = serde_json::from_str::<BatchAcceptedResponse>(&body)
            .ok()
            .and_then(|r| r.batch_id);

        Ok(BatchSubmission { batch_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_use_upper_snake_keys_and_empty_defaults() {
        let contact = ContactDetails {
            first_name: Some("Ada".into()),
            address_line_2: Some("Flat 2".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(CallVariables::from(&contact)).unwrap();

        assert_eq!(json["FIRST_NAME"], "Ada");
        assert_eq!(json["ADDRESS_LINE_2"], "Flat 2");
        assert_eq!(json["LAST_NAME"], "");
        assert_eq!(json.as_object().unwrap().len(), 11);
    }

    #[test]
    fn test_batch_payload_shape() {
        let now = Utc::now();
        let payload = BatchPayload {
            agent_id: "ext-agent".into(),
            workspace_id: "ws".into(),
            batch_ref: "campaign-1".into(),
            cli: "+15550001111".into(),
            call_list: vec![CallListEntry { phone: "+15550002222".into(), variables: CallVariables::default() }],
            nbf: now,
            exp: now,
            block_rules: vec!["Sun|0000-2359".into()],
        };
        let json = serde_json::to_value(&payload).unwrap();

        for key in ["agentId", "workspaceId", "batchRef", "cli", "callList", "nbf", "exp", "blockRules"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["callList"][0]["phone"], "+15550002222");
    }
}
