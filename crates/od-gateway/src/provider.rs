//! Provider identities and per-agent credential resolution

use crate::error::{GatewayError, ProviderError};
use od_common::{ProviderBinding, VoiceAgent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Bulk, asynchronous, schedule-aware batch API
    Primary,
    /// Synchronous one-call-per-request API
    Secondary,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    /// Name of this provider's breaker in the registry
    pub fn breaker_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PrimaryCredentials {
    pub external_agent_id: String,
    pub api_key: String,
}

impl fmt::Debug for PrimaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryCredentials")
            .field("external_agent_id", &self.external_agent_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SecondaryCredentials {
    pub external_agent_id: String,
    pub api_key: String,
    pub phone_number_id: String,
}

impl fmt::Debug for SecondaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryCredentials")
            .field("external_agent_id", &self.external_agent_id)
            .field("phone_number_id", &self.phone_number_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Credentials for one dispatch, resolved once from the agent's bindings
#[derive(Debug, Clone)]
pub struct ResolvedProviders {
    pub primary: PrimaryCredentials,
    pub secondary: Option<SecondaryCredentials>,
    /// Agent-level caller id, used when the campaign has none
    pub caller_id: Option<String>,
}

impl ResolvedProviders {
    pub fn resolve(agent: &VoiceAgent) -> Result<Self, GatewayError> {
        let mut primary = None;
        let mut secondary = None;

        for binding in &agent.bindings {
            match binding {
                ProviderBinding::Primary { external_agent_id, api_key } => {
                    if primary.is_none() && !external_agent_id.trim().is_empty() {
                        primary = Some(PrimaryCredentials {
                            external_agent_id: external_agent_id.clone(),
                            api_key: api_key.clone(),
                        });
                    }
                }
                ProviderBinding::Secondary { external_agent_id, api_key, phone_number_id } => {
                    if secondary.is_some() {
                        continue;
                    }
                    if external_agent_id.trim().is_empty() || phone_number_id.trim().is_empty() {
                        warn!(agent_id = %agent.id, "Ignoring incomplete secondary provider binding");
                        continue;
                    }
                    secondary = Some(SecondaryCredentials {
                        external_agent_id: external_agent_id.clone(),
                        api_key: api_key.clone(),
                        phone_number_id: phone_number_id.clone(),
                    });
                }
            }
        }

        let primary = primary.ok_or_else(|| {
            GatewayError::Validation(format!(
                "Agent {} is not synced with the primary provider",
                agent.id
            ))
        })?;

        Ok(Self {
            primary,
            secondary,
            caller_id: agent.caller_id.clone().filter(|c| !c.trim().is_empty()),
        })
    }
}

/// HTTP endpoint settings of one provider client
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub(crate) fn build_client(&self) -> Result<reqwest::Client, ProviderError> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ProviderError::Setup(e.to_string()))
    }
}

/// Keep provider error bodies short enough for logs and `last_error`
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
