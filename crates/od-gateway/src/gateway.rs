//! Provider Gateway - primary batch submission with per-call fallback
//!
//! Every chunk goes to the primary provider first as one batch. If that fails
//! (transport, non-2xx, open breaker, timeout) and the agent has a secondary
//! binding, each recipient is dialled individually through the secondary
//! provider with bounded concurrency and inter-call spacing.

use crate::circuit_breaker::CircuitBreaker;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::error::{GatewayError, ProviderError, Result};
use crate::primary::{BatchPayload, CallListEntry, CallVariables, PrimaryProvider};
use crate::provider::{ProviderKind, ResolvedProviders, SecondaryCredentials};
use crate::secondary::{CallMetadata, CallRequest, SecondaryProvider};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use od_common::{Campaign, OptimizedBatchConfig, Recipient};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-dispatch knobs
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Simultaneous in-flight secondary calls
    pub concurrency_limit: usize,
    /// Minimum spacing between secondary call starts
    pub delay_between_calls: Duration,
    /// Not-before; `None` or a past instant means now
    pub nbf: Option<DateTime<Utc>>,
    /// Expiry; `None` means nbf + the default expiry
    pub exp: Option<DateTime<Utc>>,
    pub block_rules: Vec<String>,
    /// Secondary calls not started by this instant are skipped
    pub deadline: Option<Instant>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from_batch_config(&OptimizedBatchConfig::default())
    }
}

impl DispatchOptions {
    pub fn from_batch_config(config: &OptimizedBatchConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit.max(1),
            delay_between_calls: config.delay_between_calls(),
            nbf: None,
            exp: None,
            block_rules: Vec::new(),
            deadline: None,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Placed,
    Failed,
    /// Not attempted; the recipient goes back to pending
    Skipped,
}

/// Result of one secondary call attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub recipient_id: String,
    pub status: OutcomeStatus,
    pub external_call_id: Option<String>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn placed(recipient_id: impl Into<String>, external_call_id: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            status: OutcomeStatus::Placed,
            external_call_id: Some(external_call_id.into()),
            error: None,
        }
    }

    pub fn failed(recipient_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            status: OutcomeStatus::Failed,
            external_call_id: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(recipient_id: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            status: OutcomeStatus::Skipped,
            external_call_id: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Placed
    }
}

/// Aggregated result of dispatching one chunk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDispatchResult {
    pub provider: ProviderKind,
    pub batch_ref: String,
    /// Primary provider's id for the accepted batch, when it returns one
    pub external_batch_id: Option<String>,
    pub fallback_used: bool,
    pub primary_error: Option<String>,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Only populated on the secondary path
    pub outcomes: Vec<DispatchOutcome>,
}

impl BatchDispatchResult {
    fn from_primary(batch_ref: String, external_batch_id: Option<String>, submitted: usize) -> Self {
        Self {
            provider: ProviderKind::Primary,
            batch_ref,
            external_batch_id,
            fallback_used: false,
            primary_error: None,
            successful: submitted,
            failed: 0,
            skipped: 0,
            outcomes: Vec::new(),
        }
    }

    fn from_secondary(batch_ref: String, primary_error: String, outcomes: Vec<DispatchOutcome>) -> Self {
        let count = |status| outcomes.iter().filter(|o| o.status == status).count();
        Self {
            provider: ProviderKind::Secondary,
            batch_ref,
            external_batch_id: None,
            fallback_used: true,
            primary_error: Some(primary_error),
            successful: count(OutcomeStatus::Placed),
            failed: count(OutcomeStatus::Failed),
            skipped: count(OutcomeStatus::Skipped),
            outcomes,
        }
    }
}

pub struct ProviderGateway {
    registry: Arc<CircuitBreakerRegistry>,
    primary: Arc<dyn PrimaryProvider>,
    secondary: Arc<dyn SecondaryProvider>,
    default_expiry: chrono::Duration,
}

impl ProviderGateway {
    pub fn new(
        registry: Arc<CircuitBreakerRegistry>,
        primary: Arc<dyn PrimaryProvider>,
        secondary: Arc<dyn SecondaryProvider>,
    ) -> Self {
        Self {
            registry,
            primary,
            secondary,
            default_expiry: chrono::Duration::days(30),
        }
    }

    /// Expiry applied when the campaign has none
    pub fn with_default_expiry(mut self, expiry: chrono::Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Dispatch `recipients` for `campaign`, primary first.
    pub async fn start_batch(
        &self,
        campaign: &Campaign,
        recipients: &[Recipient],
        providers: &ResolvedProviders,
        options: &DispatchOptions,
    ) -> Result<BatchDispatchResult> {
        if recipients.is_empty() {
            return Err(GatewayError::Validation("No recipients to dispatch".to_string()));
        }

        let (nbf, exp) = self.resolve_window(options)?;
        let cli = campaign
            .caller_id
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| providers.caller_id.clone())
            .ok_or_else(|| {
                GatewayError::Validation(format!("Campaign {} has no caller ID configured", campaign.id))
            })?;

        let batch_ref = campaign.batch_ref();
        let payload = BatchPayload {
            agent_id: providers.primary.external_agent_id.clone(),
            workspace_id: campaign.workspace_id.clone(),
            batch_ref: batch_ref.clone(),
            cli,
            call_list: recipients
                .iter()
                .map(|r| CallListEntry {
                    phone: r.phone_number.clone(),
                    variables: CallVariables::from(&r.contact),
                })
                .collect(),
            nbf,
            exp,
            block_rules: options.block_rules.clone(),
        };

        let breaker = self.registry.get_or_create(ProviderKind::Primary.breaker_name());
        let primary_result = breaker
            .execute_with(
                || self.primary.submit_batch(&providers.primary, &payload),
                ProviderError::trips_breaker,
            )
            .await;

        let primary_error = match primary_result {
            Ok(submission) => {
                metrics::counter!("outdial.gateway.batches_total", "provider" => "primary").increment(1);
                info!(
                    campaign_id = %campaign.id,
                    batch_ref = %batch_ref,
                    batch_id = ?submission.batch_id,
                    recipients = recipients.len(),
                    provider = "primary",
                    "Batch accepted"
                );
                return Ok(BatchDispatchResult::from_primary(batch_ref, submission.batch_id, recipients.len()));
            }
            Err(e) => GatewayError::from_breaker(ProviderKind::Primary, e),
        };

        metrics::counter!("outdial.gateway.primary_failures_total").increment(1);

        let Some(secondary) = providers.secondary.as_ref() else {
            warn!(
                campaign_id = %campaign.id,
                error = %primary_error,
                provider = "primary",
                "Primary provider failed and no secondary provider is bound"
            );
            return Err(primary_error);
        };

        warn!(
            campaign_id = %campaign.id,
            error = %primary_error,
            recipients = recipients.len(),
            "Primary provider failed, falling back to secondary provider"
        );
        metrics::counter!("outdial.gateway.fallbacks_total").increment(1);

        let outcomes = if nbf > Utc::now() {
            // The secondary provider dials immediately; leave scheduled work for later
            info!(campaign_id = %campaign.id, %nbf, "Fallback deferred until batch start");
            recipients.iter().map(|r| DispatchOutcome::skipped(r.id.clone())).collect()
        } else {
            self.dispatch_secondary(campaign, recipients, secondary, options).await
        };

        let result = BatchDispatchResult::from_secondary(batch_ref, primary_error.to_string(), outcomes);
        metrics::counter!("outdial.gateway.batches_total", "provider" => "secondary").increment(1);
        info!(
            campaign_id = %campaign.id,
            successful = result.successful,
            failed = result.failed,
            skipped = result.skipped,
            provider = "secondary",
            "Fallback dispatch finished"
        );
        Ok(result)
    }

    /// Same as [`start_batch`](Self::start_batch) for a resumed campaign: `nbf`
    /// is forced to now and a missing `exp` defaults to now + the default expiry.
    pub async fn resume_batch(
        &self,
        campaign: &Campaign,
        recipients: &[Recipient],
        providers: &ResolvedProviders,
        options: &DispatchOptions,
    ) -> Result<BatchDispatchResult> {
        let options = DispatchOptions {
            nbf: None,
            ..options.clone()
        };
        self.start_batch(campaign, recipients, providers, &options).await
    }

    fn resolve_window(&self, options: &DispatchOptions) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let now = Utc::now();
        let nbf = options.nbf.filter(|nbf| *nbf > now).unwrap_or(now);
        let exp = options.exp.unwrap_or(nbf + self.default_expiry);
        if exp <= nbf {
            return Err(GatewayError::Validation(format!(
                "Batch expiry {exp} is not after its start {nbf}"
            )));
        }
        Ok((nbf, exp))
    }

    async fn dispatch_secondary(
        &self,
        campaign: &Campaign,
        recipients: &[Recipient],
        credentials: &SecondaryCredentials,
        options: &DispatchOptions,
    ) -> Vec<DispatchOutcome> {
        let breaker = self.registry.get_or_create(ProviderKind::Secondary.breaker_name());
        let limiter: Option<DefaultDirectRateLimiter> =
            Quota::with_period(options.delay_between_calls).map(RateLimiter::direct);

        // Build the call futures up front so the stream type carries no
        // higher-ranked closure; keeps the caller's future `Send`.
        let calls: Vec<_> = recipients
            .iter()
            .map(|recipient| {
                self.place_call(campaign, recipient, credentials, &breaker, limiter.as_ref(), options)
            })
            .collect();
        stream::iter(calls)
            .buffered(options.concurrency_limit.max(1))
            .collect()
            .await
    }

    async fn place_call(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        credentials: &SecondaryCredentials,
        breaker: &CircuitBreaker,
        limiter: Option<&DefaultDirectRateLimiter>,
        options: &DispatchOptions,
    ) -> DispatchOutcome {
        if options.deadline_passed() {
            return DispatchOutcome::skipped(recipient.id.clone());
        }
        if let Some(limiter) = limiter {
            limiter.until_ready().await;
            if options.deadline_passed() {
                return DispatchOutcome::skipped(recipient.id.clone());
            }
        }

        let request = CallRequest {
            agent_id: credentials.external_agent_id.clone(),
            phone_number_id: credentials.phone_number_id.clone(),
            to_number: recipient.phone_number.clone(),
            variables: CallVariables::from(&recipient.contact),
            metadata: CallMetadata {
                campaign_id: campaign.id.clone(),
                recipient_id: recipient.id.clone(),
            },
        };

        match breaker
            .execute_with(
                || self.secondary.create_call(credentials, &request),
                ProviderError::trips_breaker,
            )
            .await
        {
            Ok(created) => {
                debug!(
                    campaign_id = %campaign.id,
                    recipient_id = %recipient.id,
                    call_id = %created.call_id,
                    provider = "secondary",
                    "Call placed"
                );
                DispatchOutcome::placed(recipient.id.clone(), created.call_id)
            }
            Err(e) => {
                let error = GatewayError::from_breaker(ProviderKind::Secondary, e);
                warn!(
                    campaign_id = %campaign.id,
                    recipient_id = %recipient.id,
                    error = %error,
                    provider = "secondary",
                    "Call failed"
                );
                DispatchOutcome::failed(recipient.id.clone(), error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counts() {
        let result = BatchDispatchResult::from_secondary(
            "campaign-1".into(),
            "primary provider error: HTTP 500: down".into(),
            vec![
                DispatchOutcome::placed("a", "call-a"),
                DispatchOutcome::failed("b", "busy"),
                DispatchOutcome::skipped("c"),
                DispatchOutcome::placed("d", "call-d"),
            ],
        );
        assert_eq!((result.successful, result.failed, result.skipped), (2, 1, 1));
        assert!(result.fallback_used);
        assert_eq!(result.provider, ProviderKind::Secondary);
    }

    #[test]
    fn test_options_clamp_concurrency() {
        let config = OptimizedBatchConfig { concurrency_limit: 0, ..Default::default() };
        assert_eq!(DispatchOptions::from_batch_config(&config).concurrency_limit, 1);
    }
}
