//! Recipient State Machine
//!
//! `pending → queued → calling → {completed | failed}`. Every change is a
//! compare-and-set against the expected prior status, so a webhook-set
//! terminal status is never overwritten by a late engine update.

use crate::error::{EngineError, Result, StoreError};
use crate::store::{CampaignStore, RecipientTransition};
use chrono::{DateTime, Utc};
use od_common::{CallStatus, Recipient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Error recorded when the sweep gives up on a recipient
pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

/// Allowed edges of the recipient lifecycle
pub fn is_allowed(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Queued, Calling)
            | (Queued, Failed)
            | (Queued, Pending)
            | (Queued, Completed)
            | (Calling, Completed)
            | (Calling, Failed)
            | (Calling, Pending)
            | (Failed, Pending)
    )
}

/// Final call status reported by the webhook collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    pub status: CallStatus,
    #[serde(default)]
    pub external_call_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CallResult {
    pub fn completed() -> Self {
        Self {
            status: CallStatus::Completed,
            external_call_id: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Failed,
            external_call_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CallResultOutcome {
    Applied { from: CallStatus },
    /// Recipient was already completed/failed; nothing changed
    AlreadyTerminal { status: CallStatus },
    /// Recipient is back in pending (released or swept); result dropped
    Ignored { status: CallStatus },
}

pub struct RecipientStateMachine {
    store: Arc<dyn CampaignStore>,
}

impl RecipientStateMachine {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    /// `pending → queued` for up to `limit` recipients, oldest first
    pub async fn claim_pending(&self, campaign_id: &str, limit: u32) -> Result<Vec<Recipient>> {
        let claimed = self.store.claim_pending_recipients(campaign_id, limit).await?;
        debug!(campaign_id = %campaign_id, count = claimed.len(), "Claimed recipients");
        Ok(claimed)
    }

    /// `queued → calling`; counts a dial attempt and clears the last error
    pub async fn mark_calling(&self, recipient_id: &str, external_call_id: Option<String>) -> Result<bool> {
        let transition = RecipientTransition {
            attempt: true,
            external_call_id,
            clear_error: true,
            ..RecipientTransition::to(CallStatus::Calling)
        };
        self.transition(recipient_id, CallStatus::Queued, transition).await
    }

    /// `queued → calling` for a recipient handed to the primary provider in a
    /// batch. No call id exists yet; the provider holds the call until
    /// `scheduled_for` when that lies in the future.
    pub async fn mark_batched(&self, recipient_id: &str, scheduled_for: Option<DateTime<Utc>>) -> Result<bool> {
        let transition = RecipientTransition {
            attempt: true,
            scheduled_for,
            clear_error: true,
            ..RecipientTransition::to(CallStatus::Calling)
        };
        self.transition(recipient_id, CallStatus::Queued, transition).await
    }

    /// `queued → failed` after the provider rejected the call; counts a dial attempt
    pub async fn mark_dispatch_failed(&self, recipient_id: &str, error: impl Into<String>) -> Result<bool> {
        let transition = RecipientTransition {
            attempt: true,
            last_error: Some(error.into()),
            ..RecipientTransition::to(CallStatus::Failed)
        };
        self.transition(recipient_id, CallStatus::Queued, transition).await
    }

    /// `queued → pending` for claimed recipients that were never dialled
    pub async fn release(&self, recipient_id: &str) -> Result<bool> {
        self.transition(recipient_id, CallStatus::Queued, RecipientTransition::to(CallStatus::Pending))
            .await
    }

    /// `from → pending` for stale or retryable recipients
    pub async fn requeue(&self, recipient_id: &str, from: CallStatus) -> Result<bool> {
        self.transition(recipient_id, from, RecipientTransition::to(CallStatus::Pending))
            .await
    }

    /// `calling → failed` once the recipient has used all its attempts
    pub async fn fail_exhausted(&self, recipient_id: &str) -> Result<bool> {
        let transition = RecipientTransition {
            last_error: Some(MAX_ATTEMPTS_EXCEEDED.to_string()),
            ..RecipientTransition::to(CallStatus::Failed)
        };
        self.transition(recipient_id, CallStatus::Calling, transition).await
    }

    /// Record the final status of a placed call. Idempotent: a recipient that
    /// is already terminal is left untouched.
    pub async fn apply_call_result(&self, recipient_id: &str, result: &CallResult) -> Result<CallResultOutcome> {
        if !result.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "Call result status must be completed or failed, got {}",
                result.status
            )));
        }

        // A concurrent engine update can move the recipient between the read
        // and the compare-and-set; re-read once in that case.
        for _ in 0..2 {
            let recipient = self
                .store
                .get_recipient(recipient_id)
                .await?
                .ok_or_else(|| EngineError::RecipientNotFound(recipient_id.to_string()))?;

            let from = recipient.call_status;
            if from.is_terminal() {
                debug!(recipient_id = %recipient_id, status = %from, "Call result for terminal recipient ignored");
                return Ok(CallResultOutcome::AlreadyTerminal { status: from });
            }
            if !is_allowed(from, result.status) {
                warn!(recipient_id = %recipient_id, status = %from, "Call result for undialled recipient dropped");
                return Ok(CallResultOutcome::Ignored { status: from });
            }

            let transition = RecipientTransition {
                external_call_id: result.external_call_id.clone(),
                last_error: result.error.clone(),
                clear_error: result.status == CallStatus::Completed,
                ..RecipientTransition::to(result.status)
            };
            if self.transition(recipient_id, from, transition).await? {
                debug!(recipient_id = %recipient_id, from = %from, to = %result.status, "Call result applied");
                return Ok(CallResultOutcome::Applied { from });
            }
        }

        let status = self
            .store
            .get_recipient(recipient_id)
            .await?
            .map(|r| r.call_status)
            .ok_or_else(|| EngineError::RecipientNotFound(recipient_id.to_string()))?;
        Ok(if status.is_terminal() {
            CallResultOutcome::AlreadyTerminal { status }
        } else {
            CallResultOutcome::Ignored { status }
        })
    }

    async fn transition(&self, recipient_id: &str, from: CallStatus, transition: RecipientTransition) -> Result<bool> {
        if !is_allowed(from, transition.to) {
            return Err(EngineError::Validation(format!(
                "Recipient transition {from} -> {} is not allowed",
                transition.to
            )));
        }

        match self.store.transition_recipient(recipient_id, from, &transition).await {
            Ok(applied) => {
                if !applied {
                    debug!(recipient_id = %recipient_id, expected = %from, to = %transition.to, "Recipient status changed concurrently");
                }
                Ok(applied)
            }
            Err(StoreError::NotFound { .. }) => Err(EngineError::RecipientNotFound(recipient_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
