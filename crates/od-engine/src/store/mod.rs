//! Campaign Store Trait
//!
//! Narrow, single-purpose persistence operations used by the engine. Every
//! status change is a compare-and-set so concurrent invocations cannot
//! double-claim a recipient or a queue entry.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use od_common::{
    CallStatus, Campaign, CampaignQueueEntry, CampaignStatus, QueueStatus, Recipient, VoiceAgent,
};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryCampaignStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCampaignStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Change applied to a recipient when its status matches the expected one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientTransition {
    pub to: CallStatus,
    /// Counts as a dial attempt: `attempts += 1`, `last_attempt_at = at`
    pub attempt: bool,
    /// Set when present, kept otherwise
    pub external_call_id: Option<String>,
    /// Replaced on every attempt
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Set when present, kept otherwise
    pub last_error: Option<String>,
    pub clear_error: bool,
    pub at: DateTime<Utc>,
}

impl RecipientTransition {
    pub fn to(status: CallStatus) -> Self {
        Self {
            to: status,
            attempt: false,
            external_call_id: None,
            scheduled_for: None,
            last_error: None,
            clear_error: false,
            at: Utc::now(),
        }
    }

    /// Apply to an in-memory recipient
    pub fn apply(&self, recipient: &mut Recipient) {
        recipient.call_status = self.to;
        if self.attempt {
            recipient.attempts += 1;
            recipient.last_attempt_at = Some(self.at);
            recipient.scheduled_for = self.scheduled_for;
        }
        if let Some(call_id) = &self.external_call_id {
            recipient.external_call_id = Some(call_id.clone());
        }
        if self.clear_error {
            recipient.last_error = None;
        }
        if let Some(error) = &self.last_error {
            recipient.last_error = Some(error.clone());
        }
        recipient.updated_at = self.at;
    }
}

/// Signed adjustment of a campaign's recipient counters. Results clamp at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub pending: i64,
    pub successful: i64,
    pub failed: i64,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.pending == 0 && self.successful == 0 && self.failed == 0
    }

    pub fn apply(&self, campaign: &mut Campaign) {
        campaign.pending_recipients = apply_delta(campaign.pending_recipients, self.pending);
        campaign.successful_recipients = apply_delta(campaign.successful_recipients, self.successful);
        campaign.failed_recipients = apply_delta(campaign.failed_recipients, self.failed);
    }
}

pub(crate) fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Whether a recipient carries a provider call id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Any,
    /// Placed individually; the provider returned a call id
    Placed,
    /// No call id: never placed, or handed to the provider inside a batch
    Unplaced,
}

impl Placement {
    pub fn matches(self, recipient: &Recipient) -> bool {
        match self {
            Placement::Any => true,
            Placement::Placed => recipient.external_call_id.is_some(),
            Placement::Unplaced => recipient.external_call_id.is_none(),
        }
    }
}

/// Filter for the stale sweep
#[derive(Debug, Clone)]
pub struct StaleQuery {
    pub status: CallStatus,
    /// [`Recipient::stale_since`] strictly before this instant
    pub stale_before: DateTime<Utc>,
    /// Only recipients with fewer attempts than this
    pub attempts_below: Option<u32>,
    pub placement: Placement,
    pub limit: u32,
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    // ========================================================================
    // Campaigns and agents
    // ========================================================================

    async fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()>;

    async fn get_campaign(&self, campaign_id: &str) -> StoreResult<Option<Campaign>>;

    async fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> StoreResult<()>;

    /// Increment/decrement counters in one operation
    async fn apply_campaign_counters(&self, campaign_id: &str, delta: CounterDelta) -> StoreResult<()>;

    async fn insert_agent(&self, agent: &VoiceAgent) -> StoreResult<()>;

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<VoiceAgent>>;

    // ========================================================================
    // Recipients
    // ========================================================================

    async fn insert_recipients(&self, recipients: &[Recipient]) -> StoreResult<()>;

    async fn get_recipient(&self, recipient_id: &str) -> StoreResult<Option<Recipient>>;

    async fn count_recipients(&self, campaign_id: &str, status: CallStatus) -> StoreResult<u64>;

    /// Failed recipients that were never placed and still have attempts left
    async fn count_retryable_failures(&self, campaign_id: &str, max_attempts: u32) -> StoreResult<u64>;

    /// Atomically move up to `limit` pending recipients to queued, oldest
    /// first, and return them in that order
    async fn claim_pending_recipients(&self, campaign_id: &str, limit: u32) -> StoreResult<Vec<Recipient>>;

    /// Apply `transition` iff the recipient is currently `expected`.
    /// Returns whether it was applied.
    async fn transition_recipient(
        &self,
        recipient_id: &str,
        expected: CallStatus,
        transition: &RecipientTransition,
    ) -> StoreResult<bool>;

    async fn find_stale_recipients(&self, query: &StaleQuery) -> StoreResult<Vec<Recipient>>;

    // ========================================================================
    // Campaign queue
    // ========================================================================

    /// Fails with `Conflict` when the campaign already has an entry
    async fn insert_queue_entry(&self, entry: &CampaignQueueEntry) -> StoreResult<()>;

    async fn get_queue_entry(&self, campaign_id: &str) -> StoreResult<Option<CampaignQueueEntry>>;

    /// `pending → processing`, or take over a `processing` lease started
    /// before `lease_expired_before`. Returns whether the caller now holds it.
    async fn try_begin_processing(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// `chunks_processed += 1`, `processed_count += processed`
    async fn record_chunk_progress(&self, campaign_id: &str, processed: u64) -> StoreResult<()>;

    /// Set status; leaving `processing` clears the lease. `last_error` replaces the stored one.
    async fn set_queue_status(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> StoreResult<()>;

    /// Leave `processing` for `status` iff the entry is still `processing`.
    /// Returns false when a pause, cancel or lease takeover got there first.
    async fn finish_processing(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> StoreResult<bool>;

    async fn delete_queue_entry(&self, campaign_id: &str) -> StoreResult<bool>;

    /// Entries in `pending` or `processing`
    async fn list_live_queues(&self) -> StoreResult<Vec<CampaignQueueEntry>>;
}
