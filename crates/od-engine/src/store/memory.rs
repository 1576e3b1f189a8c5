//! In-memory CampaignStore
//!
//! One mutex guards all state, so every trait operation is atomic. Used by
//! the server's default `memory` store and by the engine test suites.

use super::{apply_delta, CampaignStore, CounterDelta, RecipientTransition, StaleQuery, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use od_common::{
    CallStatus, Campaign, CampaignQueueEntry, CampaignStatus, QueueStatus, Recipient, VoiceAgent,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct MemoryState {
    campaigns: HashMap<String, Campaign>,
    agents: HashMap<String, VoiceAgent>,
    /// Insertion order breaks created_at ties
    recipients: Vec<Recipient>,
    recipient_index: HashMap<String, usize>,
    queues: HashMap<String, CampaignQueueEntry>,
}

#[derive(Default)]
pub struct MemoryCampaignStore {
    state: Mutex<MemoryState>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a campaign's recipients in insertion order
    pub fn recipients_of(&self, campaign_id: &str) -> Vec<Recipient> {
        self.state
            .lock()
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    /// Overwrite a recipient's `updated_at`, for ageing records in tests
    pub fn backdate_recipient(&self, recipient_id: &str, updated_at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match state.recipient_index.get(recipient_id).copied() {
            Some(idx) => {
                state.recipients[idx].updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    /// Overwrite a queue lease start, for simulating a crashed invocation in tests
    pub fn backdate_lease(&self, campaign_id: &str, started_at: DateTime<Utc>) -> bool {
        match self.state.lock().queues.get_mut(campaign_id) {
            Some(entry) => {
                entry.processing_started_at = Some(started_at);
                true
            }
            None => false,
        }
    }
}

fn not_found(entity: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()> {
        self.state
            .lock()
            .campaigns
            .insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, campaign_id: &str) -> StoreResult<Option<Campaign>> {
        Ok(self.state.lock().campaigns.get(campaign_id).cloned())
    }

    async fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> StoreResult<()> {
        let mut state = self.state.lock();
        let campaign = state
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| not_found("campaign", campaign_id))?;
        campaign.status = status;
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_campaign_counters(&self, campaign_id: &str, delta: CounterDelta) -> StoreResult<()> {
        let mut state = self.state.lock();
        let campaign = state
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| not_found("campaign", campaign_id))?;
        delta.apply(campaign);
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_agent(&self, agent: &VoiceAgent) -> StoreResult<()> {
        self.state.lock().agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<VoiceAgent>> {
        Ok(self.state.lock().agents.get(agent_id).cloned())
    }

    async fn insert_recipients(&self, recipients: &[Recipient]) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(dup) = recipients
            .iter()
            .find(|r| state.recipient_index.contains_key(&r.id))
        {
            return Err(StoreError::Conflict(format!("recipient {} already exists", dup.id)));
        }
        for recipient in recipients {
            let idx = state.recipients.len();
            state.recipient_index.insert(recipient.id.clone(), idx);
            state.recipients.push(recipient.clone());
        }
        Ok(())
    }

    async fn get_recipient(&self, recipient_id: &str) -> StoreResult<Option<Recipient>> {
        let state = self.state.lock();
        Ok(state
            .recipient_index
            .get(recipient_id)
            .map(|&idx| state.recipients[idx].clone()))
    }

    async fn count_recipients(&self, campaign_id: &str, status: CallStatus) -> StoreResult<u64> {
        Ok(self
            .state
            .lock()
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id && r.call_status == status)
            .count() as u64)
    }

    async fn count_retryable_failures(&self, campaign_id: &str, max_attempts: u32) -> StoreResult<u64> {
        Ok(self
            .state
            .lock()
            .recipients
            .iter()
            .filter(|r| {
                r.campaign_id == campaign_id
                    && r.call_status == CallStatus::Failed
                    && r.external_call_id.is_none()
                    && r.attempts < max_attempts
            })
            .count() as u64)
    }

    async fn claim_pending_recipients(&self, campaign_id: &str, limit: u32) -> StoreResult<Vec<Recipient>> {
        let mut state = self.state.lock();
        let mut candidates: Vec<usize> = state
            .recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| r.campaign_id == campaign_id && r.call_status == CallStatus::Pending)
            .map(|(idx, _)| idx)
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        candidates.sort_by_key(|&idx| state.recipients[idx].created_at);
        candidates.truncate(limit as usize);

        let now = Utc::now();
        let claimed = candidates
            .into_iter()
            .map(|idx| {
                let recipient = &mut state.recipients[idx];
                recipient.call_status = CallStatus::Queued;
                recipient.updated_at = now;
                recipient.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn transition_recipient(
        &self,
        recipient_id: &str,
        expected: CallStatus,
        transition: &RecipientTransition,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let idx = *state
            .recipient_index
            .get(recipient_id)
            .ok_or_else(|| not_found("recipient", recipient_id))?;

        let recipient = &mut state.recipients[idx];
        if recipient.call_status != expected {
            return Ok(false);
        }
        transition.apply(recipient);
        Ok(true)
    }

    async fn find_stale_recipients(&self, query: &StaleQuery) -> StoreResult<Vec<Recipient>> {
        let state = self.state.lock();
        let mut stale: Vec<&Recipient> = state
            .recipients
            .iter()
            .filter(|r| {
                r.call_status == query.status
                    && r.stale_since() < query.stale_before
                    && query.attempts_below.map_or(true, |max| r.attempts < max)
                    && query.placement.matches(r)
            })
            .collect();
        stale.sort_by_key(|r| r.stale_since());
        Ok(stale
            .into_iter()
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_queue_entry(&self, entry: &CampaignQueueEntry) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.queues.contains_key(&entry.campaign_id) {
            return Err(StoreError::Conflict(format!(
                "queue for campaign {} already exists",
                entry.campaign_id
            )));
        }
        state.queues.insert(entry.campaign_id.clone(), entry.clone());
        Ok(())
    }

    async fn get_queue_entry(&self, campaign_id: &str) -> StoreResult<Option<CampaignQueueEntry>> {
        Ok(self.state.lock().queues.get(campaign_id).cloned())
    }

    async fn try_begin_processing(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let Some(entry) = state.queues.get_mut(campaign_id) else {
            return Ok(false);
        };

        let acquirable = match entry.status {
            QueueStatus::Pending => true,
            QueueStatus::Processing => entry
                .processing_started_at
                .map_or(true, |started| started < lease_expired_before),
            _ => false,
        };
        if acquirable {
            entry.status = QueueStatus::Processing;
            entry.processing_started_at = Some(now);
            entry.updated_at = now;
        }
        Ok(acquirable)
    }

    async fn record_chunk_progress(&self, campaign_id: &str, processed: u64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .queues
            .get_mut(campaign_id)
            .ok_or_else(|| not_found("campaign queue", campaign_id))?;
        entry.chunks_processed += 1;
        entry.processed_count = apply_delta(entry.processed_count, processed as i64);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_queue_status(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .queues
            .get_mut(campaign_id)
            .ok_or_else(|| not_found("campaign queue", campaign_id))?;
        entry.status = status;
        entry.last_error = last_error;
        if status != QueueStatus::Processing {
            entry.processing_started_at = None;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_processing(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let Some(entry) = state.queues.get_mut(campaign_id) else {
            return Ok(false);
        };
        if entry.status != QueueStatus::Processing {
            return Ok(false);
        }
        entry.status = status;
        entry.last_error = last_error;
        entry.processing_started_at = None;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_queue_entry(&self, campaign_id: &str) -> StoreResult<bool> {
        Ok(self.state.lock().queues.remove(campaign_id).is_some())
    }

    async fn list_live_queues(&self) -> StoreResult<Vec<CampaignQueueEntry>> {
        let mut live: Vec<_> = self
            .state
            .lock()
            .queues
            .values()
            .filter(|e| matches!(e.status, QueueStatus::Pending | QueueStatus::Processing))
            .cloned()
            .collect();
        live.sort_by_key(|e| e.created_at);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Placement;
    use chrono::Duration;
    use od_common::OptimizedBatchConfig;

    async fn seeded(n: usize) -> (MemoryCampaignStore, Campaign, Vec<Recipient>) {
        let store = MemoryCampaignStore::new();
        let campaign = Campaign::new("ws", "agent", "c");
        let base = Utc::now() - Duration::minutes(10);
        let recipients: Vec<_> = (0..n)
            .map(|i| {
                let mut r = Recipient::new(campaign.id.clone(), format!("+1555000{i:04}"));
                r.created_at = base;
                r
            })
            .collect();
        store.insert_campaign(&campaign).await.unwrap();
        store.insert_recipients(&recipients).await.unwrap();
        (store, campaign, recipients)
    }

    #[tokio::test]
    async fn test_claim_is_oldest_first_and_exclusive() {
        let (store, campaign, recipients) = seeded(5).await;

        let first = store.claim_pending_recipients(&campaign.id, 2).await.unwrap();
        let second = store.claim_pending_recipients(&campaign.id, 10).await.unwrap();

        let first_ids: Vec<_> = first.iter().map(|r| r.id.clone()).collect();
        assert_eq!(first_ids, vec![recipients[0].id.clone(), recipients[1].id.clone()]);
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(|r| r.call_status == CallStatus::Queued));
        assert!(store.claim_pending_recipients(&campaign.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, campaign, recipients) = seeded(1).await;
        store.claim_pending_recipients(&campaign.id, 1).await.unwrap();

        let calling = RecipientTransition { attempt: true, ..RecipientTransition::to(CallStatus::Calling) };
        assert!(store.transition_recipient(&recipients[0].id, CallStatus::Queued, &calling).await.unwrap());
        assert!(!store.transition_recipient(&recipients[0].id, CallStatus::Queued, &calling).await.unwrap());

        let stored = store.get_recipient(&recipients[0].id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.call_status, CallStatus::Calling);
    }

    #[tokio::test]
    async fn test_queue_lease() {
        let store = MemoryCampaignStore::new();
        let entry = CampaignQueueEntry::new("c1", "ws", 10, 5, OptimizedBatchConfig::default());
        store.insert_queue_entry(&entry).await.unwrap();
        assert!(matches!(store.insert_queue_entry(&entry).await, Err(StoreError::Conflict(_))));

        let now = Utc::now();
        let expired_before = now - Duration::seconds(50);
        assert!(store.try_begin_processing("c1", now, expired_before).await.unwrap());
        assert!(!store.try_begin_processing("c1", now, expired_before).await.unwrap());

        // A lease older than the expiry can be taken over
        store.backdate_lease("c1", now - Duration::minutes(5));
        assert!(store.try_begin_processing("c1", now, expired_before).await.unwrap());

        store.set_queue_status("c1", QueueStatus::Pending, None).await.unwrap();
        let entry = store.get_queue_entry("c1").await.unwrap().unwrap();
        assert!(entry.processing_started_at.is_none());
    }

    #[tokio::test]
    async fn test_find_stale_filters() {
        let (store, campaign, recipients) = seeded(3).await;
        store.claim_pending_recipients(&campaign.id, 3).await.unwrap();
        let old = Utc::now() - Duration::hours(2);
        store.backdate_recipient(&recipients[0].id, old);
        store.backdate_recipient(&recipients[1].id, old);

        let query = StaleQuery {
            status: CallStatus::Queued,
            stale_before: Utc::now() - Duration::minutes(10),
            attempts_below: None,
            placement: Placement::Any,
            limit: 1,
        };
        assert_eq!(store.find_stale_recipients(&query).await.unwrap().len(), 1);

        let query = StaleQuery { limit: 10, ..query };
        assert_eq!(store.find_stale_recipients(&query).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_find_stale_waits_for_scheduled_dial() {
        let (store, campaign, recipients) = seeded(2).await;
        store.claim_pending_recipients(&campaign.id, 2).await.unwrap();
        let held = RecipientTransition {
            attempt: true,
            scheduled_for: Some(Utc::now() + Duration::hours(3)),
            ..RecipientTransition::to(CallStatus::Calling)
        };
        for recipient in &recipients {
            store.transition_recipient(&recipient.id, CallStatus::Queued, &held).await.unwrap();
            store.backdate_recipient(&recipient.id, Utc::now() - Duration::hours(2));
        }
        let placed = RecipientTransition {
            external_call_id: Some("call-1".into()),
            ..RecipientTransition::to(CallStatus::Calling)
        };
        store.transition_recipient(&recipients[1].id, CallStatus::Calling, &placed).await.unwrap();

        let query = StaleQuery {
            status: CallStatus::Calling,
            stale_before: Utc::now() - Duration::minutes(60),
            attempts_below: None,
            placement: Placement::Any,
            limit: 10,
        };
        // Both were scheduled three hours out; neither is stale yet
        assert!(store.find_stale_recipients(&query).await.unwrap().is_empty());

        let query = StaleQuery { stale_before: Utc::now() + Duration::hours(4), ..query };
        assert_eq!(store.find_stale_recipients(&query).await.unwrap().len(), 2);

        let query = StaleQuery { placement: Placement::Unplaced, ..query };
        let unplaced = store.find_stale_recipients(&query).await.unwrap();
        assert_eq!(unplaced.len(), 1);
        assert_eq!(unplaced[0].id, recipients[0].id);
    }
}
