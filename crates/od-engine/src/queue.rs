//! Campaign Queue
//!
//! Persisted progress record of a campaign's chunked run. The entry's move
//! to `processing` is the per-campaign mutual-exclusion marker: it returns to
//! `pending` between chunks and ends `completed` (kept), `paused` or `failed`.

use crate::error::{EngineError, Result, StoreError};
use crate::store::CampaignStore;
use chrono::{DateTime, Utc};
use od_common::{CampaignQueueEntry, OptimizedBatchConfig, QueueStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CampaignQueue {
    store: Arc<dyn CampaignStore>,
}

impl CampaignQueue {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    /// Persist a new `pending` entry. Fails when the campaign already has one.
    pub async fn initialize(
        &self,
        campaign_id: &str,
        workspace_id: &str,
        total_recipients: u64,
        batch_config: OptimizedBatchConfig,
        chunk_size: u32,
    ) -> Result<CampaignQueueEntry> {
        let entry = CampaignQueueEntry::new(campaign_id, workspace_id, total_recipients, chunk_size, batch_config);

        match self.store.insert_queue_entry(&entry).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Err(EngineError::QueueExists(campaign_id.to_string())),
            Err(e) => return Err(e.into()),
        }

        info!(
            campaign_id = %campaign_id,
            total_recipients,
            chunk_size = entry.chunk_size,
            total_chunks = entry.total_chunks,
            "Initialized campaign queue"
        );
        Ok(entry)
    }

    pub async fn find(&self, campaign_id: &str) -> Result<Option<CampaignQueueEntry>> {
        Ok(self.store.get_queue_entry(campaign_id).await?)
    }

    pub async fn get(&self, campaign_id: &str) -> Result<CampaignQueueEntry> {
        self.find(campaign_id)
            .await?
            .ok_or_else(|| EngineError::QueueNotFound(campaign_id.to_string()))
    }

    /// Take the entry for one chunk. A `processing` lease older than twice
    /// the chunk budget belongs to a crashed invocation and is taken over.
    pub async fn try_acquire(&self, campaign_id: &str, budget: Duration) -> Result<bool> {
        let now = Utc::now();
        let acquired = self
            .store
            .try_begin_processing(campaign_id, now, lease_expired_before(now, budget))
            .await?;
        if !acquired {
            debug!(campaign_id = %campaign_id, "Campaign queue is held by another invocation");
        }
        Ok(acquired)
    }

    pub async fn record_chunk(&self, campaign_id: &str, processed: u64) -> Result<()> {
        self.store
            .record_chunk_progress(campaign_id, processed)
            .await
            .map_err(|e| queue_error(campaign_id, e))
    }

    /// Set `pending` regardless of the current status
    pub async fn release(&self, campaign_id: &str) -> Result<()> {
        self.set_status(campaign_id, QueueStatus::Pending, None).await
    }

    /// End the caller's `processing` lease with `status`. Returns false when
    /// the entry was paused, removed or taken over in the meantime.
    pub async fn finish_chunk(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> Result<bool> {
        let finished = self
            .store
            .finish_processing(campaign_id, status, last_error)
            .await?;
        if !finished {
            debug!(campaign_id = %campaign_id, status = %status, "Campaign queue changed during chunk");
        } else if status == QueueStatus::Completed {
            info!(campaign_id = %campaign_id, "Campaign queue completed");
        }
        Ok(finished)
    }

    pub async fn pause(&self, campaign_id: &str) -> Result<()> {
        self.set_status(campaign_id, QueueStatus::Paused, None).await
    }

    pub async fn remove(&self, campaign_id: &str) -> Result<bool> {
        let removed = self.store.delete_queue_entry(campaign_id).await?;
        if removed {
            info!(campaign_id = %campaign_id, "Removed campaign queue");
        }
        Ok(removed)
    }

    /// Entries in `pending` or `processing`
    pub async fn live(&self) -> Result<Vec<CampaignQueueEntry>> {
        Ok(self.store.list_live_queues().await?)
    }

    /// Return an abandoned `processing` entry to `pending`. Returns whether
    /// the lease had expired.
    pub async fn release_expired_lease(&self, entry: &CampaignQueueEntry) -> Result<bool> {
        if entry.status != QueueStatus::Processing {
            return Ok(false);
        }
        // Taking the lease first keeps a live invocation's entry untouched
        if !self.try_acquire(&entry.campaign_id, entry.batch_config.max_processing_time()).await? {
            return Ok(false);
        }
        let released = self
            .finish_chunk(&entry.campaign_id, QueueStatus::Pending, Some("Processing lease expired".to_string()))
            .await?;
        if released {
            warn!(campaign_id = %entry.campaign_id, "Released expired campaign queue lease");
        }
        Ok(released)
    }

    async fn set_status(&self, campaign_id: &str, status: QueueStatus, last_error: Option<String>) -> Result<()> {
        self.store
            .set_queue_status(campaign_id, status, last_error)
            .await
            .map_err(|e| queue_error(campaign_id, e))
    }
}

/// Leases started before this instant are considered abandoned (twice the chunk budget)
pub fn lease_expired_before(now: DateTime<Utc>, budget: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(budget.saturating_mul(2))
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn queue_error(campaign_id: &str, e: StoreError) -> EngineError {
    match e {
        StoreError::NotFound { .. } => EngineError::QueueNotFound(campaign_id.to_string()),
        e => e.into(),
    }
}
