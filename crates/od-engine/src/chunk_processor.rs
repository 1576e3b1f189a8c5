//! Chunk Processor
//!
//! One invocation of [`ChunkProcessor::process_queue_chunk`] handles at most
//! one chunk of a campaign:
//! 1. Stop on cancelled/paused/failed campaigns and queues
//! 2. Defer when outside business hours
//! 3. Acquire the queue entry (`pending → processing`)
//! 4. Claim up to `chunk_size` pending recipients, oldest first
//! 5. Dispatch through the provider gateway within the wall-clock budget
//! 6. Apply recipient transitions, counters and queue progress
//!    (a chunk that dialled nobody is deferred and not counted)
//!
//! The lifecycle operations (start, resume, pause, cancel, drive) sit on top.

use crate::business_hours::{self, BusinessHoursEvaluator, NextWindow};
use crate::error::{EngineError, Result, StoreError};
use crate::queue::CampaignQueue;
use crate::recipient_state::RecipientStateMachine;
use crate::store::{CampaignStore, CounterDelta};
use chrono::{DateTime, Utc};
use od_common::{
    CallStatus, Campaign, CampaignQueueEntry, CampaignStatus, OptimizedBatchConfig, QueueStatus, Recipient,
};
use od_gateway::{
    BatchDispatchResult, DispatchOptions, GatewayError, OutcomeStatus, ProviderGateway, ProviderKind,
    ResolvedProviders,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const OUTSIDE_BUSINESS_HOURS: &str = "Outside business hours";

/// Defaults applied when a campaign is started without explicit tuning
#[derive(Debug, Clone)]
pub struct ChunkProcessorConfig {
    pub default_chunk_size: u32,
    pub batch_config: OptimizedBatchConfig,
}

impl Default for ChunkProcessorConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 50,
            batch_config: OptimizedBatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// A chunk was dispatched and more work may remain
    Dispatched,
    /// Nothing left to dial; queue and campaign are completed
    Completed,
    /// Nothing pending, but failed recipients are waiting for a retry
    AwaitingRetry,
    OutsideBusinessHours,
    /// Another invocation holds the queue entry
    Busy,
    /// Primary breaker open and no secondary binding; recipients released
    CircuitOpen,
    /// The provider rejected the whole chunk
    ProviderFailed,
    /// Nothing was dialled: the fallback waits for the batch start, or the
    /// time budget ran out first. Recipients were released.
    Deferred,
    Paused,
    Cancelled,
    /// The queue entry was marked failed
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCounts {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub campaign_id: String,
    pub outcome: ChunkOutcome,
    pub success: bool,
    pub has_more: bool,
    pub pending_count: u64,
    pub chunk_result: ChunkCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_window: Option<NextWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl ChunkResult {
    pub(crate) fn new(campaign_id: &str, outcome: ChunkOutcome) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            outcome,
            success: false,
            has_more: false,
            pending_count: 0,
            chunk_result: ChunkCounts::default(),
            provider: None,
            fallback_used: false,
            error: None,
            next_window: None,
            retry_at: None,
        }
    }

    fn stopped(campaign_id: &str, outcome: ChunkOutcome, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(campaign_id, outcome)
        }
    }

    /// Whether a driver loop should immediately run another chunk
    pub fn should_continue(&self) -> bool {
        self.success && self.has_more
    }
}

/// Options of the chunked start
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartOptions {
    pub chunk_size: Option<u32>,
    pub concurrency: Option<usize>,
    pub process_first_chunk: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            concurrency: None,
            process_first_chunk: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCampaignResponse {
    pub queue: CampaignQueueEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_chunk: Option<ChunkResult>,
    /// Endpoint to call for the next chunk, while work remains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_processing: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveSummary {
    pub chunks: u32,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last: Option<ChunkResult>,
}

pub fn continue_processing_path(campaign_id: &str) -> String {
    format!("/api/campaigns/{campaign_id}/process-chunk")
}

pub struct ChunkProcessor {
    store: Arc<dyn CampaignStore>,
    queue: CampaignQueue,
    states: RecipientStateMachine,
    gateway: Arc<ProviderGateway>,
    config: ChunkProcessorConfig,
}

impl ChunkProcessor {
    pub fn new(store: Arc<dyn CampaignStore>, gateway: Arc<ProviderGateway>, config: ChunkProcessorConfig) -> Self {
        Self {
            queue: CampaignQueue::new(store.clone()),
            states: RecipientStateMachine::new(store.clone()),
            store,
            gateway,
            config,
        }
    }

    pub fn queue(&self) -> &CampaignQueue {
        &self.queue
    }

    pub fn states(&self) -> &RecipientStateMachine {
        &self.states
    }

    pub fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Validate the campaign, create its queue, mark it active and optionally
    /// process the first chunk.
    pub async fn start_campaign(&self, campaign_id: &str, options: StartOptions) -> Result<StartCampaignResponse> {
        let campaign = self.load_campaign(campaign_id).await?;
        if !campaign.status.can_start() {
            return Err(EngineError::Validation(format!(
                "Campaign {campaign_id} cannot be started from status {}",
                campaign.status
            )));
        }

        self.resolve_providers(&campaign).await?;
        business_hours::validate(&campaign.business_hours, &campaign.timezone)?;
        if let Some(expires_at) = campaign.expires_at {
            if expires_at <= Utc::now() {
                return Err(EngineError::Validation(format!(
                    "Campaign {campaign_id} expired at {expires_at}"
                )));
            }
        }

        let pending = self.store.count_recipients(campaign_id, CallStatus::Pending).await?;
        if pending == 0 {
            return Err(EngineError::Validation(format!(
                "Campaign {campaign_id} has no pending recipients"
            )));
        }

        if let Some(existing) = self.queue.find(campaign_id).await? {
            if matches!(existing.status, QueueStatus::Pending | QueueStatus::Processing) {
                return Err(EngineError::QueueExists(campaign_id.to_string()));
            }
            self.queue.remove(campaign_id).await?;
        }

        let mut batch_config = self.config.batch_config.clone();
        if let Some(concurrency) = options.concurrency {
            batch_config.concurrency_limit = concurrency.max(1);
        }
        let chunk_size = options.chunk_size.unwrap_or(self.config.default_chunk_size);
        self.queue
            .initialize(campaign_id, &campaign.workspace_id, pending, batch_config, chunk_size)
            .await?;

        // Reconcile the pending counter with what the run will actually dial
        let delta = CounterDelta {
            pending: pending as i64 - campaign.pending_recipients as i64,
            ..Default::default()
        };
        if !delta.is_zero() {
            self.store.apply_campaign_counters(campaign_id, delta).await?;
        }
        self.store.set_campaign_status(campaign_id, CampaignStatus::Active).await?;
        info!(campaign_id = %campaign_id, pending, chunk_size, "Campaign started");
        metrics::counter!("outdial.engine.campaigns_started_total").increment(1);

        let first_chunk = if options.process_first_chunk {
            Some(self.process_queue_chunk(campaign_id).await?)
        } else {
            None
        };

        let continue_processing = match &first_chunk {
            Some(chunk) if !chunk.has_more => None,
            _ => Some(continue_processing_path(campaign_id)),
        };

        Ok(StartCampaignResponse {
            queue: self.queue.get(campaign_id).await?,
            first_chunk,
            continue_processing,
        })
    }

    /// Re-activate a paused campaign and dispatch its pending recipients
    /// immediately, ignoring any future start instant.
    pub async fn resume_campaign(&self, campaign_id: &str) -> Result<ChunkResult> {
        let campaign = self.load_campaign(campaign_id).await?;
        if !matches!(campaign.status, CampaignStatus::Paused | CampaignStatus::Active) {
            return Err(EngineError::Validation(format!(
                "Campaign {campaign_id} cannot be resumed from status {}",
                campaign.status
            )));
        }

        match self.queue.find(campaign_id).await? {
            Some(entry) if entry.status != QueueStatus::Processing => self.queue.release(campaign_id).await?,
            Some(_) => {}
            None => {
                let pending = self.store.count_recipients(campaign_id, CallStatus::Pending).await?;
                self.queue
                    .initialize(
                        campaign_id,
                        &campaign.workspace_id,
                        pending,
                        self.config.batch_config.clone(),
                        self.config.default_chunk_size,
                    )
                    .await?;
            }
        }

        if campaign.status != CampaignStatus::Active {
            self.store.set_campaign_status(campaign_id, CampaignStatus::Active).await?;
        }
        info!(campaign_id = %campaign_id, "Campaign resumed");
        self.process_chunk(campaign_id, true).await
    }

    /// Stop dispatching. Calls already placed are not recalled.
    pub async fn pause_campaign(&self, campaign_id: &str) -> Result<()> {
        let campaign = self.load_campaign(campaign_id).await?;
        if campaign.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "Campaign {campaign_id} is already {}",
                campaign.status
            )));
        }

        self.store.set_campaign_status(campaign_id, CampaignStatus::Paused).await?;
        match self.queue.pause(campaign_id).await {
            Ok(()) | Err(EngineError::QueueNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        info!(campaign_id = %campaign_id, "Campaign paused");
        Ok(())
    }

    /// Cancel the campaign and delete its queue. Returns whether a queue existed.
    pub async fn cancel_campaign(&self, campaign_id: &str) -> Result<bool> {
        let campaign = self.load_campaign(campaign_id).await?;
        if campaign.status == CampaignStatus::Completed {
            return Err(EngineError::Validation(format!("Campaign {campaign_id} is already completed")));
        }

        self.store.set_campaign_status(campaign_id, CampaignStatus::Cancelled).await?;
        let removed = self.queue.remove(campaign_id).await?;
        info!(campaign_id = %campaign_id, queue_removed = removed, "Campaign cancelled");
        Ok(removed)
    }

    /// Process chunks back to back, pausing `delay_between_chunks_ms` between
    /// them, until nothing is left or a chunk is deferred.
    pub async fn drive_campaign(&self, campaign_id: &str) -> Result<DriveSummary> {
        let delay = self.queue.get(campaign_id).await?.batch_config.delay_between_chunks();
        let mut summary = DriveSummary::default();

        loop {
            let chunk = self.process_queue_chunk(campaign_id).await?;
            if matches!(chunk.outcome, ChunkOutcome::Dispatched | ChunkOutcome::Completed) {
                summary.chunks += 1;
            }
            summary.successful += chunk.chunk_result.successful as u64;
            summary.failed += chunk.chunk_result.failed as u64;
            summary.skipped += chunk.chunk_result.skipped as u64;

            let more = chunk.should_continue();
            summary.last = Some(chunk);
            if !more {
                break;
            }
            tokio::time::sleep(delay).await;
        }

        info!(
            campaign_id = %campaign_id,
            chunks = summary.chunks,
            successful = summary.successful,
            failed = summary.failed,
            "Campaign drive finished"
        );
        Ok(summary)
    }

    // ========================================================================
    // Chunk processing
    // ========================================================================

    /// Process the next chunk of a campaign
    pub async fn process_queue_chunk(&self, campaign_id: &str) -> Result<ChunkResult> {
        self.process_chunk(campaign_id, false).await
    }

    async fn process_chunk(&self, campaign_id: &str, force_now: bool) -> Result<ChunkResult> {
        let campaign = self.load_campaign(campaign_id).await?;
        if campaign.status == CampaignStatus::Cancelled {
            debug!(campaign_id = %campaign_id, "Campaign cancelled, chunk aborted");
            return Ok(ChunkResult::stopped(campaign_id, ChunkOutcome::Cancelled, "Campaign cancelled"));
        }

        let entry = self.queue.get(campaign_id).await?;
        match entry.status {
            QueueStatus::Completed => {
                let mut result = ChunkResult::new(campaign_id, ChunkOutcome::Completed);
                result.success = true;
                return Ok(result);
            }
            QueueStatus::Paused => {
                return Ok(ChunkResult::stopped(campaign_id, ChunkOutcome::Paused, "Campaign queue is paused"));
            }
            QueueStatus::Failed => {
                let error = entry.last_error.clone().unwrap_or_else(|| "Campaign queue failed".to_string());
                return Ok(ChunkResult::stopped(campaign_id, ChunkOutcome::Failed, error));
            }
            QueueStatus::Pending | QueueStatus::Processing => {}
        }

        match campaign.status {
            CampaignStatus::Active => {}
            CampaignStatus::Paused => {
                return Ok(ChunkResult::stopped(campaign_id, ChunkOutcome::Paused, "Campaign is paused"));
            }
            status => {
                return Err(EngineError::Validation(format!(
                    "Campaign {campaign_id} is {status}, not active"
                )));
            }
        }

        let evaluator = BusinessHoursEvaluator::for_campaign(&campaign)?;
        let now = Utc::now();
        if !evaluator.is_within_business_hours(now) {
            let next_window = evaluator.next_business_hours_start(now);
            info!(
                campaign_id = %campaign_id,
                next_window = ?next_window.as_ref().map(|w| w.at),
                "Outside business hours, chunk deferred"
            );
            metrics::counter!("outdial.engine.deferrals_total", "reason" => "business_hours").increment(1);
            let mut result = ChunkResult::stopped(campaign_id, ChunkOutcome::OutsideBusinessHours, OUTSIDE_BUSINESS_HOURS);
            result.has_more = true;
            result.pending_count = self.store.count_recipients(campaign_id, CallStatus::Pending).await?;
            result.next_window = next_window;
            return Ok(result);
        }

        let budget = entry.batch_config.max_processing_time();
        if !self.queue.try_acquire(campaign_id, budget).await? {
            let mut result = ChunkResult::stopped(campaign_id, ChunkOutcome::Busy, "Chunk already in progress");
            result.has_more = true;
            return Ok(result);
        }
        let deadline = Instant::now() + budget;

        match self.run_chunk(&campaign, &entry, force_now, deadline).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "Chunk failed, releasing campaign queue");
                if let Err(release_err) = self
                    .queue
                    .finish_chunk(campaign_id, QueueStatus::Pending, Some(e.to_string()))
                    .await
                {
                    error!(campaign_id = %campaign_id, error = %release_err, "Failed to release campaign queue");
                }
                Err(e)
            }
        }
    }

    /// Body of a chunk while the caller holds the queue lease
    async fn run_chunk(
        &self,
        campaign: &Campaign,
        entry: &CampaignQueueEntry,
        force_now: bool,
        deadline: Instant,
    ) -> Result<ChunkResult> {
        let campaign_id = campaign.id.as_str();

        let prepared = match self.resolve_providers(campaign).await {
            Ok(providers) => business_hours::compile_block_rules(&campaign.business_hours)
                .map(|rules| (providers, rules))
                .map_err(EngineError::from),
            Err(e) => Err(e),
        };
        let (providers, block_rules) = match prepared {
            Ok(prepared) => prepared,
            Err(e) if e.is_validation() => return self.fail_queue(campaign_id, e).await,
            Err(e) => return Err(e),
        };

        let recipients = self.states.claim_pending(campaign_id, entry.chunk_size).await?;
        if recipients.is_empty() {
            return self.finish_without_work(campaign_id, entry).await;
        }

        let options = DispatchOptions {
            nbf: if force_now { None } else { campaign.start_at },
            exp: campaign.expires_at,
            block_rules,
            deadline: Some(deadline),
            ..DispatchOptions::from_batch_config(&entry.batch_config)
        };
        debug!(campaign_id = %campaign_id, recipients = recipients.len(), "Dispatching chunk");

        let scheduled_for = options.nbf.filter(|nbf| *nbf > Utc::now());
        let dispatched = if force_now {
            self.gateway.resume_batch(campaign, &recipients, &providers, &options).await
        } else {
            self.gateway.start_batch(campaign, &recipients, &providers, &options).await
        };

        let mut result = ChunkResult::new(campaign_id, ChunkOutcome::Dispatched);
        match dispatched {
            Ok(batch) => {
                result.chunk_result = self.apply_batch(&recipients, &batch, scheduled_for).await;
                result.provider = Some(batch.provider);
                result.fallback_used = batch.fallback_used;
                result.error = batch.primary_error;
                result.success = true;
                if result.chunk_result.successful + result.chunk_result.failed == 0 {
                    return Ok(self.defer_chunk(campaign_id, result, scheduled_for).await);
                }
            }
            Err(e) => match self.handle_dispatch_error(campaign_id, &recipients, e).await? {
                DispatchFailure::Deferred(deferred) => return Ok(deferred),
                DispatchFailure::Failed { counts, error } => {
                    result.outcome = ChunkOutcome::ProviderFailed;
                    result.chunk_result = counts;
                    result.provider = Some(ProviderKind::Primary);
                    result.error = Some(error);
                }
            },
        }

        self.record_progress(campaign_id, result.chunk_result).await;
        Ok(self.finish_chunk(campaign_id, entry, result).await)
    }

    /// Persist recipient transitions for a dispatched batch. Persistence
    /// failures are logged; the placed calls stand.
    async fn apply_batch(
        &self,
        recipients: &[Recipient],
        batch: &BatchDispatchResult,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> ChunkCounts {
        if batch.provider == ProviderKind::Primary {
            for recipient in recipients {
                log_transition(&recipient.id, self.states.mark_batched(&recipient.id, scheduled_for).await);
            }
            return ChunkCounts {
                successful: recipients.len(),
                ..Default::default()
            };
        }

        for outcome in &batch.outcomes {
            let id = outcome.recipient_id.as_str();
            let applied = match outcome.status {
                OutcomeStatus::Placed => self.states.mark_calling(id, outcome.external_call_id.clone()).await,
                OutcomeStatus::Failed => {
                    let error = outcome.error.clone().unwrap_or_else(|| "Call failed".to_string());
                    self.states.mark_dispatch_failed(id, error).await
                }
                OutcomeStatus::Skipped => self.states.release(id).await,
            };
            log_transition(id, applied);
        }

        ChunkCounts {
            successful: batch.successful,
            failed: batch.failed,
            skipped: batch.skipped,
        }
    }

    async fn handle_dispatch_error(
        &self,
        campaign_id: &str,
        recipients: &[Recipient],
        e: GatewayError,
    ) -> Result<DispatchFailure> {
        if let Some(retry_at) = e.retry_at() {
            // Nothing was dialled; hand the recipients back untouched
            self.release_all(recipients).await;
            self.release_queue(campaign_id, Some(e.to_string())).await;
            warn!(campaign_id = %campaign_id, %retry_at, "Provider circuit open, chunk deferred");
            metrics::counter!("outdial.engine.deferrals_total", "reason" => "circuit_open").increment(1);

            let mut deferred = ChunkResult::stopped(campaign_id, ChunkOutcome::CircuitOpen, e.to_string());
            deferred.has_more = true;
            deferred.retry_at = Some(retry_at);
            deferred.pending_count = self.pending_count(campaign_id).await.unwrap_or(0);
            return Ok(DispatchFailure::Deferred(deferred));
        }

        if e.is_validation() {
            self.release_all(recipients).await;
            return Ok(DispatchFailure::Deferred(self.fail_queue(campaign_id, e.into()).await?));
        }

        warn!(campaign_id = %campaign_id, error = %e, recipients = recipients.len(), "Chunk dispatch failed");
        let error = e.to_string();
        for recipient in recipients {
            log_transition(
                &recipient.id,
                self.states.mark_dispatch_failed(&recipient.id, error.clone()).await,
            );
        }
        Ok(DispatchFailure::Failed {
            counts: ChunkCounts {
                failed: recipients.len(),
                ..Default::default()
            },
            error,
        })
    }

    async fn record_progress(&self, campaign_id: &str, counts: ChunkCounts) {
        let dialled = (counts.successful + counts.failed) as i64;
        let delta = CounterDelta {
            pending: -dialled,
            successful: counts.successful as i64,
            failed: counts.failed as i64,
        };
        if let Err(e) = self.store.apply_campaign_counters(campaign_id, delta).await {
            error!(campaign_id = %campaign_id, error = %e, "Failed to update campaign counters");
        }
        if let Err(e) = self.queue.record_chunk(campaign_id, dialled as u64).await {
            error!(campaign_id = %campaign_id, error = %e, "Failed to record chunk progress");
        }

        metrics::counter!("outdial.engine.chunks_total").increment(1);
        metrics::counter!("outdial.engine.recipients_dispatched_total").increment(counts.successful as u64);
        metrics::counter!("outdial.engine.recipients_failed_total").increment(counts.failed as u64);
        metrics::counter!("outdial.engine.recipients_skipped_total").increment(counts.skipped as u64);
    }

    /// Release the lease, completing queue and campaign once nothing is left
    /// to dial or retry. Calls have been placed by now, so persistence
    /// failures are logged and the dispatch result is returned regardless.
    async fn finish_chunk(
        &self,
        campaign_id: &str,
        entry: &CampaignQueueEntry,
        mut result: ChunkResult,
    ) -> ChunkResult {
        let pending = self.pending_count(campaign_id).await;
        result.pending_count = pending.unwrap_or(0);
        // Unknown pending count: let the caller come back
        result.has_more = pending.map_or(true, |pending| pending > 0);

        if pending == Some(0) {
            match self
                .store
                .count_retryable_failures(campaign_id, entry.batch_config.max_attempts)
                .await
            {
                Ok(0) => match self.complete(campaign_id).await {
                    Ok(completed) => {
                        if completed {
                            result.outcome = ChunkOutcome::Completed;
                        }
                        self.log_chunk(&result);
                        return result;
                    }
                    Err(e) => error!(campaign_id = %campaign_id, error = %e, "Failed to complete campaign queue"),
                },
                Ok(_) => {}
                Err(e) => error!(campaign_id = %campaign_id, error = %e, "Failed to count retryable recipients"),
            }
        }

        let note = (result.chunk_result.skipped > 0).then(|| "Chunk stopped at processing time limit".to_string());
        self.release_queue(campaign_id, note).await;
        self.log_chunk(&result);
        result
    }

    /// End a chunk that dialled nobody. It does not count as processed.
    async fn defer_chunk(
        &self,
        campaign_id: &str,
        mut result: ChunkResult,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> ChunkResult {
        let reason = if scheduled_for.is_some() { "fallback_scheduled" } else { "processing_time" };
        metrics::counter!("outdial.engine.deferrals_total", "reason" => reason).increment(1);
        metrics::counter!("outdial.engine.recipients_skipped_total").increment(result.chunk_result.skipped as u64);
        info!(
            campaign_id = %campaign_id,
            skipped = result.chunk_result.skipped,
            retry_at = ?scheduled_for,
            "Nothing dialled, chunk deferred"
        );

        let error = match (&result.error, scheduled_for) {
            (Some(primary), Some(at)) => format!("{primary}; fallback deferred until {at}"),
            (Some(primary), None) => format!("{primary}; no call started within the processing time limit"),
            (None, _) => "No call started within the processing time limit".to_string(),
        };
        self.release_queue(campaign_id, Some(error.clone())).await;

        result.outcome = ChunkOutcome::Deferred;
        result.success = false;
        result.has_more = true;
        result.error = Some(error);
        result.retry_at = scheduled_for;
        result.pending_count = self.pending_count(campaign_id).await.unwrap_or(0);
        result
    }

    /// Return the lease to `pending`; an unreleased lease expires on its own
    async fn release_queue(&self, campaign_id: &str, note: Option<String>) {
        if let Err(e) = self.queue.finish_chunk(campaign_id, QueueStatus::Pending, note).await {
            error!(campaign_id = %campaign_id, error = %e, "Failed to release campaign queue");
        }
    }

    async fn pending_count(&self, campaign_id: &str) -> Option<u64> {
        match self.store.count_recipients(campaign_id, CallStatus::Pending).await {
            Ok(pending) => Some(pending),
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "Failed to count pending recipients");
                None
            }
        }
    }

    async fn finish_without_work(&self, campaign_id: &str, entry: &CampaignQueueEntry) -> Result<ChunkResult> {
        let retryable = self
            .store
            .count_retryable_failures(campaign_id, entry.batch_config.max_attempts)
            .await?;

        let mut result = ChunkResult::new(campaign_id, ChunkOutcome::Completed);
        result.success = true;
        if retryable > 0 {
            // The stale sweep returns these to pending after the retry delay
            self.queue.finish_chunk(campaign_id, QueueStatus::Pending, None).await?;
            result.outcome = ChunkOutcome::AwaitingRetry;
            debug!(campaign_id = %campaign_id, retryable, "No pending recipients, waiting for retries");
            return Ok(result);
        }

        self.complete(campaign_id).await?;
        Ok(result)
    }

    async fn complete(&self, campaign_id: &str) -> Result<bool> {
        if !self.queue.finish_chunk(campaign_id, QueueStatus::Completed, None).await? {
            return Ok(false);
        }
        if let Err(e) = self.store.set_campaign_status(campaign_id, CampaignStatus::Completed).await {
            error!(campaign_id = %campaign_id, error = %e, "Failed to mark campaign completed");
        }
        metrics::counter!("outdial.engine.campaigns_completed_total").increment(1);
        info!(campaign_id = %campaign_id, "Campaign completed");
        Ok(true)
    }

    async fn fail_queue(&self, campaign_id: &str, e: EngineError) -> Result<ChunkResult> {
        let message = e.to_string();
        warn!(campaign_id = %campaign_id, error = %message, "Campaign cannot be dispatched");
        if !self
            .queue
            .finish_chunk(campaign_id, QueueStatus::Failed, Some(message.clone()))
            .await?
        {
            debug!(campaign_id = %campaign_id, "Campaign queue changed before it could be failed");
        }
        Ok(ChunkResult::stopped(campaign_id, ChunkOutcome::Failed, message))
    }

    async fn release_all(&self, recipients: &[Recipient]) {
        for recipient in recipients {
            log_transition(&recipient.id, self.states.release(&recipient.id).await);
        }
    }

    async fn resolve_providers(&self, campaign: &Campaign) -> Result<ResolvedProviders> {
        let agent = self.store.get_agent(&campaign.agent_id).await?.ok_or_else(|| {
            EngineError::Validation(format!("Voice agent {} not found", campaign.agent_id))
        })?;
        Ok(ResolvedProviders::resolve(&agent)?)
    }

    async fn load_campaign(&self, campaign_id: &str) -> Result<Campaign> {
        match self.store.get_campaign(campaign_id).await {
            Ok(Some(campaign)) => Ok(campaign),
            Ok(None) | Err(StoreError::NotFound { .. }) => Err(EngineError::CampaignNotFound(campaign_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn log_chunk(&self, result: &ChunkResult) {
        info!(
            campaign_id = %result.campaign_id,
            successful = result.chunk_result.successful,
            failed = result.chunk_result.failed,
            skipped = result.chunk_result.skipped,
            pending = result.pending_count,
            provider = ?result.provider,
            fallback_used = result.fallback_used,
            has_more = result.has_more,
            "Chunk processed"
        );
    }
}

enum DispatchFailure {
    /// Chunk ended early; the queue has already been released or failed
    Deferred(ChunkResult),
    Failed { counts: ChunkCounts, error: String },
}

fn log_transition(recipient_id: &str, applied: Result<bool>) {
    if let Err(e) = applied {
        error!(recipient_id = %recipient_id, error = %e, "Failed to persist recipient status");
    }
}
