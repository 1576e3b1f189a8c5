//! Stale recipient sweep
//!
//! Background task that periodically returns stuck recipients to `pending`:
//! - `calling` for longer than the staleness threshold: re-dialled while
//!   attempts remain, otherwise failed with "max attempts exceeded". Age is
//!   measured from the scheduled dial time when that is later, and calls the
//!   primary provider holds inside a batch get the longer batch threshold.
//! - `queued` for longer than the threshold (claimed by a crashed invocation)
//! - dispatch failures older than the campaign's retry delay with attempts left
//!
//! Only recipients of active campaigns whose queue is not completed are
//! touched. Expired `processing` leases are released as well.

use crate::error::Result;
use crate::queue::CampaignQueue;
use crate::recipient_state::RecipientStateMachine;
use crate::store::{CampaignStore, CounterDelta, Placement, StaleQuery};
use chrono::{DateTime, Utc};
use od_common::{CallStatus, CampaignStatus, OptimizedBatchConfig, QueueStatus, Recipient};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Configuration for the stale sweep.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Whether the sweep runs. Default: true.
    pub enabled: bool,
    /// How often to sweep. Default: 60 seconds.
    pub interval: Duration,
    /// Age after which a placed `calling` recipient is considered lost. Default: 60 minutes.
    pub calling_stale_after: Duration,
    /// Age after which a `calling` recipient submitted in a primary batch, with
    /// no call id, is considered lost. Default: 24 hours.
    pub batch_stale_after: Duration,
    /// Age after which a `queued` recipient is considered abandoned. Default: 10 minutes.
    pub queued_stale_after: Duration,
    /// Maximum recipients examined per category per sweep. Default: 500.
    pub batch_limit: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            calling_stale_after: Duration::from_secs(60 * 60),
            batch_stale_after: Duration::from_secs(24 * 60 * 60),
            queued_stale_after: Duration::from_secs(10 * 60),
            batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub calling_requeued: usize,
    pub calling_failed: usize,
    pub queued_released: usize,
    pub failed_retried: usize,
    pub leases_released: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.calling_requeued + self.calling_failed + self.queued_released + self.failed_retried + self.leases_released
    }
}

pub struct StaleRecipientSweeper {
    store: Arc<dyn CampaignStore>,
    states: RecipientStateMachine,
    queue: CampaignQueue,
    config: SweeperConfig,
}

impl StaleRecipientSweeper {
    pub fn new(store: Arc<dyn CampaignStore>, config: SweeperConfig) -> Self {
        Self {
            states: RecipientStateMachine::new(store.clone()),
            queue: CampaignQueue::new(store.clone()),
            store,
            config,
        }
    }

    /// Run the sweep indefinitely until cancelled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Stale recipient sweep is disabled");
            return;
        }

        info!(
            interval = ?self.config.interval,
            calling_stale_after = ?self.config.calling_stale_after,
            batch_stale_after = ?self.config.batch_stale_after,
            queued_stale_after = ?self.config.queued_stale_after,
            "Starting stale recipient sweep"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Perform a single sweep, logging failures.
    pub async fn sweep_once(&self) -> SweepReport {
        debug!("Sweeping stale recipients");
        match self.try_sweep().await {
            Ok(report) => {
                if report.total() > 0 {
                    info!(
                        calling_requeued = report.calling_requeued,
                        calling_failed = report.calling_failed,
                        queued_released = report.queued_released,
                        failed_retried = report.failed_retried,
                        leases_released = report.leases_released,
                        "Recovered stale recipients"
                    );
                }
                report
            }
            Err(e) => {
                error!(error = %e, "Stale recipient sweep failed");
                SweepReport::default()
            }
        }
    }

    pub async fn try_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut scope = SweepScope::default();
        let now = Utc::now();

        for entry in self.queue.live().await? {
            if entry.status == QueueStatus::Processing && self.queue.release_expired_lease(&entry).await? {
                report.leases_released += 1;
            }
        }

        let mut calling = self
            .stale(CallStatus::Calling, older_than(now, self.config.calling_stale_after), Placement::Placed)
            .await?;
        calling.extend(
            self.stale(CallStatus::Calling, older_than(now, self.config.batch_stale_after), Placement::Unplaced)
                .await?,
        );
        for recipient in calling {
            let Some(batch) = scope.batch_config(self.store.as_ref(), &recipient.campaign_id).await? else {
                continue;
            };
            if recipient.attempts < batch.max_attempts {
                if self.states.requeue(&recipient.id, CallStatus::Calling).await? {
                    scope.adjust(&recipient, CounterDelta { pending: 1, successful: -1, failed: 0 });
                    report.calling_requeued += 1;
                }
            } else if self.states.fail_exhausted(&recipient.id).await? {
                scope.adjust(&recipient, CounterDelta { pending: 0, successful: -1, failed: 1 });
                report.calling_failed += 1;
            }
        }

        let queued = self
            .stale(CallStatus::Queued, older_than(now, self.config.queued_stale_after), Placement::Any)
            .await?;
        for recipient in queued {
            if scope.batch_config(self.store.as_ref(), &recipient.campaign_id).await?.is_none() {
                continue;
            }
            // Claiming never touched the counters
            if self.states.requeue(&recipient.id, CallStatus::Queued).await? {
                report.queued_released += 1;
            }
        }

        let failed = self.stale(CallStatus::Failed, now, Placement::Unplaced).await?;
        for recipient in failed {
            let Some(batch) = scope.batch_config(self.store.as_ref(), &recipient.campaign_id).await? else {
                continue;
            };
            if recipient.attempts >= batch.max_attempts || recipient.updated_at >= older_than(now, batch.retry_delay()) {
                continue;
            }
            if self.states.requeue(&recipient.id, CallStatus::Failed).await? {
                scope.adjust(&recipient, CounterDelta { pending: 1, successful: 0, failed: -1 });
                report.failed_retried += 1;
            }
        }

        for (campaign_id, delta) in scope.deltas {
            if let Err(e) = self.store.apply_campaign_counters(&campaign_id, delta).await {
                error!(campaign_id = %campaign_id, error = %e, "Failed to update campaign counters after sweep");
            }
        }

        metrics::counter!("outdial.sweeper.recovered_total", "kind" => "calling_requeued")
            .increment(report.calling_requeued as u64);
        metrics::counter!("outdial.sweeper.recovered_total", "kind" => "calling_failed")
            .increment(report.calling_failed as u64);
        metrics::counter!("outdial.sweeper.recovered_total", "kind" => "queued_released")
            .increment(report.queued_released as u64);
        metrics::counter!("outdial.sweeper.recovered_total", "kind" => "failed_retried")
            .increment(report.failed_retried as u64);
        metrics::counter!("outdial.sweeper.recovered_total", "kind" => "lease_released")
            .increment(report.leases_released as u64);

        Ok(report)
    }

    async fn stale(
        &self,
        status: CallStatus,
        stale_before: DateTime<Utc>,
        placement: Placement,
    ) -> Result<Vec<Recipient>> {
        let query = StaleQuery {
            status,
            stale_before,
            attempts_below: None,
            placement,
            limit: self.config.batch_limit,
        };
        Ok(self.store.find_stale_recipients(&query).await?)
    }
}

/// Per-sweep cache of campaign eligibility and pending counter changes
#[derive(Default)]
struct SweepScope {
    /// `None` for campaigns the sweep must leave alone
    campaigns: HashMap<String, Option<OptimizedBatchConfig>>,
    deltas: HashMap<String, CounterDelta>,
}

impl SweepScope {
    async fn batch_config(&mut self, store: &dyn CampaignStore, campaign_id: &str) -> Result<Option<OptimizedBatchConfig>> {
        if let Some(cached) = self.campaigns.get(campaign_id) {
            return Ok(cached.clone());
        }

        let active = store
            .get_campaign(campaign_id)
            .await?
            .is_some_and(|c| c.status == CampaignStatus::Active);
        let batch = if active {
            store
                .get_queue_entry(campaign_id)
                .await?
                .filter(|entry| entry.status != QueueStatus::Completed)
                .map(|entry| entry.batch_config)
        } else {
            None
        };

        self.campaigns.insert(campaign_id.to_string(), batch.clone());
        Ok(batch)
    }

    fn adjust(&mut self, recipient: &Recipient, delta: CounterDelta) {
        let total = self.deltas.entry(recipient.campaign_id.clone()).or_default();
        total.pending += delta.pending;
        total.successful += delta.successful;
        total.failed += delta.failed;
    }
}

fn older_than(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
