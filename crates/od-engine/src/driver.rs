//! Campaign Driver - background worker pool for campaign runs
//!
//! Campaign ids are submitted to a bounded channel consumed by N workers.
//! Each worker drives one campaign chunk by chunk and records how the run
//! ended. A scheduler tick re-submits campaigns whose queue entry is still
//! pending, so deferred runs resume once business hours reopen or the
//! breaker closes. The queue entry stays the durable handoff: a restart
//! loses only the tracking map.

use crate::chunk_processor::{ChunkOutcome, ChunkProcessor, DriveSummary};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use od_common::QueueStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    /// How often live queues are re-submitted
    pub tick_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 256,
            tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    Queued,
    Running,
    /// Nothing left to dispatch, or the campaign was paused/cancelled
    Finished,
    /// Stopped early; the scheduler tick will pick it up again
    Deferred,
    Failed,
}

impl DriveState {
    fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveRecord {
    pub campaign_id: String,
    pub state: DriveState,
    pub chunks: u32,
    pub successful: u64,
    pub failed: u64,
    pub last_outcome: Option<ChunkOutcome>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DriveRecord {
    fn queued(campaign_id: &str) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            state: DriveState::Queued,
            chunks: 0,
            successful: 0,
            failed: 0,
            last_outcome: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    fn finish(&mut self, summary: &DriveSummary) {
        self.chunks += summary.chunks;
        self.successful += summary.successful;
        self.failed += summary.failed;
        self.last_outcome = summary.last.as_ref().map(|c| c.outcome);
        self.last_error = summary.last.as_ref().and_then(|c| c.error.clone());
        self.state = match self.last_outcome {
            Some(ChunkOutcome::Failed) => DriveState::Failed,
            Some(ChunkOutcome::Completed | ChunkOutcome::Paused | ChunkOutcome::Cancelled) | None => {
                DriveState::Finished
            }
            Some(ChunkOutcome::Dispatched) => match summary.last.as_ref().is_some_and(|c| c.has_more) {
                true => DriveState::Deferred,
                false => DriveState::Finished,
            },
            Some(_) => DriveState::Deferred,
        };
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted,
    /// Already queued or running; ignored
    AlreadyActive,
    /// Channel full or driver stopped
    Rejected,
}

pub struct CampaignDriver {
    processor: Arc<ChunkProcessor>,
    config: DriverConfig,
    tx: mpsc::Sender<String>,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    records: Arc<DashMap<String, DriveRecord>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl CampaignDriver {
    pub fn new(processor: Arc<ChunkProcessor>, config: DriverConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            processor,
            config,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            records: Arc::new(DashMap::new()),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Spawn the workers. Calling it again while running is a no-op.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        self.shutdown_tx.send_replace(false);

        let workers = self.config.workers.max(1);
        info!(workers, capacity = self.config.channel_capacity, "Starting campaign driver");

        (0..workers)
            .map(|worker_id| {
                let processor = self.processor.clone();
                let rx = self.rx.clone();
                let records = self.records.clone();
                let shutdown = self.shutdown_tx.subscribe();
                tokio::spawn(Self::worker_loop(worker_id, processor, rx, records, shutdown))
            })
            .collect()
    }

    /// Stop the workers after their current campaign
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping campaign driver");
            self.shutdown_tx.send_replace(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue a campaign for a background run
    pub fn submit(&self, campaign_id: &str) -> SubmitOutcome {
        if !self.is_running() {
            warn!(campaign_id = %campaign_id, "Campaign driver is not running, submission rejected");
            return SubmitOutcome::Rejected;
        }

        match self.records.entry(campaign_id.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().state.is_active() {
                    debug!(campaign_id = %campaign_id, "Campaign already queued or running");
                    return SubmitOutcome::AlreadyActive;
                }
                let record = existing.get_mut();
                record.state = DriveState::Queued;
                record.updated_at = Utc::now();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DriveRecord::queued(campaign_id));
            }
        }

        match self.tx.try_send(campaign_id.to_string()) {
            Ok(()) => {
                metrics::counter!("outdial.driver.submitted_total").increment(1);
                SubmitOutcome::Accepted
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "Campaign driver queue rejected submission");
                if let Some(mut record) = self.records.get_mut(campaign_id) {
                    record.state = DriveState::Failed;
                    record.last_error = Some("Driver queue is full".to_string());
                    record.updated_at = Utc::now();
                }
                SubmitOutcome::Rejected
            }
        }
    }

    pub fn record(&self, campaign_id: &str) -> Option<DriveRecord> {
        self.records.get(campaign_id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<DriveRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.campaign_id.cmp(&b.campaign_id));
        records
    }

    /// Re-submit campaigns with a pending queue entry. Returns how many were accepted.
    pub async fn tick(&self) -> usize {
        let live = match self.processor.queue().live().await {
            Ok(live) => live,
            Err(e) => {
                error!(error = %e, "Failed to list live campaign queues");
                return 0;
            }
        };

        let accepted = live
            .iter()
            .filter(|entry| entry.status == QueueStatus::Pending)
            .filter(|entry| self.submit(&entry.campaign_id) == SubmitOutcome::Accepted)
            .count();
        if accepted > 0 {
            debug!(accepted, "Scheduler tick re-submitted campaigns");
        }
        accepted
    }

    /// Run the scheduler tick until the driver is stopped.
    pub async fn run_scheduler(&self) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_running() {
                        self.tick().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Campaign scheduler stopped");
    }

    async fn worker_loop(
        worker_id: usize,
        processor: Arc<ChunkProcessor>,
        rx: Arc<Mutex<mpsc::Receiver<String>>>,
        records: Arc<DashMap<String, DriveRecord>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(worker_id, "Campaign driver worker started");
        loop {
            let next = tokio::select! {
                next = async { rx.lock().await.recv().await } => next,
                _ = shutdown.changed() => None,
            };
            let Some(campaign_id) = next else {
                break;
            };

            if let Some(mut record) = records.get_mut(&campaign_id) {
                record.state = DriveState::Running;
                record.updated_at = Utc::now();
            }

            let result = processor.drive_campaign(&campaign_id).await;
            if let Some(mut record) = records.get_mut(&campaign_id) {
                match &result {
                    Ok(summary) => record.finish(summary),
                    Err(e) => {
                        record.state = DriveState::Failed;
                        record.last_error = Some(e.to_string());
                        record.updated_at = Utc::now();
                    }
                }
                debug!(worker_id, campaign_id = %campaign_id, state = ?record.state, "Campaign run ended");
            }
            if let Err(e) = result {
                error!(worker_id, campaign_id = %campaign_id, error = %e, "Campaign run failed");
                metrics::counter!("outdial.driver.failed_total").increment(1);
            }
        }
        debug!(worker_id, "Campaign driver worker stopped");
    }
}
