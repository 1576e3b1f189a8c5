//! Shared fixtures for the engine integration suites: mock providers that
//! record every call, and a harness wiring them to an in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use od_common::{
    BusinessHoursConfig, CallStatus, Campaign, CampaignQueueEntry, CampaignStatus, OptimizedBatchConfig,
    ProviderBinding, QueueStatus, Recipient, VoiceAgent,
};
use od_engine::{
    CampaignStore, ChunkProcessor, ChunkProcessorConfig, CounterDelta, MemoryCampaignStore, RecipientTransition,
    StaleQuery, StoreError,
};
use od_gateway::{
    BatchPayload, BatchSubmission, CallCreated, CallRequest, CircuitBreakerConfig, CircuitBreakerRegistry,
    PrimaryCredentials, PrimaryProvider, ProviderError, ProviderGateway, SecondaryCredentials, SecondaryProvider,
};
use parking_lot::Mutex;

pub struct MockPrimary {
    pub fail: AtomicBool,
    pub calls: AtomicU32,
    pub payloads: Mutex<Vec<BatchPayload>>,
}

impl MockPrimary {
    pub fn new(fail: bool) -> Self {
        Self {
            fail: AtomicBool::new(fail),
            calls: AtomicU32::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrimaryProvider for MockPrimary {
    async fn submit_batch(
        &self,
        _credentials: &PrimaryCredentials,
        payload: &BatchPayload,
    ) -> Result<BatchSubmission, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().push(payload.clone());
        if self.fail.load(Ordering::SeqCst) {
            Err(ProviderError::Status { status: 503, body: "primary unavailable".to_string() })
        } else {
            Ok(BatchSubmission { batch_id: Some(format!("batch-{}", payload.batch_ref)) })
        }
    }
}

/// Secondary provider counting dials per phone number
pub struct MockSecondary {
    pub delay: Duration,
    pub dials: Mutex<HashMap<String, u32>>,
}

impl MockSecondary {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            dials: Mutex::new(HashMap::new()),
        }
    }

    pub fn total_dials(&self) -> u32 {
        self.dials.lock().values().sum()
    }

    pub fn max_dials_per_number(&self) -> u32 {
        self.dials.lock().values().copied().max().unwrap_or(0)
    }
}

#[async_trait]
impl SecondaryProvider for MockSecondary {
    async fn create_call(
        &self,
        _credentials: &SecondaryCredentials,
        request: &CallRequest,
    ) -> Result<CallCreated, ProviderError> {
        *self.dials.lock().entry(request.to_number.clone()).or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(CallCreated { call_id: format!("call-{}", request.metadata.recipient_id) })
    }
}

/// Memory store whose recipient counts fail once `fail_counts` is set
pub struct FlakyStore {
    pub inner: Arc<MemoryCampaignStore>,
    pub fail_counts: AtomicBool,
}

impl FlakyStore {
    fn count_guard(&self) -> Result<(), StoreError> {
        if self.fail_counts.load(Ordering::SeqCst) {
            Err(StoreError::Corrupt("recipient count unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CampaignStore for FlakyStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.inner.insert_campaign(campaign).await
    }

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>, StoreError> {
        self.inner.get_campaign(campaign_id).await
    }

    async fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<(), StoreError> {
        self.inner.set_campaign_status(campaign_id, status).await
    }

    async fn apply_campaign_counters(&self, campaign_id: &str, delta: CounterDelta) -> Result<(), StoreError> {
        self.inner.apply_campaign_counters(campaign_id, delta).await
    }

    async fn insert_agent(&self, agent: &VoiceAgent) -> Result<(), StoreError> {
        self.inner.insert_agent(agent).await
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<VoiceAgent>, StoreError> {
        self.inner.get_agent(agent_id).await
    }

    async fn insert_recipients(&self, recipients: &[Recipient]) -> Result<(), StoreError> {
        self.inner.insert_recipients(recipients).await
    }

    async fn get_recipient(&self, recipient_id: &str) -> Result<Option<Recipient>, StoreError> {
        self.inner.get_recipient(recipient_id).await
    }

    async fn count_recipients(&self, campaign_id: &str, status: CallStatus) -> Result<u64, StoreError> {
        self.count_guard()?;
        self.inner.count_recipients(campaign_id, status).await
    }

    async fn count_retryable_failures(&self, campaign_id: &str, max_attempts: u32) -> Result<u64, StoreError> {
        self.count_guard()?;
        self.inner.count_retryable_failures(campaign_id, max_attempts).await
    }

    async fn claim_pending_recipients(&self, campaign_id: &str, limit: u32) -> Result<Vec<Recipient>, StoreError> {
        self.inner.claim_pending_recipients(campaign_id, limit).await
    }

    async fn transition_recipient(
        &self,
        recipient_id: &str,
        expected: CallStatus,
        transition: &RecipientTransition,
    ) -> Result<bool, StoreError> {
        self.inner.transition_recipient(recipient_id, expected, transition).await
    }

    async fn find_stale_recipients(&self, query: &StaleQuery) -> Result<Vec<Recipient>, StoreError> {
        self.inner.find_stale_recipients(query).await
    }

    async fn insert_queue_entry(&self, entry: &CampaignQueueEntry) -> Result<(), StoreError> {
        self.inner.insert_queue_entry(entry).await
    }

    async fn get_queue_entry(&self, campaign_id: &str) -> Result<Option<CampaignQueueEntry>, StoreError> {
        self.inner.get_queue_entry(campaign_id).await
    }

    async fn try_begin_processing(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.try_begin_processing(campaign_id, now, lease_expired_before).await
    }

    async fn record_chunk_progress(&self, campaign_id: &str, processed: u64) -> Result<(), StoreError> {
        self.inner.record_chunk_progress(campaign_id, processed).await
    }

    async fn set_queue_status(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        self.inner.set_queue_status(campaign_id, status, last_error).await
    }

    async fn finish_processing(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> Result<bool, StoreError> {
        self.inner.finish_processing(campaign_id, status, last_error).await
    }

    async fn delete_queue_entry(&self, campaign_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_queue_entry(campaign_id).await
    }

    async fn list_live_queues(&self) -> Result<Vec<CampaignQueueEntry>, StoreError> {
        self.inner.list_live_queues().await
    }
}

pub struct Harness {
    pub store: Arc<MemoryCampaignStore>,
    pub primary: Arc<MockPrimary>,
    pub secondary: Arc<MockSecondary>,
    pub registry: Arc<CircuitBreakerRegistry>,
    pub processor: Arc<ChunkProcessor>,
}

/// No spacing or pauses so suites run fast
pub fn fast_batch_config() -> OptimizedBatchConfig {
    OptimizedBatchConfig {
        delay_between_calls_ms: 0,
        delay_between_chunks_ms: 0,
        ..Default::default()
    }
}

impl Harness {
    pub fn new(primary_fails: bool) -> Self {
        Self::with(primary_fails, Duration::ZERO, CircuitBreakerConfig::default(), fast_batch_config())
    }

    pub fn with(
        primary_fails: bool,
        secondary_delay: Duration,
        breaker: CircuitBreakerConfig,
        batch_config: OptimizedBatchConfig,
    ) -> Self {
        let store = Arc::new(MemoryCampaignStore::new());
        let primary = Arc::new(MockPrimary::new(primary_fails));
        let secondary = Arc::new(MockSecondary::new(secondary_delay));
        let registry = Arc::new(CircuitBreakerRegistry::new(breaker));
        let gateway = Arc::new(ProviderGateway::new(registry.clone(), primary.clone(), secondary.clone()));
        let config = ChunkProcessorConfig {
            default_chunk_size: 50,
            batch_config,
        };
        let processor = Arc::new(ChunkProcessor::new(store.clone(), gateway, config));
        Self {
            store,
            primary,
            secondary,
            registry,
            processor,
        }
    }

    /// Like [`Harness::with`], with the processor reading through a
    /// [`FlakyStore`] over the same memory store
    pub fn flaky(primary_fails: bool) -> (Self, Arc<FlakyStore>) {
        let mut harness = Self::new(primary_fails);
        let flaky = Arc::new(FlakyStore {
            inner: harness.store.clone(),
            fail_counts: AtomicBool::new(false),
        });
        let gateway = harness.processor.gateway().clone();
        let config = ChunkProcessorConfig {
            default_chunk_size: 50,
            batch_config: fast_batch_config(),
        };
        harness.processor = Arc::new(ChunkProcessor::new(flaky.clone(), gateway, config));
        (harness, flaky)
    }

    /// Insert an agent, a ready campaign and `n` pending recipients with
    /// strictly increasing creation times
    pub async fn seed(&self, n: usize, with_secondary: bool, hours: BusinessHoursConfig) -> (Campaign, Vec<Recipient>) {
        let mut bindings = vec![ProviderBinding::Primary {
            external_agent_id: "pri-agent".to_string(),
            api_key: "pri-key".to_string(),
        }];
        if with_secondary {
            bindings.push(ProviderBinding::Secondary {
                external_agent_id: "sec-agent".to_string(),
                api_key: "sec-key".to_string(),
                phone_number_id: "pn-1".to_string(),
            });
        }
        let agent = VoiceAgent {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: "ws-1".to_string(),
            name: "Agent".to_string(),
            caller_id: Some("+15550001111".to_string()),
            bindings,
        };
        self.store.insert_agent(&agent).await.unwrap();

        let mut campaign = Campaign::new("ws-1", agent.id.clone(), "Renewals");
        campaign.status = CampaignStatus::Ready;
        campaign.business_hours = hours;
        campaign.total_recipients = n as u64;
        campaign.pending_recipients = n as u64;
        self.store.insert_campaign(&campaign).await.unwrap();

        let base = chrono::Utc::now() - chrono::Duration::hours(1);
        let recipients: Vec<_> = (0..n)
            .map(|i| {
                let mut r = Recipient::new(campaign.id.clone(), format!("+1555{i:07}"));
                r.created_at = base + chrono::Duration::milliseconds(i as i64);
                r
            })
            .collect();
        self.store.insert_recipients(&recipients).await.unwrap();

        (campaign, recipients)
    }

    pub async fn campaign(&self, campaign_id: &str) -> Campaign {
        self.store.get_campaign(campaign_id).await.unwrap().unwrap()
    }
}
