//! ChunkProcessor Tests
//!
//! Tests for:
//! - Fallback chunking: 3 recipients, chunk size 2, primary down
//! - 120 recipients in chunks of 50 complete after 3 invocations
//! - Concurrent invocations never dial a recipient twice
//! - Business hours deferral with the next window
//! - Cancellation, pause and queue failure stop dispatch
//! - Wall-clock budget releases unplaced recipients
//! - Provider failure without fallback, then an open breaker
//! - Resume dispatches immediately despite a future start
//! - A scheduled fallback that dials nobody ends the drive loop
//! - Store failures after dispatch keep the chunk result
//! - Start validation

mod common;

use std::time::Duration;

use chrono::{Datelike, Utc};
use std::sync::atomic::Ordering;

use common::{fast_batch_config, Harness};
use od_common::{
    BusinessHoursConfig, CallStatus, CampaignStatus, DayOfWeek, ProviderBinding, QueueStatus, TimeSlot, VoiceAgent,
};
use od_engine::{CallResult, CallResultOutcome, CampaignStore, ChunkOutcome, EngineError, StartOptions};
use od_gateway::{CircuitBreakerConfig, ProviderKind};

fn start(chunk_size: u32, process_first_chunk: bool) -> StartOptions {
    StartOptions {
        chunk_size: Some(chunk_size),
        concurrency: None,
        process_first_chunk,
    }
}

#[tokio::test]
async fn test_fallback_chunks_until_completed() {
    let h = Harness::new(true);
    let (campaign, recipients) = h.seed(3, true, BusinessHoursConfig::disabled()).await;

    let started = h.processor.start_campaign(&campaign.id, start(2, true)).await.unwrap();
    let first = started.first_chunk.expect("first chunk processed");
    assert!(first.success);
    assert!(first.has_more);
    assert_eq!(first.chunk_result.successful, 2);
    assert_eq!(first.provider, Some(ProviderKind::Secondary));
    assert!(first.fallback_used);
    assert_eq!(first.pending_count, 1);
    assert!(started.continue_processing.is_some());
    assert_eq!(h.campaign(&campaign.id).await.status, CampaignStatus::Active);

    for r in &recipients[..2] {
        let stored = h.store.get_recipient(&r.id).await.unwrap().unwrap();
        assert_eq!(stored.call_status, CallStatus::Calling);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.external_call_id, Some(format!("call-{}", r.id)));
    }

    let second = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
    assert!(second.success);
    assert!(!second.has_more);
    assert_eq!(second.chunk_result.successful, 1);
    assert_eq!(second.outcome, ChunkOutcome::Completed);

    let campaign = h.campaign(&campaign.id).await;
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.pending_recipients, 0);
    assert_eq!(campaign.successful_recipients, 3);

    let queue = h.processor.queue().get(&campaign.id).await.unwrap();
    assert_eq!(queue.status, QueueStatus::Completed);
    assert_eq!(queue.chunks_processed, 2);
    assert_eq!(queue.processed_count, 3);
    assert_eq!(h.secondary.total_dials(), 3);
}

#[tokio::test]
async fn test_120_recipients_in_chunks_of_50() {
    let h = Harness::new(false);
    let (campaign, _) = h.seed(120, false, BusinessHoursConfig::disabled()).await;

    let started = h.processor.start_campaign(&campaign.id, start(50, false)).await.unwrap();
    assert_eq!(started.queue.total_chunks, 3);
    assert!(started.first_chunk.is_none());

    let mut has_more = true;
    let mut invocations = 0;
    while has_more {
        let chunk = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
        assert!(chunk.success);
        assert_eq!(chunk.provider, Some(ProviderKind::Primary));
        has_more = chunk.has_more;
        invocations += 1;
        assert!(invocations <= 3, "more than 3 invocations needed");
    }
    assert_eq!(invocations, 3);

    let sizes: Vec<usize> = h.primary.payloads.lock().iter().map(|p| p.call_list.len()).collect();
    assert_eq!(sizes, vec![50, 50, 20]);

    let queue = h.processor.queue().get(&campaign.id).await.unwrap();
    assert_eq!(queue.status, QueueStatus::Completed);
    assert_eq!(queue.chunks_processed, 3);
    assert_eq!(h.campaign(&campaign.id).await.status, CampaignStatus::Completed);
    assert_eq!(h.store.count_recipients(&campaign.id, CallStatus::Calling).await.unwrap(), 120);
}

#[tokio::test]
async fn test_concurrent_invocations_never_double_dial() {
    let h = Harness::with(
        true,
        Duration::from_millis(20),
        CircuitBreakerConfig::default(),
        fast_batch_config(),
    );
    let (campaign, _) = h.seed(10, true, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(5, false)).await.unwrap();

    let (a, b) = tokio::join!(
        h.processor.process_queue_chunk(&campaign.id),
        h.processor.process_queue_chunk(&campaign.id)
    );
    let outcomes = [a.unwrap().outcome, b.unwrap().outcome];
    assert!(outcomes.contains(&ChunkOutcome::Busy), "one invocation must back off: {outcomes:?}");

    while h.processor.process_queue_chunk(&campaign.id).await.unwrap().has_more {}

    assert_eq!(h.secondary.total_dials(), 10);
    assert_eq!(h.secondary.max_dials_per_number(), 1);
    assert_eq!(h.campaign(&campaign.id).await.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn test_outside_business_hours_defers_with_next_window() {
    let h = Harness::new(false);
    // Open all of tomorrow (UTC) only, so today is closed
    let tomorrow = (Utc::now() + chrono::Duration::days(1)).date_naive();
    let hours = BusinessHoursConfig {
        enabled: true,
        timezone: Some("UTC".to_string()),
        ..Default::default()
    }
    .with_day(DayOfWeek::from(tomorrow.weekday()), vec![TimeSlot::new("00:00", "24:00")]);
    let (campaign, _) = h.seed(3, false, hours).await;

    let started = h.processor.start_campaign(&campaign.id, start(2, true)).await.unwrap();
    let chunk = started.first_chunk.unwrap();
    assert!(!chunk.success);
    assert!(chunk.has_more);
    assert_eq!(chunk.outcome, ChunkOutcome::OutsideBusinessHours);
    assert_eq!(chunk.error.as_deref(), Some("Outside business hours"));
    assert_eq!(chunk.pending_count, 3);

    let next = chunk.next_window.expect("next window");
    assert_eq!(next.at, tomorrow.and_hms_opt(0, 0, 0).unwrap().and_utc());

    // Entry untouched, nothing dispatched
    assert_eq!(h.primary.calls(), 0);
    let queue = h.processor.queue().get(&campaign.id).await.unwrap();
    assert_eq!(queue.status, QueueStatus::Pending);
    assert_eq!(queue.chunks_processed, 0);
}

#[tokio::test]
async fn test_cancelled_campaign_aborts_without_dispatch() {
    let h = Harness::new(false);
    let (campaign, _) = h.seed(3, false, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap();

    assert!(h.processor.cancel_campaign(&campaign.id).await.unwrap());
    let chunk = h.processor.process_queue_chunk(&campaign.id).await.unwrap();

    assert_eq!(chunk.outcome, ChunkOutcome::Cancelled);
    assert!(!chunk.has_more);
    assert_eq!(h.primary.calls(), 0);
    assert!(h.processor.queue().find(&campaign.id).await.unwrap().is_none());
    assert_eq!(h.campaign(&campaign.id).await.status, CampaignStatus::Cancelled);
}

#[tokio::test]
async fn test_paused_campaign_stops_until_resumed() {
    let h = Harness::new(false);
    let (campaign, _) = h.seed(4, false, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(2, true)).await.unwrap();

    h.processor.pause_campaign(&campaign.id).await.unwrap();
    let paused = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
    assert_eq!(paused.outcome, ChunkOutcome::Paused);
    assert_eq!(h.primary.calls(), 1);

    let resumed = h.processor.resume_campaign(&campaign.id).await.unwrap();
    assert!(resumed.success);
    assert!(!resumed.has_more);
    assert_eq!(h.primary.calls(), 2);
    assert_eq!(h.campaign(&campaign.id).await.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn test_budget_exhaustion_releases_unplaced_recipients() {
    let batch = od_common::OptimizedBatchConfig {
        concurrency_limit: 1,
        max_processing_time_ms: 100,
        ..fast_batch_config()
    };
    let h = Harness::with(true, Duration::from_millis(60), CircuitBreakerConfig::default(), batch);
    let (campaign, _) = h.seed(5, true, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(5, false)).await.unwrap();

    let chunk = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
    let counts = chunk.chunk_result;
    assert!(counts.successful >= 1);
    assert!(counts.skipped >= 1);
    assert_eq!(counts.successful + counts.skipped, 5);
    assert!(chunk.has_more);
    assert_eq!(chunk.pending_count, counts.skipped as u64);

    let queue = h.processor.queue().get(&campaign.id).await.unwrap();
    assert_eq!(queue.status, QueueStatus::Pending);
    assert_eq!(queue.processed_count, counts.successful as u64);

    // Skipped recipients were never dialled and carry no attempt
    for r in h.store.recipients_of(&campaign.id) {
        if r.call_status == CallStatus::Pending {
            assert_eq!(r.attempts, 0);
        }
    }
}

#[tokio::test]
async fn test_provider_failure_then_open_breaker() {
    let breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        ..Default::default()
    };
    let h = Harness::with(true, Duration::ZERO, breaker, fast_batch_config());
    let (campaign, recipients) = h.seed(4, false, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap();

    let failed = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
    assert_eq!(failed.outcome, ChunkOutcome::ProviderFailed);
    assert!(!failed.success);
    assert!(failed.has_more);
    assert_eq!(failed.chunk_result.failed, 2);

    let first = h.store.get_recipient(&recipients[0].id).await.unwrap().unwrap();
    assert_eq!(first.call_status, CallStatus::Failed);
    assert_eq!(first.attempts, 1);
    assert!(first.last_error.unwrap().contains("503"));

    let deferred = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
    assert_eq!(deferred.outcome, ChunkOutcome::CircuitOpen);
    assert!(deferred.retry_at.is_some());
    assert!(deferred.has_more);
    assert_eq!(h.primary.calls(), 1, "open breaker must not invoke the provider");

    // Claimed recipients went back to pending untouched
    let third = h.store.get_recipient(&recipients[2].id).await.unwrap().unwrap();
    assert_eq!(third.call_status, CallStatus::Pending);
    assert_eq!(third.attempts, 0);

    let campaign = h.campaign(&campaign.id).await;
    assert_eq!(campaign.failed_recipients, 2);
    assert_eq!(campaign.pending_recipients, 2);
}

#[tokio::test]
async fn test_resume_ignores_future_start() {
    let h = Harness::new(false);
    let (mut campaign, _) = h.seed(2, false, BusinessHoursConfig::disabled()).await;
    let start_at = Utc::now() + chrono::Duration::days(2);
    campaign.start_at = Some(start_at);
    h.store.insert_campaign(&campaign).await.unwrap();

    h.processor.start_campaign(&campaign.id, start(1, true)).await.unwrap();
    h.processor.pause_campaign(&campaign.id).await.unwrap();
    h.processor.resume_campaign(&campaign.id).await.unwrap();

    let payloads = h.primary.payloads.lock().clone();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].nbf, start_at);
    assert!(payloads[1].nbf < start_at);
    assert!(payloads[1].nbf <= Utc::now());
    assert_eq!(payloads[1].exp, payloads[1].nbf + chrono::Duration::days(30));
}

#[tokio::test]
async fn test_start_validation() {
    let h = Harness::new(false);
    let (campaign, _) = h.seed(0, false, BusinessHoursConfig::disabled()).await;
    let err = h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap_err();
    assert!(err.is_validation(), "{err}");

    let (campaign, _) = h.seed(2, false, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap();
    let err = h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap_err();
    assert!(matches!(err, EngineError::QueueExists(_)));

    let err = h.processor.start_campaign("missing", start(2, false)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_unsynced_agent_is_rejected() {
    let h = Harness::new(false);
    let (campaign, _) = h.seed(2, false, BusinessHoursConfig::disabled()).await;
    let agent = VoiceAgent {
        id: campaign.agent_id.clone(),
        workspace_id: "ws-1".to_string(),
        name: "Agent".to_string(),
        caller_id: Some("+15550001111".to_string()),
        bindings: vec![ProviderBinding::Primary {
            external_agent_id: String::new(),
            api_key: "key".to_string(),
        }],
    };
    h.store.insert_agent(&agent).await.unwrap();

    let err = h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("not synced"));
}

#[tokio::test]
async fn test_call_result_after_dispatch_is_idempotent() {
    let h = Harness::new(true);
    let (campaign, recipients) = h.seed(1, true, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(1, true)).await.unwrap();

    let id = &recipients[0].id;
    let states = h.processor.states();
    let applied = states.apply_call_result(id, &CallResult::completed()).await.unwrap();
    assert_eq!(applied, CallResultOutcome::Applied { from: CallStatus::Calling });

    let replay = states.apply_call_result(id, &CallResult::failed("no answer")).await.unwrap();
    assert_eq!(replay, CallResultOutcome::AlreadyTerminal { status: CallStatus::Completed });
    assert_eq!(
        h.store.get_recipient(id).await.unwrap().unwrap().call_status,
        CallStatus::Completed
    );
}

#[tokio::test]
async fn test_drive_campaign_runs_to_completion() {
    let h = Harness::new(true);
    let (campaign, _) = h.seed(7, true, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(3, false)).await.unwrap();

    let summary = h.processor.drive_campaign(&campaign.id).await.unwrap();
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.successful, 7);
    assert_eq!(summary.last.unwrap().outcome, ChunkOutcome::Completed);
    assert_eq!(h.campaign(&campaign.id).await.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn test_scheduled_fallback_defers_and_ends_drive() {
    // 503s that never trip the breaker
    let breaker = CircuitBreakerConfig {
        failure_threshold: 1_000_000,
        ..Default::default()
    };
    let h = Harness::with(true, Duration::ZERO, breaker, fast_batch_config());
    let (mut campaign, recipients) = h.seed(3, true, BusinessHoursConfig::disabled()).await;
    let start_at = Utc::now() + chrono::Duration::hours(3);
    campaign.start_at = Some(start_at);
    h.store.insert_campaign(&campaign).await.unwrap();
    h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(2), h.processor.drive_campaign(&campaign.id))
        .await
        .expect("drive must stop when nothing is dialled")
        .unwrap();
    assert_eq!(summary.chunks, 0);
    assert_eq!(summary.skipped, 2);

    let last = summary.last.unwrap();
    assert_eq!(last.outcome, ChunkOutcome::Deferred);
    assert!(!last.success);
    assert!(last.has_more);
    assert_eq!(last.retry_at, Some(start_at));
    assert_eq!(last.pending_count, 3);
    assert!(last.error.unwrap().contains("fallback deferred"));

    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.secondary.total_dials(), 0);

    let queue = h.processor.queue().get(&campaign.id).await.unwrap();
    assert_eq!(queue.status, QueueStatus::Pending);
    assert_eq!(queue.chunks_processed, 0);
    assert_eq!(queue.processed_count, 0);

    for r in &recipients {
        let stored = h.store.get_recipient(&r.id).await.unwrap().unwrap();
        assert_eq!(stored.call_status, CallStatus::Pending);
        assert_eq!(stored.attempts, 0);
    }
}

#[tokio::test]
async fn test_store_failure_after_dispatch_keeps_result() {
    let (h, flaky) = Harness::flaky(true);
    let (campaign, recipients) = h.seed(3, true, BusinessHoursConfig::disabled()).await;
    h.processor.start_campaign(&campaign.id, start(2, false)).await.unwrap();

    flaky.fail_counts.store(true, Ordering::SeqCst);
    let chunk = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
    assert_eq!(chunk.outcome, ChunkOutcome::Dispatched);
    assert!(chunk.success);
    assert_eq!(chunk.chunk_result.successful, 2);
    assert_eq!(chunk.provider, Some(ProviderKind::Secondary));
    assert!(chunk.fallback_used);
    // Pending count unknown, so the caller is told to come back
    assert!(chunk.has_more);

    for r in &recipients[..2] {
        let stored = h.store.get_recipient(&r.id).await.unwrap().unwrap();
        assert_eq!(stored.call_status, CallStatus::Calling);
    }
    assert_eq!(
        h.processor.queue().get(&campaign.id).await.unwrap().status,
        QueueStatus::Pending
    );

    flaky.fail_counts.store(false, Ordering::SeqCst);
    let last = h.processor.process_queue_chunk(&campaign.id).await.unwrap();
    assert_eq!(last.outcome, ChunkOutcome::Completed);
    assert_eq!(h.secondary.total_dials(), 3);
}
