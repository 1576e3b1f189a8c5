//! Outdial HTTP API
//!
//! - Campaign lifecycle: start, process-chunk, resume, pause, cancel, drive
//! - Queue and campaign snapshots
//! - Call-result hook for the webhook collaborator
//! - Circuit breaker inspection and reset
//! - Health probes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use od_common::{Campaign, CampaignQueueEntry};
use od_engine::{
    CallResult, CallResultOutcome, CampaignDriver, ChunkProcessor, ChunkResult, DriveRecord, EngineError,
    StaleRecipientSweeper, StartCampaignResponse, StartOptions, SubmitOutcome, SweepReport,
};
use od_gateway::{CircuitBreakerRegistry, CircuitBreakerStats, GatewayError};
use serde::Serialize;
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<ChunkProcessor>,
    /// `None` when the driver is disabled in configuration
    pub driver: Option<Arc<CampaignDriver>>,
    pub sweeper: Arc<StaleRecipientSweeper>,
    pub registry: Arc<CircuitBreakerRegistry>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/q/health", get(health_handler))
        .route("/q/health/live", get(liveness_probe))
        .route("/q/health/ready", get(readiness_probe))
        // Campaigns
        .route("/api/campaigns/{id}", get(get_campaign))
        .route("/api/campaigns/{id}/start", post(start_campaign))
        .route("/api/campaigns/{id}/process-chunk", post(process_chunk))
        .route("/api/campaigns/{id}/resume", post(resume_campaign))
        .route("/api/campaigns/{id}/pause", post(pause_campaign))
        .route("/api/campaigns/{id}/cancel", post(cancel_campaign))
        .route("/api/campaigns/{id}/drive", post(drive_campaign))
        .route("/api/campaigns/{id}/queue", get(get_queue))
        // Webhook collaborator
        .route("/api/recipients/{id}/call-result", post(call_result))
        // Background work
        .route("/api/driver/runs", get(list_runs))
        .route("/api/sweeper/run", post(run_sweep))
        // Circuit breakers
        .route("/api/circuit-breakers", get(list_circuit_breakers))
        .route("/api/circuit-breakers/{name}/reset", post(reset_circuit_breaker))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl From<od_engine::StoreError> for ApiError {
    fn from(e: od_engine::StoreError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            e if e.is_not_found() => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            EngineError::QueueExists(_) => (StatusCode::CONFLICT, "QUEUE_EXISTS"),
            e if e.is_validation() => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            EngineError::Gateway(GatewayError::CircuitOpen { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN")
            }
            EngineError::Gateway(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    driver_running: bool,
    open_circuit_breakers: usize,
}

#[derive(Debug, Serialize)]
struct ProbeResponse {
    status: String,
}

/// Driver stopped while enabled means background runs are not progressing
fn driver_healthy(state: &AppState) -> bool {
    state.driver.as_ref().map_or(true, |d| d.is_running())
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if driver_healthy(&state) { "UP" } else { "DEGRADED" };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        driver_running: state.driver.as_ref().is_some_and(|d| d.is_running()),
        open_circuit_breakers: state.registry.open_count(),
    })
}

async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

async fn readiness_probe(State(state): State<AppState>) -> Response {
    if driver_healthy(&state) {
        (StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY".to_string() })).into_response()
    }
}

// ============================================================================
// Campaign Endpoints
// ============================================================================

async fn get_campaign(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Campaign> {
    state
        .processor
        .store()
        .get_campaign(&id)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::CampaignNotFound(id).into())
}

/// Chunked start. The body is optional; omitted fields take their defaults.
async fn start_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    options: Option<Json<StartOptions>>,
) -> ApiResult<StartCampaignResponse> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let response = state.processor.start_campaign(&id, options).await?;
    Ok(Json(response))
}

async fn process_chunk(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ChunkResult> {
    Ok(Json(state.processor.process_queue_chunk(&id).await?))
}

async fn resume_campaign(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ChunkResult> {
    Ok(Json(state.processor.resume_campaign(&id).await?))
}

async fn pause_campaign(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    state.processor.pause_campaign(&id).await?;
    Ok(Json(serde_json::json!({ "campaignId": id, "status": "paused" })))
}

async fn cancel_campaign(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    let queue_removed = state.processor.cancel_campaign(&id).await?;
    Ok(Json(serde_json::json!({
        "campaignId": id,
        "status": "cancelled",
        "queueRemoved": queue_removed,
    })))
}

/// Hand the campaign to the background driver
async fn drive_campaign(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    // Unknown campaigns and missing queues are reported before submission
    state.processor.queue().get(&id).await?;

    let Some(driver) = &state.driver else {
        let body = ErrorResponse {
            error: "DRIVER_DISABLED".to_string(),
            message: "Campaign driver is disabled".to_string(),
        };
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response());
    };

    let outcome = driver.submit(&id);
    let status = match outcome {
        SubmitOutcome::Accepted => {
            info!(campaign_id = %id, "Campaign submitted to driver");
            StatusCode::ACCEPTED
        }
        SubmitOutcome::AlreadyActive => StatusCode::OK,
        SubmitOutcome::Rejected => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = serde_json::json!({
        "campaignId": id,
        "outcome": outcome,
        "run": driver.record(&id),
    });
    Ok((status, Json(body)).into_response())
}

/// Queue entry with its progress
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    #[serde(flatten)]
    queue: CampaignQueueEntry,
    progress_percent: f64,
}

async fn get_queue(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<QueueSnapshot> {
    let queue = state.processor.queue().get(&id).await?;
    Ok(Json(QueueSnapshot {
        progress_percent: queue.progress_percent(),
        queue,
    }))
}

// ============================================================================
// Call results
// ============================================================================

/// Idempotent: replays of a final result are acknowledged without change
async fn call_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(result): Json<CallResult>,
) -> ApiResult<CallResultOutcome> {
    Ok(Json(state.processor.states().apply_call_result(&id, &result).await?))
}

// ============================================================================
// Background work
// ============================================================================

async fn list_runs(State(state): State<AppState>) -> Json<Vec<DriveRecord>> {
    Json(state.driver.as_ref().map(|d| d.records()).unwrap_or_default())
}

async fn run_sweep(State(state): State<AppState>) -> ApiResult<SweepReport> {
    Ok(Json(state.sweeper.try_sweep().await?))
}

// ============================================================================
// Circuit Breakers
// ============================================================================

async fn list_circuit_breakers(State(state): State<AppState>) -> Json<Vec<CircuitBreakerStats>> {
    Json(state.registry.stats())
}

async fn reset_circuit_breaker(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if state.registry.reset(&name) {
        info!(name = %name, "Circuit breaker reset");
        (StatusCode::OK, Json(serde_json::json!({ "status": "success" }))).into_response()
    } else {
        let body = ErrorResponse {
            error: "NOT_FOUND".to_string(),
            message: format!("Circuit breaker not found: {name}"),
        };
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    }
}
