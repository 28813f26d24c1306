//! REST API implementation for the analysis orchestration server
//!
//! This module provides the HTTP endpoints clients use to submit analysis
//! jobs, read task and batch state, cancel tasks, and stream live progress.
// Each public handler corresponds to one endpoint. Handlers stay thin: they
// validate transport-level input, delegate to the submission service, store
// or streaming adapter, and translate errors into consistent JSON bodies.

use crate::cache::LiveCache;
use crate::database::{AnalysisDatabase, TaskFilter};
use crate::queue::TaskQueue;
use crate::stream;
use crate::submission::{SubmissionError, SubmissionService};
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::sse::{KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::api::{
    endpoints, BatchAnalysisRequest, CancelResponse, SingleAnalysisRequest, SystemStatusResponse,
    TaskListQuery, TaskListResponse, TaskSnapshot,
};
use shared::config::ServiceConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Maximum request body size: 1MB. Submissions are small; anything larger
/// is a client bug.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub database: Arc<Mutex<AnalysisDatabase>>,
    pub cache: LiveCache,
    pub queue: TaskQueue,
    pub submission: SubmissionService,
    /// Mirrors the scheduler's run state for the status endpoint
    pub scheduler_running: Arc<AtomicBool>,
}

/// Creates the main API router and defines all the application's routes.
/// Called once at server startup to build the routing tree.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Unauthenticated liveness probe for load balancers and orchestrators.
        .route("/health", get(health_check))
        .route(endpoints::SUBMIT_SINGLE, post(handle_submit_single))
        .route(endpoints::SUBMIT_BATCH, post(handle_submit_batch))
        .route(endpoints::TASK_LIST, get(handle_list_tasks))
        .route(endpoints::TASK, get(handle_get_task))
        .route(endpoints::TASK_CANCEL, post(handle_cancel_task))
        .route(endpoints::TASK_STREAM, get(handle_stream_task))
        .route(endpoints::BATCH_STATUS, get(handle_get_batch))
        .route(endpoints::SYSTEM_STATUS, get(handle_system_status))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// The handler for the `/health` endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "stock-analysis-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Submit one stock for analysis.
async fn handle_submit_single(
    State(state): State<AppState>,
    Json(request): Json<SingleAnalysisRequest>,
) -> Result<Response, ApiError> {
    info!(
        user_id = %request.user_id,
        stock_code = %request.stock_code,
        "Received single analysis submission"
    );

    let response = state.submission.submit_single(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

/// Submit a batch of stocks for analysis.
async fn handle_submit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchAnalysisRequest>,
) -> Result<Response, ApiError> {
    info!(
        user_id = %request.user_id,
        stock_count = request.stock_codes.len(),
        "Received batch analysis submission"
    );

    let response = state.submission.submit_batch(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

/// Current snapshot of one task: live progress merged over the stored row.
async fn handle_get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let snapshot = stream::current_snapshot(&state.database, &state.cache, &task_id)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?;

    snapshot
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {}", task_id)))
}

/// Page through one user's tasks, newest first.
async fn handle_list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    shared::utils::validate_user_id(&query.user_id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let filter = TaskFilter {
        user_id: query.user_id.clone(),
        status: query.status,
        limit: query.limit.unwrap_or(50).min(200),
        offset: query.offset.unwrap_or(0),
    };

    let tasks = state
        .database
        .lock()
        .await
        .list_tasks(&filter)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?;

    // Overlay live progress where a fresh record exists; the same staleness
    // rule as the single-task endpoint applies.
    let snapshots = tasks
        .iter()
        .map(|task| {
            let snapshot = TaskSnapshot::from_task(task);
            match state.cache.get_progress(&task.task_id) {
                Some(live) if !(task.status.is_terminal() && !live.status.is_terminal()) => {
                    snapshot.with_progress(&live)
                }
                _ => snapshot,
            }
        })
        .collect();

    Ok(Json(TaskListResponse {
        tasks: snapshots,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

/// Batch status with aggregated counters.
async fn handle_get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<shared::task::AnalysisBatch>, ApiError> {
    let batch = state
        .database
        .lock()
        .await
        .get_batch(&batch_id)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?;

    batch
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Batch not found: {}", batch_id)))
}

/// Cancel a task on behalf of its owner.
///
/// Raises the cancel flag first so a running executor observes it at its
/// next checkpoint, then records the cancellation in the store, and drops
/// the queue entry when the task was still waiting.
async fn handle_cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let exists = state
        .database
        .lock()
        .await
        .get_task(&task_id)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?
        .is_some();
    if !exists {
        return Err(ApiError::NotFound(format!("Task not found: {}", task_id)));
    }

    state.cache.set_cancelled(&task_id);

    let cancelled = state
        .database
        .lock()
        .await
        .cancel_task(&task_id)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?;

    // A waiting task leaves the queue right away. A reserved one keeps its
    // entry: the owning worker finishes it on the cancellation path, or the
    // reclaim short-circuit does.
    let entry = state
        .queue
        .entry(&task_id)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?;
    if entry.map(|e| e.state == "ready").unwrap_or(false) {
        if let Err(e) = state.queue.remove(&task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to drop cancelled task from queue");
        }
    }

    info!(task_id = %task_id, cancelled = cancelled, "Cancellation requested");
    Ok(Json(CancelResponse { cancelled }))
}

/// Live progress stream; see the streaming adapter for event semantics.
async fn handle_stream_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let exists = state
        .database
        .lock()
        .await
        .get_task(&task_id)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?
        .is_some();
    if !exists {
        return Err(ApiError::NotFound(format!("Task not found: {}", task_id)));
    }

    let stream = stream::progress_stream(
        state.database.clone(),
        state.cache.clone(),
        task_id,
        Duration::from_secs(state.config.stream_max_interval_seconds),
    );

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Queue depth and scheduler state, for operators.
async fn handle_system_status(
    State(state): State<AppState>,
) -> Result<Json<SystemStatusResponse>, ApiError> {
    let queue = state
        .queue
        .stats()
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?;

    Ok(Json(SystemStatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler_running: state.scheduler_running.load(Ordering::SeqCst),
        queue,
    }))
}

/// API error variants with their HTTP mappings.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl From<SubmissionError> for ApiError {
    fn from(e: SubmissionError) -> Self {
        match e {
            SubmissionError::Validation(message) => ApiError::BadRequest(message),
            SubmissionError::Internal(e) => {
                error!(error = %e, "Submission failed");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

/// Converts an `ApiError` into an HTTP response. Handlers returning
/// `Result<_, ApiError>` get this applied automatically by axum.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}
