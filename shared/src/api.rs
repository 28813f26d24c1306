//! API types and structures for the analysis service
//!
//! This module defines the request and response types used by the REST API
//! endpoints of the orchestration server, plus the task snapshot schema
//! shared between the status endpoint and the progress stream.

use crate::progress::ProgressSnapshot;
use crate::task::{AnalysisParameters, AnalysisReport, AnalysisTask, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request body for POST /api/v1/analysis/single
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleAnalysisRequest {
    /// Submitting user (authentication is handled upstream)
    pub user_id: String,
    /// Stock symbol to analyze
    pub stock_code: String,
    /// Analysis parameters; server defaults apply when omitted
    #[serde(default)]
    pub parameters: Option<AnalysisParameters>,
}

/// Response body for POST /api/v1/analysis/single
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleAnalysisResponse {
    pub task_id: String,
    pub stock_code: String,
    pub status: TaskStatus,
}

/// Request body for POST /api/v1/analysis/batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAnalysisRequest {
    pub user_id: String,
    /// Stock symbols to analyze, one task each
    pub stock_codes: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Parameters shared by every task in the batch
    #[serde(default)]
    pub parameters: Option<AnalysisParameters>,
}

/// Response body for POST /api/v1/analysis/batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAnalysisResponse {
    pub batch_id: String,
    pub total_tasks: u32,
    pub status: TaskStatus,
}

/// Response body for POST /api/v1/analysis/{task_id}/cancel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Whether the call changed anything; false when the task was already
    /// terminal
    pub cancelled: bool,
}

/// Query parameters for GET /api/v1/analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListQuery {
    pub user_id: String,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Response body for GET /api/v1/analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskSnapshot>,
    pub limit: u32,
    pub offset: u32,
}

/// Queue depth counters for the system status endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCounters {
    pub ready: u64,
    pub inflight: u64,
}

/// Response body for GET /api/v1/system/status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatusResponse {
    pub version: String,
    pub scheduler_running: bool,
    pub queue: QueueCounters,
}

/// Point-in-time view of a task, returned by the status endpoint and
/// emitted as the SSE event payload on the progress stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub user_id: String,
    pub stock_code: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub current_step: String,
    pub message: String,
    pub elapsed_time: f64,
    pub remaining_time: f64,
    pub estimated_total_time: f64,
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub parameters: AnalysisParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<AnalysisReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskSnapshot {
    /// Synthesize a snapshot from the stored task row alone, for tasks that
    /// have no live progress record (never started, restarted server, or
    /// completed while nobody was streaming).
    pub fn from_task(task: &AnalysisTask) -> Self {
        let baseline = task.parameters.research_depth.estimated_total_secs() as f64;

        let (elapsed, estimated_total, remaining) = match (task.started_at, task.completed_at) {
            (Some(start), Some(end)) => {
                let elapsed = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
                (elapsed, elapsed, 0.0)
            }
            (Some(start), None) => {
                let elapsed = (Utc::now() - start).num_milliseconds().max(0) as f64 / 1000.0;
                let mut estimated = baseline;
                // Past the baseline, extrapolate from observed pace instead
                // of reporting zero remaining forever.
                if elapsed >= estimated && task.progress > 0 {
                    estimated = elapsed / (task.progress as f64 / 100.0);
                }
                (elapsed, estimated, (estimated - elapsed).max(0.0))
            }
            _ => (0.0, baseline, baseline),
        };

        Self {
            task_id: task.task_id.clone(),
            user_id: task.user_id.clone(),
            stock_code: task.stock_code.clone(),
            status: task.status,
            progress: task.progress,
            current_step: task.current_step.clone(),
            message: task.message.clone(),
            elapsed_time: elapsed,
            remaining_time: remaining,
            estimated_total_time: estimated_total,
            steps: Vec::new(),
            start_time: task.started_at,
            end_time: task.completed_at,
            last_update: task.last_update,
            parameters: task.parameters.clone(),
            execution_time: task.result.as_ref().map(|r| r.execution_time_secs),
            result_data: task.result.clone(),
            error_message: task.error_message.clone(),
        }
    }

    /// Overlay a live progress record on top of the stored row. The live
    /// record wins for everything it tracks; identity, parameters and the
    /// result payload come from the store.
    pub fn with_progress(mut self, progress: &ProgressSnapshot) -> Self {
        self.status = progress.status;
        self.progress = progress.progress;
        self.current_step = progress.current_step.clone();
        self.message = progress.message.clone();
        self.elapsed_time = progress.elapsed_secs;
        self.remaining_time = progress.remaining_secs;
        self.estimated_total_time = progress.estimated_total_secs;
        self.steps = progress.steps.clone();
        self.start_time = Some(progress.start_time);
        self.end_time = progress.end_time.or(self.end_time);
        self.last_update = progress.last_update;
        self
    }
}

/// API endpoint paths
pub mod endpoints {
    pub const SUBMIT_SINGLE: &str = "/api/v1/analysis/single";
    pub const SUBMIT_BATCH: &str = "/api/v1/analysis/batch";
    pub const TASK_LIST: &str = "/api/v1/analysis";
    pub const TASK: &str = "/api/v1/analysis/{task_id}";
    pub const TASK_CANCEL: &str = "/api/v1/analysis/{task_id}/cancel";
    pub const TASK_STREAM: &str = "/api/v1/analysis/{task_id}/stream";
    pub const BATCH_STATUS: &str = "/api/v1/analysis/batch/{batch_id}";
    pub const SYSTEM_STATUS: &str = "/api/v1/system/status";
}
