//! Task and batch documents for stock analysis jobs
//!
//! This module defines the durable task model: the analysis task itself, the
//! batch wrapper used for multi-stock submissions, the typed analysis
//! parameters, and the report payload produced by the analysis pipeline.
// The task document is the source of truth for a job's lifecycle. The queue
// and the live progress cache only ever hold derived state; everything here
// must survive a process restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an analysis task.
///
/// `Pending` covers both "queued, waiting for a worker" and "re-queued after
/// a retry". A task re-enters `Pending` when its reservation is reclaimed;
/// the three terminal states are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }

    /// Whether this status is terminal. Terminal statuses are write-once;
    /// the store rejects any transition out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// `Running -> Pending` is the reclaim/retry path: the queue returned the
    /// task to the ready list and the store row reverts with it.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Cancelled) => true,
            (TaskStatus::Running, TaskStatus::Pending) => true,
            _ => false,
        }
    }
}

/// How elaborate the analysis pipeline should be.
///
/// Depth drives the number of analyst roles and debate rounds on the
/// executor side; on this side it selects the default wall-clock timeout and
/// the baseline duration estimate used for remaining-time reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDepth {
    Quick,
    Basic,
    Standard,
    Deep,
    Comprehensive,
}

impl Default for ResearchDepth {
    fn default() -> Self {
        ResearchDepth::Standard
    }
}

impl ResearchDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResearchDepth::Quick => "quick",
            ResearchDepth::Basic => "basic",
            ResearchDepth::Standard => "standard",
            ResearchDepth::Deep => "deep",
            ResearchDepth::Comprehensive => "comprehensive",
        }
    }

    /// Baseline estimate of total analysis duration for this depth, used by
    /// the progress tracker until observed progress suggests otherwise.
    pub fn estimated_total_secs(&self) -> u64 {
        match self {
            ResearchDepth::Quick => 60,
            ResearchDepth::Basic => 120,
            ResearchDepth::Standard => 300,
            ResearchDepth::Deep => 600,
            ResearchDepth::Comprehensive => 900,
        }
    }

    /// Default wall-clock timeout for one execution attempt at this depth.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            ResearchDepth::Quick => 300,
            ResearchDepth::Basic => 450,
            ResearchDepth::Standard => 600,
            ResearchDepth::Deep => 1200,
            ResearchDepth::Comprehensive => 1800,
        }
    }
}

/// Analyst roles the pipeline can run. Unknown tags are rejected at
/// submission rather than silently dropped by the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnalystRole {
    Market,
    Fundamentals,
    News,
    Social,
}

impl AnalystRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalystRole::Market => "market",
            AnalystRole::Fundamentals => "fundamentals",
            AnalystRole::News => "news",
            AnalystRole::Social => "social",
        }
    }
}

/// Default analyst selection when a request does not name any.
pub fn default_analysts() -> Vec<AnalystRole> {
    vec![AnalystRole::Market, AnalystRole::Fundamentals]
}

fn default_market_type() -> String {
    "A".to_string()
}

/// Typed analysis parameters carried on every task.
///
/// Model identifiers left unset in the request are filled from the effective
/// settings at submission time; `analysis_date` left unset is filled with the
/// current date when a worker picks the task up, so queued tasks analyze the
/// day they actually run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisParameters {
    /// Pipeline elaborateness
    #[serde(default)]
    pub research_depth: ResearchDepth,
    /// Analyst roles to include
    #[serde(default = "default_analysts")]
    pub selected_analysts: Vec<AnalystRole>,
    /// Model used for data collection and tool calling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_analysis_model: Option<String>,
    /// Model used for reasoning and decision making
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_analysis_model: Option<String>,
    /// Market tag for the stock (e.g. "A", "US", "HK")
    #[serde(default = "default_market_type")]
    pub market_type: String,
    /// ISO date the analysis refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_date: Option<String>,
}

impl Default for AnalysisParameters {
    fn default() -> Self {
        Self {
            research_depth: ResearchDepth::default(),
            selected_analysts: default_analysts(),
            quick_analysis_model: None,
            deep_analysis_model: None,
            market_type: default_market_type(),
            analysis_date: None,
        }
    }
}

/// Final report produced by the analysis pipeline for one stock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    /// Opaque id of this analysis run
    pub analysis_id: String,
    /// One-paragraph summary of the findings
    pub summary: String,
    /// Buy/hold/sell style recommendation
    pub recommendation: String,
    /// Confidence in the recommendation, 0.0 to 1.0
    pub confidence_score: f64,
    /// Coarse risk classification
    pub risk_level: String,
    /// Bullet points backing the recommendation
    pub key_points: Vec<String>,
    /// Full structured output of the pipeline
    pub detailed_analysis: serde_json::Value,
    /// Wall-clock seconds the pipeline ran
    pub execution_time_secs: f64,
    /// Token usage reported by the pipeline
    pub tokens_used: u64,
}

/// One stock analysis job as persisted in the task store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisTask {
    /// Unique task id (opaque string)
    pub task_id: String,
    /// Owning user
    pub user_id: String,
    /// Batch this task belongs to, if submitted as part of one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Stock symbol under analysis
    pub stock_code: String,
    /// Typed analysis parameters
    pub parameters: AnalysisParameters,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Progress percent, 0-100
    pub progress: u8,
    /// Label of the pipeline step currently running
    #[serde(default)]
    pub current_step: String,
    /// Last human-readable progress message
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    /// Report payload, present once completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisReport>,
    /// Failure reason, present once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Number of retries consumed so far
    #[serde(default)]
    pub retry_count: u32,
    /// Worker currently holding the reservation, empty when not reserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl AnalysisTask {
    /// Create a fresh pending task for a stock.
    pub fn new(user_id: &str, stock_code: &str, parameters: AnalysisParameters) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            batch_id: None,
            stock_code: stock_code.to_string(),
            parameters,
            status: TaskStatus::Pending,
            progress: 0,
            current_step: String::new(),
            message: String::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            last_update: now,
            result: None,
            error_message: None,
            retry_count: 0,
            worker_id: None,
        }
    }

    /// Same as [`AnalysisTask::new`] but tagged as a batch member.
    pub fn new_in_batch(
        user_id: &str,
        stock_code: &str,
        parameters: AnalysisParameters,
        batch_id: &str,
    ) -> Self {
        let mut task = Self::new(user_id, stock_code, parameters);
        task.batch_id = Some(batch_id.to_string());
        task
    }
}

/// Aggregated view of a multi-stock submission.
///
/// Only the terminal counters are stored; pending and running counts are
/// recomputed from the tasks table when a batch is read, so the invariant
/// `pending + running + completed + failed + cancelled == total_tasks` holds
/// from the observer's perspective without touching the batch row on every
/// non-terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisBatch {
    /// Unique batch id (opaque string)
    pub batch_id: String,
    /// Owning user
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Number of tasks created with this batch
    pub total_tasks: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub cancelled_count: u32,
    /// Recomputed on read, not stored
    #[serde(default)]
    pub pending_count: u32,
    /// Recomputed on read, not stored
    #[serde(default)]
    pub running_count: u32,
    /// Parameters shared by every task in the batch
    pub parameters: AnalysisParameters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisBatch {
    /// Create a new batch record for `total_tasks` stocks.
    pub fn new(
        user_id: &str,
        title: &str,
        description: &str,
        total_tasks: u32,
        parameters: AnalysisParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            batch_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            total_tasks,
            completed_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            pending_count: 0,
            running_count: 0,
            parameters,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether every task in the batch has reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.completed_count + self.failed_count + self.cancelled_count >= self.total_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_legal_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        // Reclaim path
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_terminal_is_absorbing() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} -> {:?} must be rejected",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("paused").is_err());
    }

    #[test]
    fn test_new_task_defaults() {
        let task = AnalysisTask::new("user-1", "000001", AnalysisParameters::default());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 0);
        assert!(task.worker_id.is_none());
        assert!(task.batch_id.is_none());
        assert_eq!(task.parameters.research_depth, ResearchDepth::Standard);
        assert_eq!(task.parameters.selected_analysts.len(), 2);
    }

    #[test]
    fn test_depth_deserializes_snake_case() {
        let params: AnalysisParameters =
            serde_json::from_str(r#"{"research_depth": "comprehensive"}"#).unwrap();
        assert_eq!(params.research_depth, ResearchDepth::Comprehensive);
        assert_eq!(params.market_type, "A");
        assert!(params.quick_analysis_model.is_none());
    }

    #[test]
    fn test_depth_timeouts_grow_with_depth() {
        assert!(
            ResearchDepth::Quick.default_timeout_secs()
                < ResearchDepth::Comprehensive.default_timeout_secs()
        );
        assert_eq!(ResearchDepth::Standard.default_timeout_secs(), 600);
        assert_eq!(ResearchDepth::Comprehensive.default_timeout_secs(), 1800);
    }

    #[test]
    fn test_batch_is_finished() {
        let mut batch =
            AnalysisBatch::new("user-1", "tech picks", "", 4, AnalysisParameters::default());
        assert!(!batch.is_finished());
        batch.completed_count = 3;
        batch.failed_count = 1;
        assert!(batch.is_finished());
    }
}
