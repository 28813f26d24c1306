//! Live progress tracking for one analysis task
//!
//! The tracker turns the free-form progress messages coming out of the
//! analysis pipeline into a structured record: a step pointer into the known
//! pipeline step table, a bounded percent value, and a remaining-time
//! estimate. The owning worker is the only writer; streaming clients read
//! snapshots.

use crate::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered step labels of the analysis pipeline.
///
/// Messages that exactly match an entry advance the step pointer; anything
/// else is recorded verbatim without moving the percent. The table must stay
/// in pipeline execution order because percent is derived from the index.
pub const ANALYSIS_STEPS: &[&str] = &[
    "Preparing environment",
    "Estimating analysis cost",
    "Configuring parameters",
    "Initializing analysis engine",
    "Market analyst",
    "Fundamentals analyst",
    "News analyst",
    "Social media analyst",
    "Bull researcher",
    "Bear researcher",
    "Research manager",
    "Trader decision",
    "Aggressive risk assessment",
    "Conservative risk assessment",
    "Neutral risk assessment",
    "Risk manager",
    "Generating report",
];

/// Step label appended when the tracker is marked completed.
pub const STEP_COMPLETED: &str = "Analysis complete";

/// Floor for the percent fraction in the time estimate, so early updates do
/// not divide by zero.
const MIN_PROGRESS_FRACTION: f64 = 0.01;

/// Percent ceiling while the pipeline is still running; only
/// `mark_completed` reaches 100.
const RUNNING_PERCENT_CAP: u8 = 95;

/// Read-only copy of the tracker state, serialized to streaming clients and
/// into the live cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    /// Progress percent, 0-100
    pub progress: u8,
    /// Label of the step currently running
    pub current_step: String,
    /// Last raw progress message
    pub message: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub estimated_total_secs: f64,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    /// Labels seen so far, in arrival order
    pub steps: Vec<String>,
}

/// Tracks the live progress of one task during a single reservation.
///
/// Percent is non-decreasing for the lifetime of a tracker instance. A retry
/// creates a fresh tracker, so percent may reset between reservations.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    task_id: String,
    status: TaskStatus,
    progress: u8,
    current_step: String,
    message: String,
    start_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    /// Baseline duration estimate for the requested research depth
    baseline_estimate_secs: u64,
    /// 1-based index of the furthest matched step
    step_index: usize,
    steps: Vec<String>,
}

impl ProgressTracker {
    /// Create a tracker for a task that just started running.
    ///
    /// `baseline_estimate_secs` is the configured duration estimate for the
    /// task's research depth; it anchors remaining-time reporting until the
    /// observed pace overtakes it.
    pub fn new(task_id: &str, baseline_estimate_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Running,
            progress: 0,
            current_step: String::new(),
            message: String::new(),
            start_time: now,
            last_update: now,
            end_time: None,
            baseline_estimate_secs,
            step_index: 0,
            steps: Vec::new(),
        }
    }

    /// Record a progress message from the pipeline.
    ///
    /// A message matching a step-table entry at or beyond the current
    /// position advances the step pointer and the percent; any other message
    /// only refreshes the label, message and timestamps. New labels are
    /// appended to the step history either way. Never fails.
    pub fn update(&mut self, message: &str) {
        let now = Utc::now();

        if let Some(pos) = ANALYSIS_STEPS.iter().position(|s| *s == message) {
            // Matching an earlier step (a retry inside the pipeline) must not
            // move the percent backwards.
            if pos + 1 > self.step_index {
                self.step_index = pos + 1;
                let pct = (self.step_index * 100 / ANALYSIS_STEPS.len()) as u8;
                self.progress = self.progress.max(pct.min(RUNNING_PERCENT_CAP));
            }
        }

        self.current_step = message.to_string();
        self.message = message.to_string();
        self.last_update = now;

        if !self.steps.iter().any(|s| s == message) {
            self.steps.push(message.to_string());
        }
    }

    /// Mark the analysis as finished successfully.
    pub fn mark_completed(&mut self, message: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.current_step = STEP_COMPLETED.to_string();
        self.message = message.to_string();
        self.last_update = now;
        self.end_time = Some(now);
        if !self.steps.iter().any(|s| s == STEP_COMPLETED) {
            self.steps.push(STEP_COMPLETED.to_string());
        }
    }

    /// Mark the analysis as failed. Percent stays where it was.
    pub fn mark_failed(&mut self, message: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.message = message.to_string();
        self.last_update = now;
        self.end_time = Some(now);
    }

    /// Mark the analysis as cancelled. Percent stays where it was.
    pub fn mark_cancelled(&mut self, message: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Cancelled;
        self.message = message.to_string();
        self.last_update = now;
        self.end_time = Some(now);
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn current_step(&self) -> &str {
        &self.current_step
    }

    /// Build a read-only snapshot with freshly computed timing figures.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let reference = self.end_time.unwrap_or_else(Utc::now);
        let elapsed = (reference - self.start_time).num_milliseconds().max(0) as f64 / 1000.0;

        let (estimated_total, remaining) = if self.status.is_terminal() {
            (elapsed, 0.0)
        } else {
            let fraction = (self.progress as f64 / 100.0).max(MIN_PROGRESS_FRACTION);
            let estimated = (self.baseline_estimate_secs as f64).max(elapsed / fraction);
            (estimated, (estimated - elapsed).max(0.0))
        };

        ProgressSnapshot {
            task_id: self.task_id.clone(),
            status: self.status,
            progress: self.progress,
            current_step: self.current_step.clone(),
            message: self.message.clone(),
            start_time: self.start_time,
            last_update: self.last_update,
            end_time: self.end_time,
            estimated_total_secs: estimated_total,
            elapsed_secs: elapsed,
            remaining_secs: remaining,
            steps: self.steps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_step_advances_percent() {
        let mut tracker = ProgressTracker::new("task-1", 300);
        assert_eq!(tracker.progress(), 0);

        tracker.update("Preparing environment");
        let after_first = tracker.progress();
        assert!(after_first > 0);

        tracker.update("Initializing analysis engine");
        assert!(tracker.progress() > after_first);
        assert_eq!(tracker.current_step(), "Initializing analysis engine");
    }

    #[test]
    fn test_unknown_label_keeps_percent() {
        let mut tracker = ProgressTracker::new("task-1", 300);
        tracker.update("Market analyst");
        let pct = tracker.progress();

        tracker.update("fetching quote history for 000001");
        assert_eq!(tracker.progress(), pct);
        assert_eq!(tracker.current_step(), "fetching quote history for 000001");

        let snap = tracker.snapshot();
        assert!(snap
            .steps
            .iter()
            .any(|s| s == "fetching quote history for 000001"));
    }

    #[test]
    fn test_percent_capped_until_completed() {
        let mut tracker = ProgressTracker::new("task-1", 60);
        for step in ANALYSIS_STEPS {
            tracker.update(step);
        }
        assert!(tracker.progress() <= RUNNING_PERCENT_CAP);

        tracker.mark_completed("done");
        assert_eq!(tracker.progress(), 100);
        assert_eq!(tracker.status(), TaskStatus::Completed);
        let snap = tracker.snapshot();
        assert_eq!(snap.remaining_secs, 0.0);
        assert!(snap.steps.iter().any(|s| s == STEP_COMPLETED));
    }

    #[test]
    fn test_percent_is_monotonic() {
        let mut tracker = ProgressTracker::new("task-1", 300);
        tracker.update("Bull researcher");
        let pct = tracker.progress();

        // A pipeline-internal retry replays an earlier step.
        tracker.update("Market analyst");
        assert_eq!(tracker.progress(), pct);
    }

    #[test]
    fn test_mark_failed_keeps_percent() {
        let mut tracker = ProgressTracker::new("task-1", 300);
        tracker.update("News analyst");
        let pct = tracker.progress();

        tracker.mark_failed("upstream data source unavailable");
        assert_eq!(tracker.progress(), pct);
        assert_eq!(tracker.status(), TaskStatus::Failed);
        assert!(tracker.snapshot().end_time.is_some());
    }

    #[test]
    fn test_duplicate_step_recorded_once() {
        let mut tracker = ProgressTracker::new("task-1", 300);
        tracker.update("Market analyst");
        tracker.update("Market analyst");
        assert_eq!(
            tracker
                .snapshot()
                .steps
                .iter()
                .filter(|s| *s == "Market analyst")
                .count(),
            1
        );
    }

    #[test]
    fn test_estimate_uses_baseline_early_on() {
        let mut tracker = ProgressTracker::new("task-1", 300);
        tracker.update("Preparing environment");
        let snap = tracker.snapshot();
        // Barely any time has passed, so the configured baseline dominates.
        assert!(snap.estimated_total_secs >= 300.0);
        assert!(snap.remaining_secs <= snap.estimated_total_secs);
    }

    #[test]
    fn test_last_update_is_non_decreasing() {
        let mut tracker = ProgressTracker::new("task-1", 300);
        tracker.update("Preparing environment");
        let first = tracker.snapshot().last_update;
        tracker.update("Estimating analysis cost");
        assert!(tracker.snapshot().last_update >= first);
    }
}
