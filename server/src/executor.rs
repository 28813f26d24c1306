//! Analysis executor seam
//!
//! The multi-step reasoning pipeline that actually analyses a stock lives
//! behind the [`AnalysisExecutor`] trait. The orchestration core only needs
//! two things from it: a blocking `execute` call producing a report, and the
//! discipline of reporting progress through the provided sink, which doubles
//! as the cooperative cancellation checkpoint.

use shared::progress::ANALYSIS_STEPS;
use shared::task::{AnalysisReport, AnalysisTask};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Raised by a progress sink when the task should stop: the owner cancelled
/// it, the lease was lost, or the attempt timed out. The executor is
/// expected to honour it at its next checkpoint.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("analysis interrupted")]
pub struct Interrupted;

/// Failure classification returned by the executor. The worker maps
/// `Transient` to a retryable nack and `Permanent` to a terminal failure.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Network timeouts, rate limits, upstream 5xx. Worth retrying.
    #[error("transient analysis failure: {0}")]
    Transient(String),
    /// Data not found, parameters rejected, internal assertion. Not retried.
    #[error("analysis failed: {0}")]
    Permanent(String),
    /// The pipeline observed an interrupt at a checkpoint and unwound.
    #[error("analysis cancelled")]
    Cancelled,
}

/// Callback handed to the executor for progress reporting.
///
/// `update` forwards the message to the progress tracker and returns
/// `Err(Interrupted)` once the task should stop. Messages matching the known
/// step table advance the reported percent; anything else is recorded
/// verbatim.
pub trait ProgressSink: Send + Sync {
    fn update(&self, message: &str) -> Result<(), Interrupted>;
}

/// The analysis pipeline. Implementations are blocking; the worker runs them
/// on a dedicated blocking thread and never on the scheduler loop.
pub trait AnalysisExecutor: Send + Sync {
    fn execute(
        &self,
        task: &AnalysisTask,
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisReport, ExecutorError>;
}

/// Stand-in pipeline that walks the known step table with short pauses and
/// returns a canned report. Wired by default until a real analysis pipeline
/// is linked in; also the happy-path executor for integration tests.
pub struct SimulatedExecutor {
    step_pause: Duration,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self {
            step_pause: Duration::from_millis(50),
        }
    }

    pub fn with_step_pause(step_pause: Duration) -> Self {
        Self { step_pause }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisExecutor for SimulatedExecutor {
    fn execute(
        &self,
        task: &AnalysisTask,
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisReport, ExecutorError> {
        let started = Instant::now();

        for step in ANALYSIS_STEPS {
            progress.update(step).map_err(|_| ExecutorError::Cancelled)?;
            std::thread::sleep(self.step_pause);
        }

        Ok(AnalysisReport {
            analysis_id: Uuid::new_v4().to_string(),
            summary: format!(
                "Simulated {} analysis of {}",
                task.parameters.research_depth.as_str(),
                task.stock_code
            ),
            recommendation: "hold".to_string(),
            confidence_score: 0.5,
            risk_level: "medium".to_string(),
            key_points: vec!["simulated pipeline output".to_string()],
            detailed_analysis: serde_json::json!({
                "stock_code": task.stock_code,
                "analysts": task.parameters.selected_analysts,
                "simulated": true,
            }),
            execution_time_secs: started.elapsed().as_secs_f64(),
            tokens_used: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::task::AnalysisParameters;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingSink {
        updates: AtomicUsize,
        interrupt: AtomicBool,
    }

    impl ProgressSink for RecordingSink {
        fn update(&self, _message: &str) -> Result<(), Interrupted> {
            if self.interrupt.load(Ordering::SeqCst) {
                return Err(Interrupted);
            }
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_simulated_executor_reports_every_step() {
        let executor = SimulatedExecutor::with_step_pause(Duration::from_millis(0));
        let task = AnalysisTask::new("alice", "000001", AnalysisParameters::default());
        let sink = RecordingSink {
            updates: AtomicUsize::new(0),
            interrupt: AtomicBool::new(false),
        };

        let report = executor.execute(&task, &sink).unwrap();
        assert_eq!(sink.updates.load(Ordering::SeqCst), ANALYSIS_STEPS.len());
        assert!(!report.recommendation.is_empty());
        assert!(report.summary.contains("000001"));
    }

    #[test]
    fn test_simulated_executor_honours_interrupt() {
        let executor = SimulatedExecutor::with_step_pause(Duration::from_millis(0));
        let task = AnalysisTask::new("alice", "000001", AnalysisParameters::default());
        let sink = RecordingSink {
            updates: AtomicUsize::new(0),
            interrupt: AtomicBool::new(true),
        };

        let err = executor.execute(&task, &sink).unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert_eq!(sink.updates.load(Ordering::SeqCst), 0);
    }
}
