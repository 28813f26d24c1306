//! Shared fixtures for worker and scheduler tests: fast configurations,
//! database setup, and scripted executors covering the failure taxonomy.

use crate::cache::LiveCache;
use crate::database::AnalysisDatabase;
use crate::executor::{AnalysisExecutor, ExecutorError, ProgressSink};
use crate::queue::{QueueSettings, TaskQueue};
use crate::worker::{WorkerContext, WorkerEvent};
use shared::config::ServiceConfig;
use shared::task::{AnalysisReport, AnalysisTask};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

/// A configuration with sub-second queue timings suitable for tests.
pub fn test_config(temp_dir: &TempDir) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.data_dir = temp_dir.path().to_string_lossy().to_string();
    config.poll_interval_seconds = 1;
    config.visibility_timeout_seconds = 600;
    config.reclaim_interval_seconds = 1;
    config.backoff_base_seconds = 1;
    config.backoff_cap_seconds = 1;
    config.graceful_shutdown_timeout_seconds = 1;
    config.progress_write_interval_ms = 0;
    config
}

pub async fn test_database(temp_dir: &TempDir, config: &ServiceConfig) -> Arc<Mutex<AnalysisDatabase>> {
    let mut db = AnalysisDatabase::new(temp_dir.path(), config.database_busy_timeout_seconds).unwrap();
    db.initialize().await.unwrap();
    Arc::new(Mutex::new(db))
}

/// Everything a worker (or a hand-rolled scheduler test) needs, wired
/// against one temporary database.
pub struct Fixture {
    pub temp_dir: TempDir,
    pub config: Arc<ServiceConfig>,
    pub database: Arc<Mutex<AnalysisDatabase>>,
    pub cache: LiveCache,
    pub queue: TaskQueue,
    pub submit_notify: Arc<Notify>,
    pub events_rx: mpsc::Receiver<WorkerEvent>,
    events_tx: mpsc::Sender<WorkerEvent>,
}

impl Fixture {
    pub async fn new(tune: impl FnOnce(&mut ServiceConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        tune(&mut config);
        config.validate().unwrap();

        let database = test_database(&temp_dir, &config).await;
        let cache = LiveCache::new(
            Duration::from_secs(config.progress_ttl_seconds),
            Duration::from_secs(config.cancel_ttl_seconds),
        );
        let queue = TaskQueue::new(database.clone(), QueueSettings::from_config(&config));
        let (events_tx, events_rx) = mpsc::channel(64);

        Self {
            temp_dir,
            config: Arc::new(config),
            database,
            cache,
            queue,
            submit_notify: Arc::new(Notify::new()),
            events_rx,
            events_tx,
        }
    }

    pub fn worker_context(&self, executor: Arc<dyn AnalysisExecutor>) -> WorkerContext {
        WorkerContext {
            database: self.database.clone(),
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            executor,
            config: self.config.clone(),
            node_id: "node-1".to_string(),
            events: self.events_tx.clone(),
        }
    }

    /// Insert a pending task for `user_id` and put it on the queue.
    pub async fn seed_task(&self, user_id: &str, stock_code: &str) -> AnalysisTask {
        let task = AnalysisTask::new(user_id, stock_code, Default::default());
        self.database.lock().await.insert_task(&task).await.unwrap();
        self.queue.enqueue(user_id, &task.task_id).await.unwrap();
        task
    }
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn quick_report(task: &AnalysisTask) -> AnalysisReport {
    AnalysisReport {
        analysis_id: Uuid::new_v4().to_string(),
        summary: format!("report for {}", task.stock_code),
        recommendation: "buy".to_string(),
        confidence_score: 0.8,
        risk_level: "low".to_string(),
        key_points: vec!["scripted".to_string()],
        detailed_analysis: serde_json::json!({"scripted": true}),
        execution_time_secs: 0.01,
        tokens_used: 1,
    }
}

/// Fails the first `n` invocations with the given error, then succeeds.
pub struct FlakyExecutor {
    remaining_failures: AtomicUsize,
    transient: bool,
    pub invocations: AtomicUsize,
}

impl FlakyExecutor {
    pub fn transient(n: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(n),
            transient: true,
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn permanent() -> Self {
        Self {
            remaining_failures: AtomicUsize::new(usize::MAX),
            transient: false,
            invocations: AtomicUsize::new(0),
        }
    }
}

impl AnalysisExecutor for FlakyExecutor {
    fn execute(
        &self,
        task: &AnalysisTask,
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisReport, ExecutorError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        progress
            .update("Preparing environment")
            .map_err(|_| ExecutorError::Cancelled)?;

        let failures = self.remaining_failures.load(Ordering::SeqCst);
        if failures > 0 {
            if failures != usize::MAX {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            }
            return if self.transient {
                Err(ExecutorError::Transient("upstream 503".to_string()))
            } else {
                Err(ExecutorError::Permanent("no data for symbol".to_string()))
            };
        }

        Ok(quick_report(task))
    }
}

/// Checkpoints in a tight loop and only finishes once released. Covers the
/// cancellation, timeout and shutdown paths without uncheckpointed hangs:
/// an interrupt always terminates the loop promptly.
pub struct StallExecutor {
    pub release: Arc<AtomicBool>,
    pub checkpoints: Arc<AtomicUsize>,
}

impl StallExecutor {
    pub fn new() -> Self {
        Self {
            release: Arc::new(AtomicBool::new(false)),
            checkpoints: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AnalysisExecutor for StallExecutor {
    fn execute(
        &self,
        task: &AnalysisTask,
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisReport, ExecutorError> {
        loop {
            progress
                .update("Market analyst")
                .map_err(|_| ExecutorError::Cancelled)?;
            self.checkpoints.fetch_add(1, Ordering::SeqCst);
            if self.release.load(Ordering::SeqCst) {
                return Ok(quick_report(task));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Records execution order and succeeds immediately.
pub struct RecordingExecutor {
    pub executed: Arc<StdMutex<Vec<(String, String)>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            executed: Arc::new(StdMutex::new(Vec::new())),
        }
    }
}

impl AnalysisExecutor for RecordingExecutor {
    fn execute(
        &self,
        task: &AnalysisTask,
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisReport, ExecutorError> {
        progress
            .update("Preparing environment")
            .map_err(|_| ExecutorError::Cancelled)?;
        self.executed
            .lock()
            .unwrap()
            .push((task.user_id.clone(), task.stock_code.clone()));
        std::thread::sleep(Duration::from_millis(10));
        Ok(quick_report(task))
    }
}

/// Permanently fails one specific stock code, succeeds for the rest.
pub struct SelectiveFailExecutor {
    pub fail_code: String,
}

impl AnalysisExecutor for SelectiveFailExecutor {
    fn execute(
        &self,
        task: &AnalysisTask,
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisReport, ExecutorError> {
        progress
            .update("Preparing environment")
            .map_err(|_| ExecutorError::Cancelled)?;
        if task.stock_code == self.fail_code {
            return Err(ExecutorError::Permanent("delisted symbol".to_string()));
        }
        Ok(quick_report(task))
    }
}
