//! Task scheduling and dispatch for the analysis server
//!
//! The scheduler is a single loop per node. Each pass it reclaims expired
//! reservations when the reclaim interval has elapsed, reserves as many
//! ready tasks as free worker slots allow, and hands each reservation to a
//! spawned worker. It then parks on whichever comes first: a submission
//! notification, a worker completion event, or the poll interval.
// The scheduler never awaits the executor and never blocks on a worker; the
// workers report back over an mpsc channel, which is also what frees their
// slots. Fairness lives in the queue (persisted cursor), not here.

use crate::cache::LiveCache;
use crate::database::AnalysisDatabase;
use crate::executor::AnalysisExecutor;
use crate::queue::TaskQueue;
use crate::worker::{self, WorkerContext, WorkerEvent, WorkerOutcome};
use anyhow::Result;
use shared::config::ServiceConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Represents the possible states of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Dispatches reserved tasks to workers under the concurrency caps.
pub struct AnalysisScheduler {
    config: Arc<ServiceConfig>,
    database: Arc<Mutex<AnalysisDatabase>>,
    queue: TaskQueue,
    cache: LiveCache,
    executor: Arc<dyn AnalysisExecutor>,
    /// Reservation owner identity for every lease taken by this node
    node_id: String,
    /// Woken by the submission path so fresh tasks don't wait out the poll
    /// interval
    submit_notify: Arc<Notify>,
    /// Mirrors the running state into the API's system status
    running_flag: Arc<AtomicBool>,
    event_rx: mpsc::Receiver<WorkerEvent>,
    event_tx: mpsc::Sender<WorkerEvent>,
    /// Active workers by task id; the map size is the node's inflight count
    active: HashMap<String, JoinHandle<()>>,
    pub state: SchedulerState,
    last_reclaim: Option<Instant>,
}

impl AnalysisScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ServiceConfig>,
        database: Arc<Mutex<AnalysisDatabase>>,
        queue: TaskQueue,
        cache: LiveCache,
        executor: Arc<dyn AnalysisExecutor>,
        node_id: String,
        submit_notify: Arc<Notify>,
        running_flag: Arc<AtomicBool>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_buffer_size);
        Self {
            config,
            database,
            queue,
            cache,
            executor,
            node_id,
            submit_notify,
            running_flag,
            event_rx,
            event_tx,
            active: HashMap::new(),
            state: SchedulerState::Stopped,
            last_reclaim: None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Number of workers currently executing on this node.
    pub fn active_workers(&self) -> usize {
        self.active.len()
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            database: self.database.clone(),
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            executor: self.executor.clone(),
            config: self.config.clone(),
            node_id: self.node_id.clone(),
            events: self.event_tx.clone(),
        }
    }

    /// Run the dispatch loop until the shutdown signal fires, then drain
    /// in-flight workers gracefully.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.state = SchedulerState::Running;
        self.running_flag.store(true, Ordering::SeqCst);
        info!(node_id = %self.node_id, "Scheduler started");

        loop {
            if let Err(e) = self.reclaim_if_due().await {
                warn!(error = %e, "Reclaim sweep failed");
            }
            if let Err(e) = self.dispatch().await {
                warn!(error = %e, "Dispatch failed");
            }

            let notify = self.submit_notify.clone();
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(event) = self.event_rx.recv() => self.handle_worker_event(event),
                _ = notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_seconds)) => {},
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Reserve ready tasks up to the free slots and spawn a worker for each.
    async fn dispatch(&mut self) -> Result<()> {
        if self.state != SchedulerState::Running {
            return Ok(());
        }

        let pool_free = self
            .config
            .worker_pool_size
            .saturating_sub(self.active.len());
        let global_room = self
            .config
            .max_concurrent_tasks
            .saturating_sub(self.active.len());
        let slots = pool_free.min(global_room);
        if slots == 0 {
            return Ok(());
        }

        let reservations = self.queue.reserve(&self.node_id, slots).await?;
        for reservation in reservations {
            debug!(
                task_id = %reservation.task_id,
                user_id = %reservation.user_id,
                "Dispatching task to worker"
            );
            let handle = worker::spawn(self.worker_context(), reservation.clone());
            self.active.insert(reservation.task_id, handle);
        }

        Ok(())
    }

    /// Free the slot of a finished worker and log how the run ended.
    fn handle_worker_event(&mut self, event: WorkerEvent) {
        self.active.remove(&event.task_id);
        match event.outcome {
            WorkerOutcome::Completed => {
                debug!(task_id = %event.task_id, "Worker finished successfully")
            }
            WorkerOutcome::Requeued => {
                debug!(task_id = %event.task_id, "Worker requeued task for retry")
            }
            WorkerOutcome::Failed => debug!(task_id = %event.task_id, "Worker recorded failure"),
            WorkerOutcome::Cancelled => debug!(task_id = %event.task_id, "Worker saw cancellation"),
            WorkerOutcome::Skipped => debug!(task_id = %event.task_id, "Worker skipped task"),
            WorkerOutcome::LeaseLost => {
                warn!(task_id = %event.task_id, "Worker abandoned task after lease loss")
            }
            WorkerOutcome::Abandoned => {
                warn!(task_id = %event.task_id, "Worker left task to reclaim")
            }
        }
    }

    /// Run the reclaim sweep when the configured interval has elapsed:
    /// expired reservations go back to their ready lists and their store
    /// rows revert to pending; tasks past the retry budget become terminal
    /// failures.
    async fn reclaim_if_due(&mut self) -> Result<()> {
        let due = self
            .last_reclaim
            .map(|at| at.elapsed() >= Duration::from_secs(self.config.reclaim_interval_seconds))
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        self.last_reclaim = Some(Instant::now());

        let outcome = self.queue.reclaim_expired().await?;

        for task_id in &outcome.requeued {
            let retry_count = self
                .queue
                .entry(task_id)
                .await?
                .map(|entry| entry.retry_count)
                .unwrap_or(0);
            self.database
                .lock()
                .await
                .revert_task_to_pending(task_id, None, retry_count)
                .await?;
            info!(task_id = %task_id, retry = retry_count, "Reclaimed expired reservation");
        }

        for task_id in &outcome.exhausted {
            self.database
                .lock()
                .await
                .fail_task_system(task_id, "retries exhausted after reservation expiry")
                .await?;
            warn!(task_id = %task_id, "Task failed after repeated lease expiries");
        }

        Ok(())
    }

    /// Graceful shutdown: stop reserving, wait for in-flight workers up to
    /// the configured timeout, then return whatever is left to the queue so
    /// the next run can pick it up.
    async fn stop(&mut self) {
        info!("Stopping scheduler gracefully");
        self.state = SchedulerState::Stopped;
        self.running_flag.store(false, Ordering::SeqCst);

        let deadline =
            Instant::now() + Duration::from_secs(self.config.graceful_shutdown_timeout_seconds);

        while !self.active.is_empty() && Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(100), self.event_rx.recv()).await {
                Ok(Some(event)) => self.handle_worker_event(event),
                Ok(None) => break,
                Err(_) => {}
            }
        }

        if !self.active.is_empty() {
            warn!(
                remaining = self.active.len(),
                "Shutdown deadline reached, returning in-flight tasks to the queue"
            );
            let remaining: Vec<(String, JoinHandle<()>)> = self.active.drain().collect();
            for (task_id, handle) in remaining {
                // Cut the worker off before touching its task so its writes
                // cannot race the requeue.
                handle.abort();

                let retry_count = match self.queue.nack(&task_id, &self.node_id, true).await {
                    Ok(crate::database::NackOutcome::Requeued { retry_count, .. }) => {
                        debug!(task_id = %task_id, "Returned task to queue on shutdown");
                        retry_count
                    }
                    Ok(crate::database::NackOutcome::NotRequeued { .. }) => {
                        // Out of retries; make the failure durable so the
                        // task is not stuck running forever.
                        if let Err(e) = self
                            .database
                            .lock()
                            .await
                            .fail_task_system(&task_id, "retries exhausted during shutdown")
                            .await
                        {
                            warn!(task_id = %task_id, error = %e, "Failed to record shutdown failure");
                        }
                        continue;
                    }
                    Ok(crate::database::NackOutcome::LeaseLost) => {
                        debug!(task_id = %task_id, "Lease already gone on shutdown");
                        continue;
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Failed to requeue task on shutdown");
                        continue;
                    }
                };

                if let Err(e) = self
                    .database
                    .lock()
                    .await
                    .revert_task_to_pending(&task_id, None, retry_count)
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "Failed to revert task during shutdown");
                }
            }
        } else {
            info!("All in-flight workers finished before shutdown deadline");
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;
    use crate::models::ModelRegistry;
    use crate::submission::SubmissionService;
    use crate::test_support::{
        wait_until, Fixture, FlakyExecutor, RecordingExecutor, SelectiveFailExecutor,
        StallExecutor,
    };
    use shared::api::BatchAnalysisRequest;
    use shared::task::TaskStatus;

    struct RunningScheduler {
        shutdown_tx: broadcast::Sender<()>,
        handle: JoinHandle<()>,
    }

    impl RunningScheduler {
        async fn start(fixture: &Fixture, executor: Arc<dyn AnalysisExecutor>) -> Self {
            let mut scheduler = AnalysisScheduler::new(
                fixture.config.clone(),
                fixture.database.clone(),
                fixture.queue.clone(),
                fixture.cache.clone(),
                executor,
                "node-1".to_string(),
                fixture.submit_notify.clone(),
                Arc::new(AtomicBool::new(false)),
            );
            let (shutdown_tx, _) = broadcast::channel(1);
            let shutdown_rx = shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                let _ = scheduler.run(shutdown_rx).await;
            });
            Self {
                shutdown_tx,
                handle,
            }
        }

        async fn stop(self) {
            let _ = self.shutdown_tx.send(());
            let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
        }
    }

    async fn task_status(fixture: &Fixture, task_id: &str) -> Option<TaskStatus> {
        fixture
            .database
            .lock()
            .await
            .get_task(task_id)
            .await
            .unwrap()
            .map(|t| t.status)
    }

    async fn wait_for_status(fixture: &Fixture, task_id: &str, expected: TaskStatus, secs: u64) -> bool {
        wait_until(Duration::from_secs(secs), || {
            let database = fixture.database.clone();
            let task_id = task_id.to_string();
            async move {
                database
                    .lock()
                    .await
                    .get_task(&task_id)
                    .await
                    .unwrap()
                    .map(|t| t.status == expected)
                    .unwrap_or(false)
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_happy_path_single_task() {
        let fixture = Fixture::new(|_| {}).await;
        let task = fixture.seed_task("alice", "000001").await;

        let scheduler = RunningScheduler::start(
            &fixture,
            Arc::new(SimulatedExecutor::with_step_pause(Duration::from_millis(1))),
        )
        .await;
        fixture.submit_notify.notify_one();

        assert!(wait_for_status(&fixture, &task.task_id, TaskStatus::Completed, 5).await);

        let stored = fixture
            .database
            .lock()
            .await
            .get_task(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.progress, 100);
        assert!(!stored.result.as_ref().unwrap().recommendation.is_empty());
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        // The analysis date was defaulted at reserve time.
        assert!(stored.parameters.analysis_date.is_some());

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_per_user_cap_holds_under_load() {
        let fixture = Fixture::new(|config| {
            config.max_concurrent_tasks = 10;
            config.per_user_concurrent_tasks = 2;
        })
        .await;

        let mut task_ids = Vec::new();
        for i in 0..5 {
            let task = fixture.seed_task("alice", &format!("00000{}", i)).await;
            task_ids.push(task.task_id);
        }

        let stall = Arc::new(StallExecutor::new());
        let scheduler = RunningScheduler::start(&fixture, stall.clone()).await;
        fixture.submit_notify.notify_one();

        // Two attempts start and the rest wait for slots.
        assert!(
            wait_until(Duration::from_secs(3), || {
                let database = fixture.database.clone();
                async move {
                    database
                        .lock()
                        .await
                        .count_tasks_in_status("alice", TaskStatus::Running)
                        .await
                        .unwrap()
                        == 2
                }
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            fixture
                .database
                .lock()
                .await
                .count_tasks_in_status("alice", TaskStatus::Running)
                .await
                .unwrap(),
            2
        );
        assert_eq!(fixture.queue.stats().await.unwrap().inflight, 2);

        // After release everything drains.
        stall.release.store(true, std::sync::atomic::Ordering::SeqCst);
        for task_id in &task_ids {
            assert!(wait_for_status(&fixture, task_id, TaskStatus::Completed, 10).await);
        }

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_dispatch_alternates_between_users() {
        let fixture = Fixture::new(|config| {
            config.max_concurrent_tasks = 1;
            config.per_user_concurrent_tasks = 1;
            config.worker_pool_size = 1;
        })
        .await;

        let mut task_ids = Vec::new();
        for i in 0..3 {
            task_ids.push(fixture.seed_task("alice", &format!("A000{}", i)).await.task_id);
        }
        for i in 0..3 {
            task_ids.push(fixture.seed_task("bob", &format!("B000{}", i)).await.task_id);
        }

        let executor = Arc::new(RecordingExecutor::new());
        let scheduler = RunningScheduler::start(&fixture, executor.clone()).await;
        fixture.submit_notify.notify_one();

        for task_id in &task_ids {
            assert!(wait_for_status(&fixture, task_id, TaskStatus::Completed, 15).await);
        }
        scheduler.stop().await;

        let executed = executor.executed.lock().unwrap().clone();
        let users: Vec<String> = executed.iter().map(|(user, _)| user.clone()).collect();
        assert_eq!(users, vec!["alice", "bob", "alice", "bob", "alice", "bob"]);

        // No double execution: every stock ran exactly once.
        let mut stocks: Vec<String> = executed.iter().map(|(_, stock)| stock.clone()).collect();
        stocks.sort();
        stocks.dedup();
        assert_eq!(stocks.len(), 6);
    }

    #[tokio::test]
    async fn test_reclaim_recovers_abandoned_reservation() {
        let fixture = Fixture::new(|config| {
            config.visibility_timeout_seconds = 2;
            config.reclaim_interval_seconds = 1;
        })
        .await;
        let task = fixture.seed_task("alice", "000001").await;

        // A worker on a dead node reserved the task, went running, and
        // crashed without ever heartbeating.
        let reservations = fixture.queue.reserve("dead-node", 1).await.unwrap();
        assert_eq!(reservations.len(), 1);
        fixture
            .database
            .lock()
            .await
            .mark_task_running(&task.task_id, "dead-node")
            .await
            .unwrap();

        let scheduler = RunningScheduler::start(
            &fixture,
            Arc::new(SimulatedExecutor::with_step_pause(Duration::from_millis(1))),
        )
        .await;

        // The lease expires, the reclaim sweep requeues the task, and a live
        // worker finishes it.
        assert!(wait_for_status(&fixture, &task.task_id, TaskStatus::Completed, 10).await);

        let stored = fixture
            .database
            .lock()
            .await
            .get_task(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.result.is_some());

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_pending_task_never_executes() {
        let fixture = Fixture::new(|_| {}).await;
        let task = fixture.seed_task("alice", "000001").await;

        // Owner cancels before the scheduler ever sees the task.
        fixture.cache.set_cancelled(&task.task_id);
        fixture
            .database
            .lock()
            .await
            .cancel_task(&task.task_id)
            .await
            .unwrap();
        fixture.queue.remove(&task.task_id).await.unwrap();

        let executor = Arc::new(RecordingExecutor::new());
        let scheduler = RunningScheduler::start(&fixture, executor.clone()).await;
        fixture.submit_notify.notify_one();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(task_status(&fixture, &task.task_id).await, Some(TaskStatus::Cancelled));
        assert!(executor.executed.lock().unwrap().is_empty());
        assert_eq!(fixture.queue.stats().await.unwrap().ready, 0);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_transient_failure_retries_to_completion() {
        let fixture = Fixture::new(|_| {}).await;
        let task = fixture.seed_task("alice", "000001").await;

        let executor = Arc::new(FlakyExecutor::transient(1));
        let scheduler = RunningScheduler::start(&fixture, executor.clone()).await;
        fixture.submit_notify.notify_one();

        // First attempt fails, the backoff gate (1s) passes, the retry wins.
        assert!(wait_for_status(&fixture, &task.task_id, TaskStatus::Completed, 10).await);

        let stored = fixture
            .database
            .lock()
            .await
            .get_task(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(
            executor.invocations.load(std::sync::atomic::Ordering::SeqCst),
            2
        );

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_batch_counters_converge() {
        let fixture = Fixture::new(|_| {}).await;

        let submission = SubmissionService::new(
            fixture.config.clone(),
            fixture.database.clone(),
            fixture.queue.clone(),
            ModelRegistry,
            fixture.submit_notify.clone(),
        );
        let response = submission
            .submit_batch(&BatchAnalysisRequest {
                user_id: "alice".to_string(),
                stock_codes: vec![
                    "000001".to_string(),
                    "000002".to_string(),
                    "000003".to_string(),
                    "BAD001".to_string(),
                ],
                title: "mixed picks".to_string(),
                description: String::new(),
                parameters: None,
            })
            .await
            .unwrap();

        let scheduler = RunningScheduler::start(
            &fixture,
            Arc::new(SelectiveFailExecutor {
                fail_code: "BAD001".to_string(),
            }),
        )
        .await;
        fixture.submit_notify.notify_one();

        assert!(
            wait_until(Duration::from_secs(10), || {
                let database = fixture.database.clone();
                let batch_id = response.batch_id.clone();
                async move {
                    database
                        .lock()
                        .await
                        .get_batch(&batch_id)
                        .await
                        .unwrap()
                        .map(|b| b.is_finished())
                        .unwrap_or(false)
                }
            })
            .await
        );

        let batch = fixture
            .database
            .lock()
            .await
            .get_batch(&response.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.completed_count, 3);
        assert_eq!(batch.failed_count, 1);
        assert_eq!(batch.cancelled_count, 0);
        assert_eq!(batch.pending_count + batch.running_count, 0);
        assert_eq!(batch.total_tasks, 4);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_returns_inflight_work() {
        let fixture = Fixture::new(|_| {}).await;
        let task = fixture.seed_task("alice", "000001").await;

        let stall = Arc::new(StallExecutor::new());
        let scheduler = RunningScheduler::start(&fixture, stall.clone()).await;
        fixture.submit_notify.notify_one();

        assert!(wait_for_status(&fixture, &task.task_id, TaskStatus::Running, 5).await);

        // Shutdown while the executor is stalled: the deadline passes and
        // the task goes back to the queue for the next run.
        scheduler.stop().await;

        let stored = fixture
            .database
            .lock()
            .await
            .get_task(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        let entry = fixture.queue.entry(&task.task_id).await.unwrap().unwrap();
        assert_eq!(entry.state, "ready");

        stall.release.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
