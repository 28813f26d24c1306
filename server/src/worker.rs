//! Worker: executes one reserved task end-to-end
//!
//! A worker owns exactly one reservation. It transitions the task to
//! running, keeps the lease alive with heartbeats, runs the blocking
//! analysis executor on a dedicated thread, and finishes on one of the
//! terminal paths: completion, classified failure, cancellation, retryable
//! requeue, or silent abandonment after a lost lease.
// Every store write on the worker paths is lease-guarded (worker_id = self
// and non-terminal status). A write that matches zero rows means somebody
// else owns the task now; the worker discards its result and logs. That is
// the whole defence against orphaned updates.

use crate::cache::LiveCache;
use crate::database::{AnalysisDatabase, NackOutcome, Reservation};
use crate::executor::{AnalysisExecutor, ExecutorError, Interrupted, ProgressSink};
use crate::queue::{QueueError, TaskQueue};
use shared::config::ServiceConfig;
use shared::progress::ProgressTracker;
use shared::task::AnalysisReport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Attempts for durable-store writes before the worker gives up and leaves
/// the task to reclaim.
const STORE_WRITE_ATTEMPTS: u32 = 3;

/// Retry a durable-store write a few times with short backoff. `None` means
/// the store stayed unavailable: the caller must not ack, so the lease
/// expires and reclaim retries the task. Infrastructure trouble never turns
/// into a terminal `failed`.
///
/// A macro rather than a generic fn: the write expression borrows data from
/// the caller's stack frame (e.g. `report`), and a generic `for<'a> FnMut(&'a
/// mut AnalysisDatabase) -> BoxFuture<'a, _>` closure bound can't express
/// "lives at least as long as the call, not necessarily 'static" (see
/// rust-lang/rust#70263). Expanding inline keeps the borrow checker looking
/// at concrete, non-higher-ranked lifetimes.
macro_rules! persist_with_retry {
    ($ctx:expr, $task_id:expr, $operation:expr, $db:ident => $write:expr) => {{
        let mut __persist_result = None;
        for attempt in 1..=STORE_WRITE_ATTEMPTS {
            let result = {
                let mut $db = $ctx.database.lock().await;
                $write.await
            };
            match result {
                Ok(changed) => {
                    __persist_result = Some(changed);
                    break;
                }
                Err(e) => {
                    warn!(
                        task_id = %$task_id,
                        operation = $operation,
                        attempt = attempt,
                        error = %e,
                        "Store write failed"
                    );
                    if attempt < STORE_WRITE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    }
                }
            }
        }
        if __persist_result.is_none() {
            error!(
                task_id = %$task_id,
                operation = $operation,
                "Store unavailable, leaving task to reclaim"
            );
        }
        __persist_result
    }};
}

/// How one worker run ended, reported back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed,
    Cancelled,
    /// Transient failure; the task is back on the ready list
    Requeued,
    /// The task was already terminal (or owned by someone else) at pickup
    Skipped,
    /// Heartbeat renewal failed; all writes were abandoned
    LeaseLost,
    /// The durable store stayed unavailable; no ack, reclaim will retry
    Abandoned,
}

/// Completion message sent to the scheduler to free the worker slot.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub task_id: String,
    pub outcome: WorkerOutcome,
}

/// Shared handles a worker needs; cheap to clone per reservation.
#[derive(Clone)]
pub struct WorkerContext {
    pub database: Arc<Mutex<AnalysisDatabase>>,
    pub queue: TaskQueue,
    pub cache: LiveCache,
    pub executor: Arc<dyn AnalysisExecutor>,
    pub config: Arc<ServiceConfig>,
    /// Reservation owner identity, shared by all workers on this node
    pub node_id: String,
    pub events: mpsc::Sender<WorkerEvent>,
}

/// Spawn a worker for one reservation. The completion event is sent in
/// every case, including internal errors.
pub fn spawn(ctx: WorkerContext, reservation: Reservation) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = reservation.task_id.clone();
        let outcome = match run(&ctx, reservation).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Worker run failed");
                WorkerOutcome::Abandoned
            }
        };
        if ctx
            .events
            .send(WorkerEvent {
                task_id: task_id.clone(),
                outcome,
            })
            .await
            .is_err()
        {
            debug!(task_id = %task_id, "Scheduler gone, dropping completion event");
        }
    })
}

async fn run(ctx: &WorkerContext, reservation: Reservation) -> anyhow::Result<WorkerOutcome> {
    let task_id = reservation.task_id.as_str();

    // Load the authoritative task state.
    let task = ctx.database.lock().await.get_task(task_id).await?;
    let Some(task) = task else {
        warn!(task_id = %task_id, "Reserved task missing from store, dropping from queue");
        let _ = ctx.queue.remove(task_id).await;
        return Ok(WorkerOutcome::Skipped);
    };

    // Reclaim short-circuit: a task that finished (or was cancelled) under a
    // previous lease is acked away without touching the executor.
    if task.status.is_terminal() {
        debug!(task_id = %task_id, status = task.status.as_str(), "Task already terminal, acking");
        let _ = ctx.queue.ack(task_id, &ctx.node_id).await;
        return Ok(WorkerOutcome::Skipped);
    }
    if ctx.cache.is_cancelled(task_id) {
        ctx.database.lock().await.cancel_task(task_id).await?;
        let _ = ctx.queue.ack(task_id, &ctx.node_id).await;
        info!(task_id = %task_id, "Cancelled before execution");
        return Ok(WorkerOutcome::Cancelled);
    }

    // Pending -> running, stamped with this node as the reservation owner.
    let became_running = ctx
        .database
        .lock()
        .await
        .mark_task_running(task_id, &ctx.node_id)
        .await?;
    if !became_running {
        let _ = ctx.queue.ack(task_id, &ctx.node_id).await;
        return Ok(WorkerOutcome::Skipped);
    }

    info!(
        task_id = %task_id,
        stock_code = %task.stock_code,
        attempt = reservation.retry_count + 1,
        "Executing analysis task"
    );

    let interrupt = Arc::new(AtomicBool::new(false));
    let baseline = ctx
        .config
        .depth_estimates
        .for_depth(task.parameters.research_depth);
    let sink = Arc::new(WorkerProgress::new(
        task_id,
        baseline,
        ctx.cache.clone(),
        interrupt.clone(),
        Duration::from_millis(ctx.config.progress_write_interval_ms),
    ));
    sink.publish();

    // Heartbeat keeps the lease alive at V/3. Losing it flips both flags:
    // the executor gets interrupted at its next checkpoint and the worker
    // abandons every further write.
    let lease_lost = Arc::new(AtomicBool::new(false));
    let heartbeat = {
        let queue = ctx.queue.clone();
        let node_id = ctx.node_id.clone();
        let task_id = task_id.to_string();
        let interrupt = interrupt.clone();
        let lease_lost = lease_lost.clone();
        let period = Duration::from_secs(ctx.config.heartbeat_interval_secs());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match queue.renew(&task_id, &node_id).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost) => {
                        warn!(task_id = %task_id, "Lease lost, abandoning task");
                        lease_lost.store(true, Ordering::SeqCst);
                        interrupt.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(QueueError::Storage(e)) => {
                        // A hiccup is survivable; the lease covers three beats.
                        warn!(task_id = %task_id, error = %e, "Heartbeat renewal failed");
                    }
                }
            }
        })
    };

    // The executor is blocking by contract; it gets its own thread and races
    // the per-depth wall-clock timeout.
    let timeout = Duration::from_secs(
        ctx.config
            .analysis_timeout_secs(task.parameters.research_depth),
    );
    let execution = {
        let executor = ctx.executor.clone();
        let task = task.clone();
        let sink = sink.clone();
        tokio::task::spawn_blocking(move || executor.execute(&task, &*sink))
    };

    let exec_result = tokio::select! {
        joined = execution => match joined {
            Ok(result) => result,
            Err(join_error) => Err(ExecutorError::Permanent(format!(
                "analysis thread panicked: {}",
                join_error
            ))),
        },
        _ = tokio::time::sleep(timeout) => {
            interrupt.store(true, Ordering::SeqCst);
            Err(ExecutorError::Permanent(format!(
                "timeout: analysis exceeded {}s",
                timeout.as_secs()
            )))
        }
    };

    heartbeat.abort();

    if lease_lost.load(Ordering::SeqCst) {
        // Another worker owns the task now; exit silently.
        return Ok(WorkerOutcome::LeaseLost);
    }

    match exec_result {
        Ok(report) => finish_completed(ctx, task_id, &sink, report).await,
        Err(ExecutorError::Cancelled) => finish_cancelled(ctx, task_id, &sink).await,
        Err(ExecutorError::Transient(message)) => {
            finish_transient(ctx, task_id, &sink, &reservation, &message).await
        }
        Err(ExecutorError::Permanent(message)) => {
            finish_failed(ctx, task_id, &sink, &message).await
        }
    }
}

async fn finish_completed(
    ctx: &WorkerContext,
    task_id: &str,
    sink: &WorkerProgress,
    report: AnalysisReport,
) -> anyhow::Result<WorkerOutcome> {
    let persisted =
        persist_with_retry!(ctx, task_id, "completion", db => db.complete_task(task_id, &ctx.node_id, &report));

    match persisted {
        Some(true) => {
            sink.mark_completed("Analysis complete");
            let _ = ctx.queue.ack(task_id, &ctx.node_id).await;
            info!(task_id = %task_id, "Task completed");
            Ok(WorkerOutcome::Completed)
        }
        Some(false) => {
            // The lease guard matched zero rows: cancelled or re-owned
            // concurrently. The result is discarded.
            warn!(task_id = %task_id, "Completion discarded, task no longer owned");
            let _ = ctx.queue.ack(task_id, &ctx.node_id).await;
            Ok(WorkerOutcome::Skipped)
        }
        None => Ok(WorkerOutcome::Abandoned),
    }
}

async fn finish_cancelled(
    ctx: &WorkerContext,
    task_id: &str,
    sink: &WorkerProgress,
) -> anyhow::Result<WorkerOutcome> {
    sink.mark_cancelled("Analysis cancelled");

    let persisted =
        persist_with_retry!(ctx, task_id, "cancellation", db => db.cancel_task_from_worker(task_id, &ctx.node_id));

    match persisted {
        Some(_) => {
            let _ = ctx.queue.nack(task_id, &ctx.node_id, false).await;
            info!(task_id = %task_id, "Task cancelled during execution");
            Ok(WorkerOutcome::Cancelled)
        }
        None => Ok(WorkerOutcome::Abandoned),
    }
}

async fn finish_transient(
    ctx: &WorkerContext,
    task_id: &str,
    sink: &WorkerProgress,
    reservation: &Reservation,
    message: &str,
) -> anyhow::Result<WorkerOutcome> {
    sink.mark_failed(message);

    // Revert the store row before the queue nack so the task can never be
    // re-reserved while it still looks running.
    let reverted = ctx
        .database
        .lock()
        .await
        .revert_task_to_pending(task_id, Some(&ctx.node_id), reservation.retry_count + 1)
        .await?;
    if !reverted {
        warn!(task_id = %task_id, "Retry revert discarded, task no longer owned");
        let _ = ctx.queue.ack(task_id, &ctx.node_id).await;
        return Ok(WorkerOutcome::Skipped);
    }

    match ctx.queue.nack(task_id, &ctx.node_id, true).await {
        Ok(NackOutcome::Requeued {
            retry_count,
            not_before_ms: _,
        }) => {
            info!(
                task_id = %task_id,
                retry = retry_count,
                error = %message,
                "Transient failure, task requeued"
            );
            Ok(WorkerOutcome::Requeued)
        }
        Ok(NackOutcome::NotRequeued { retry_count }) => {
            let reason = format!("{} ({} retries exhausted)", message, retry_count);
            ctx.database
                .lock()
                .await
                .fail_task_system(task_id, &reason)
                .await?;
            warn!(task_id = %task_id, error = %message, "Retries exhausted, task failed");
            Ok(WorkerOutcome::Failed)
        }
        Ok(NackOutcome::LeaseLost) | Err(QueueError::LeaseLost) => Ok(WorkerOutcome::LeaseLost),
        Err(QueueError::Storage(e)) => Err(e),
    }
}

async fn finish_failed(
    ctx: &WorkerContext,
    task_id: &str,
    sink: &WorkerProgress,
    message: &str,
) -> anyhow::Result<WorkerOutcome> {
    sink.mark_failed(message);

    let progress = sink.progress();
    let persisted =
        persist_with_retry!(ctx, task_id, "failure", db => db.fail_task(task_id, &ctx.node_id, message, progress));

    match persisted {
        Some(true) => {
            let _ = ctx.queue.nack(task_id, &ctx.node_id, false).await;
            warn!(task_id = %task_id, error = %message, "Task failed");
            Ok(WorkerOutcome::Failed)
        }
        Some(false) => {
            warn!(task_id = %task_id, "Failure write discarded, task no longer owned");
            let _ = ctx.queue.ack(task_id, &ctx.node_id).await;
            Ok(WorkerOutcome::Skipped)
        }
        None => Ok(WorkerOutcome::Abandoned),
    }
}


/// Progress sink for one reservation: forwards updates to the tracker,
/// publishes rate-limited snapshots to the live cache, and raises the
/// cooperative interrupt once the cancel flag or a lease loss is observed.
pub struct WorkerProgress {
    task_id: String,
    tracker: StdMutex<ProgressTracker>,
    cache: LiveCache,
    interrupt: Arc<AtomicBool>,
    min_write_interval: Duration,
    last_write: StdMutex<Option<Instant>>,
}

impl WorkerProgress {
    pub fn new(
        task_id: &str,
        baseline_estimate_secs: u64,
        cache: LiveCache,
        interrupt: Arc<AtomicBool>,
        min_write_interval: Duration,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            tracker: StdMutex::new(ProgressTracker::new(task_id, baseline_estimate_secs)),
            cache,
            interrupt,
            min_write_interval,
            last_write: StdMutex::new(None),
        }
    }

    /// Publish the current tracker snapshot unconditionally.
    pub fn publish(&self) {
        let snapshot = lock_unpoisoned(&self.tracker).snapshot();
        self.cache.write_progress(snapshot);
        *lock_unpoisoned(&self.last_write) = Some(Instant::now());
    }

    pub fn progress(&self) -> u8 {
        lock_unpoisoned(&self.tracker).progress()
    }

    pub fn mark_completed(&self, message: &str) {
        lock_unpoisoned(&self.tracker).mark_completed(message);
        self.publish();
    }

    pub fn mark_failed(&self, message: &str) {
        lock_unpoisoned(&self.tracker).mark_failed(message);
        self.publish();
    }

    pub fn mark_cancelled(&self, message: &str) {
        lock_unpoisoned(&self.tracker).mark_cancelled(message);
        self.publish();
    }
}

impl ProgressSink for WorkerProgress {
    fn update(&self, message: &str) -> Result<(), Interrupted> {
        if self.interrupt.load(Ordering::SeqCst) || self.cache.is_cancelled(&self.task_id) {
            return Err(Interrupted);
        }

        let (snapshot, advanced) = {
            let mut tracker = lock_unpoisoned(&self.tracker);
            let before = tracker.progress();
            tracker.update(message);
            (tracker.snapshot(), tracker.progress() > before)
        };

        // Cache writes are bounded: publish when the percent moved or the
        // write interval elapsed, and never fail the executor over it.
        let should_write = advanced || {
            let last_write = *lock_unpoisoned(&self.last_write);
            last_write
                .map(|at| at.elapsed() >= self.min_write_interval)
                .unwrap_or(true)
        };
        if should_write {
            self.cache.write_progress(snapshot);
            *lock_unpoisoned(&self.last_write) = Some(Instant::now());
        }

        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
