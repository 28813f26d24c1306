//! Database management for the analysis orchestration server
//!
//! This module handles SQLite operations for the three durable concerns of
//! the service: task documents, batch documents, and the task queue.
// SQLite is the single durable store for this deployment. Tasks and batches
// are the source of truth for job state; the queue table carries the
// transient scheduling state (ready lists, reservations, visibility
// deadlines). Queue operations run inside transactions on the same
// connection, which is what makes task-terminal writes and batch counter
// increments atomic from a reader's perspective.

// Sub-domain modules
mod db_batches;
mod db_queue;
mod db_tasks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::api::QueueCounters;
use shared::task::{AnalysisBatch, AnalysisTask, TaskStatus};
use std::path::{Path, PathBuf};

pub use db_queue::{NackOutcome, QueueEntry, ReclaimOutcome, Reservation};
pub use db_tasks::TaskFilter;

/// Default database file name. Using a constant avoids magic strings.
const DATABASE_FILE: &str = "analysis_tasks.db";

/// SQLite database manager for tasks, batches and the queue.
/// The `connection` field is an `Option<Connection>` to allow for lazy
/// initialization of the connection.
pub struct AnalysisDatabase {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active SQLite connection.
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
}

impl AnalysisDatabase {
    /// Create a new database manager for a given data directory.
    /// Ensures that the data directory exists, creating it if necessary.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Initialize the database by creating the necessary tables and indexes.
    /// Idempotent: uses `CREATE TABLE IF NOT EXISTS`, safe on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        tracing::info!("Initializing task database at {}", self.db_path.display());

        let conn = self.get_connection()?;
        db_tasks::create_tables(conn)?;
        db_batches::create_tables(conn)?;
        db_queue::create_tables(conn)?;

        tracing::info!("Database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection.
    /// If the connection doesn't exist, it's created and configured.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode lets streaming readers proceed while a worker or the
            // scheduler is writing.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        Ok(self.connection.as_mut().expect("connection just created"))
    }

    // ---- task operations -------------------------------------------------

    pub async fn insert_task(&mut self, task: &AnalysisTask) -> Result<()> {
        db_tasks::insert_task(self.get_connection()?, task)
    }

    /// Create a batch and all of its member tasks in one transaction, so a
    /// partially materialized batch is never observable.
    pub async fn insert_batch_with_tasks(
        &mut self,
        batch: &AnalysisBatch,
        tasks: &[AnalysisTask],
    ) -> Result<()> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        db_batches::insert_batch(&tx, batch)?;
        for task in tasks {
            db_tasks::insert_task(&tx, task)?;
        }
        tx.commit().context("Failed to commit batch creation")?;
        Ok(())
    }

    pub async fn get_task(&mut self, task_id: &str) -> Result<Option<AnalysisTask>> {
        db_tasks::get_task(self.get_connection()?, task_id)
    }

    pub async fn list_tasks(&mut self, filter: &TaskFilter) -> Result<Vec<AnalysisTask>> {
        db_tasks::list_tasks(self.get_connection()?, filter)
    }

    /// Transition a pending task to running under this worker, stamping
    /// `started_at` and defaulting the analysis date. Returns false when the
    /// task is no longer pending (terminal, cancelled, or picked up by
    /// someone else).
    pub async fn mark_task_running(&mut self, task_id: &str, worker_id: &str) -> Result<bool> {
        db_tasks::mark_running(self.get_connection()?, task_id, worker_id)
    }

    /// Lease-guarded completion: writes the report and `completed`, bumps the
    /// batch counter. Returns false when the guard matched zero rows, in
    /// which case the caller must discard its result.
    pub async fn complete_task(
        &mut self,
        task_id: &str,
        worker_id: &str,
        report: &shared::task::AnalysisReport,
    ) -> Result<bool> {
        db_tasks::complete_task(self.get_connection()?, task_id, worker_id, report)
    }

    /// Lease-guarded terminal failure with the tracker's last percent.
    pub async fn fail_task(
        &mut self,
        task_id: &str,
        worker_id: &str,
        error_message: &str,
        progress: u8,
    ) -> Result<bool> {
        db_tasks::fail_task(
            self.get_connection()?,
            task_id,
            Some(worker_id),
            error_message,
            progress,
        )
    }

    /// Terminal failure without a lease guard, used by the scheduler when a
    /// reclaimed task has exhausted its retries (no worker owns it anymore).
    pub async fn fail_task_system(&mut self, task_id: &str, error_message: &str) -> Result<bool> {
        db_tasks::fail_task(self.get_connection()?, task_id, None, error_message, 0)
    }

    /// Lease-guarded cancellation on the worker's terminal path.
    pub async fn cancel_task_from_worker(
        &mut self,
        task_id: &str,
        worker_id: &str,
    ) -> Result<bool> {
        db_tasks::cancel_task(self.get_connection()?, task_id, Some(worker_id))
    }

    /// Cancel a task on behalf of its owner. Returns whether a state change
    /// occurred (false when the task was already terminal or unknown).
    pub async fn cancel_task(&mut self, task_id: &str) -> Result<bool> {
        db_tasks::cancel_task(self.get_connection()?, task_id, None)
    }

    /// Return a reserved/running task to `pending` after a retryable failure
    /// or a reclaim, clearing the reservation owner and resetting progress.
    /// `worker_id` keeps the worker path lease-guarded; the reclaim path
    /// passes `None`.
    pub async fn revert_task_to_pending(
        &mut self,
        task_id: &str,
        worker_id: Option<&str>,
        retry_count: u32,
    ) -> Result<bool> {
        db_tasks::revert_to_pending(self.get_connection()?, task_id, worker_id, retry_count)
    }

    pub async fn get_batch(&mut self, batch_id: &str) -> Result<Option<AnalysisBatch>> {
        db_batches::get_batch(self.get_connection()?, batch_id)
    }

    // ---- queue operations ------------------------------------------------

    /// Enqueue a task. Idempotent by task id: a task already queued or
    /// reserved is absorbed as a no-op.
    pub async fn queue_enqueue(&mut self, user_id: &str, task_id: &str) -> Result<bool> {
        db_queue::enqueue(self.get_connection()?, user_id, task_id)
    }

    /// Reserve up to `max` ready tasks for `worker_id` under the admission
    /// caps, round-robin across users.
    pub async fn queue_reserve(
        &mut self,
        worker_id: &str,
        max: usize,
        visibility_timeout_secs: u64,
        global_cap: usize,
        per_user_cap: usize,
    ) -> Result<Vec<Reservation>> {
        db_queue::reserve(
            self.get_connection()?,
            worker_id,
            max,
            visibility_timeout_secs,
            global_cap,
            per_user_cap,
        )
    }

    /// Extend a reservation's visibility deadline. Returns false when the
    /// lease is no longer held by `worker_id`.
    pub async fn queue_renew(
        &mut self,
        task_id: &str,
        worker_id: &str,
        visibility_timeout_secs: u64,
    ) -> Result<bool> {
        db_queue::renew(
            self.get_connection()?,
            task_id,
            worker_id,
            visibility_timeout_secs,
        )
    }

    /// Acknowledge a finished reservation. Returns false on a lost lease.
    pub async fn queue_ack(&mut self, task_id: &str, worker_id: &str) -> Result<bool> {
        db_queue::ack(self.get_connection()?, task_id, worker_id)
    }

    /// Negative-acknowledge a reservation, optionally re-queueing with
    /// backoff. See [`NackOutcome`].
    pub async fn queue_nack(
        &mut self,
        task_id: &str,
        worker_id: &str,
        retryable: bool,
        max_retries: u32,
        backoff_base_secs: u64,
        backoff_cap_secs: u64,
    ) -> Result<NackOutcome> {
        db_queue::nack(
            self.get_connection()?,
            task_id,
            worker_id,
            retryable,
            max_retries,
            backoff_base_secs,
            backoff_cap_secs,
        )
    }

    /// Remove a task from the queue regardless of owner (cancellation path).
    pub async fn queue_remove(&mut self, task_id: &str) -> Result<bool> {
        db_queue::remove(self.get_connection()?, task_id)
    }

    /// Re-queue every reservation whose visibility deadline has passed.
    pub async fn queue_reclaim_expired(
        &mut self,
        max_retries: u32,
        backoff_base_secs: u64,
        backoff_cap_secs: u64,
    ) -> Result<ReclaimOutcome> {
        db_queue::reclaim_expired(
            self.get_connection()?,
            max_retries,
            backoff_base_secs,
            backoff_cap_secs,
        )
    }

    pub async fn queue_stats(&mut self) -> Result<QueueCounters> {
        db_queue::stats(self.get_connection()?)
    }

    /// Number of reservations currently held by `worker_id`.
    pub async fn queue_inflight_for(&mut self, worker_id: &str) -> Result<u64> {
        db_queue::inflight_for(self.get_connection()?, worker_id)
    }

    /// Look up a queue entry, mostly for diagnostics and tests.
    pub async fn queue_get_entry(&mut self, task_id: &str) -> Result<Option<QueueEntry>> {
        db_queue::get_entry(self.get_connection()?, task_id)
    }

    /// Count tasks in a given status for one user, used to verify admission
    /// behaviour and by the system status endpoint.
    pub async fn count_tasks_in_status(
        &mut self,
        user_id: &str,
        status: TaskStatus,
    ) -> Result<u64> {
        db_tasks::count_in_status(self.get_connection()?, user_id, status)
    }
}
