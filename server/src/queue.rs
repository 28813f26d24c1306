//! Task queue component
//!
//! `TaskQueue` wraps the shared database handle and exposes the queue
//! semantics with typed errors: lease-guarded operations fail with
//! [`QueueError::LeaseLost`] when the caller no longer owns the reservation,
//! which is the signal for a worker to abandon all further writes.

use crate::database::{AnalysisDatabase, NackOutcome, QueueEntry, ReclaimOutcome, Reservation};
use shared::api::QueueCounters;
use shared::config::ServiceConfig;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors surfaced by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The reservation is not held by the calling worker anymore; the task
    /// belongs to someone else (or to nobody) now.
    #[error("lease lost")]
    LeaseLost,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Queue tuning knobs, snapshotted from the service configuration.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub visibility_timeout_secs: u64,
    pub global_cap: usize,
    pub per_user_cap: usize,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl QueueSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            visibility_timeout_secs: config.visibility_timeout_seconds,
            global_cap: config.max_concurrent_tasks,
            per_user_cap: config.per_user_concurrent_tasks,
            max_retries: config.max_retries,
            backoff_base_secs: config.backoff_base_seconds,
            backoff_cap_secs: config.backoff_cap_seconds,
        }
    }
}

/// Fair multi-user task queue with visibility-timeout reservations.
#[derive(Clone)]
pub struct TaskQueue {
    database: Arc<Mutex<AnalysisDatabase>>,
    settings: QueueSettings,
}

impl TaskQueue {
    pub fn new(database: Arc<Mutex<AnalysisDatabase>>, settings: QueueSettings) -> Self {
        Self { database, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Append a task to its user's ready list. Duplicates are absorbed.
    pub async fn enqueue(&self, user_id: &str, task_id: &str) -> Result<(), QueueError> {
        self.database
            .lock()
            .await
            .queue_enqueue(user_id, task_id)
            .await?;
        Ok(())
    }

    /// Reserve up to `max` admissible tasks for `worker_id`, fairly across
    /// users.
    pub async fn reserve(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<Reservation>, QueueError> {
        let reservations = self
            .database
            .lock()
            .await
            .queue_reserve(
                worker_id,
                max,
                self.settings.visibility_timeout_secs,
                self.settings.global_cap,
                self.settings.per_user_cap,
            )
            .await?;
        Ok(reservations)
    }

    /// Heartbeat: extend the visibility deadline of a held reservation.
    pub async fn renew(&self, task_id: &str, worker_id: &str) -> Result<(), QueueError> {
        let renewed = self
            .database
            .lock()
            .await
            .queue_renew(task_id, worker_id, self.settings.visibility_timeout_secs)
            .await?;
        if renewed {
            Ok(())
        } else {
            Err(QueueError::LeaseLost)
        }
    }

    /// Acknowledge a finished reservation.
    pub async fn ack(&self, task_id: &str, worker_id: &str) -> Result<(), QueueError> {
        let acked = self
            .database
            .lock()
            .await
            .queue_ack(task_id, worker_id)
            .await?;
        if acked {
            Ok(())
        } else {
            Err(QueueError::LeaseLost)
        }
    }

    /// Negative-acknowledge a reservation; see [`NackOutcome`].
    pub async fn nack(
        &self,
        task_id: &str,
        worker_id: &str,
        retryable: bool,
    ) -> Result<NackOutcome, QueueError> {
        let outcome = self
            .database
            .lock()
            .await
            .queue_nack(
                task_id,
                worker_id,
                retryable,
                self.settings.max_retries,
                self.settings.backoff_base_secs,
                self.settings.backoff_cap_secs,
            )
            .await?;
        Ok(outcome)
    }

    /// Drop a task from the queue regardless of state (cancellation path).
    pub async fn remove(&self, task_id: &str) -> Result<bool, QueueError> {
        Ok(self.database.lock().await.queue_remove(task_id).await?)
    }

    /// Return expired reservations to their ready lists.
    pub async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueError> {
        let outcome = self
            .database
            .lock()
            .await
            .queue_reclaim_expired(
                self.settings.max_retries,
                self.settings.backoff_base_secs,
                self.settings.backoff_cap_secs,
            )
            .await?;
        Ok(outcome)
    }

    pub async fn stats(&self) -> Result<QueueCounters, QueueError> {
        Ok(self.database.lock().await.queue_stats().await?)
    }

    /// Reservations currently held by `worker_id`.
    pub async fn inflight_for(&self, worker_id: &str) -> Result<u64, QueueError> {
        Ok(self
            .database
            .lock()
            .await
            .queue_inflight_for(worker_id)
            .await?)
    }

    /// Queue entry lookup for diagnostics and tests.
    pub async fn entry(&self, task_id: &str) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.database.lock().await.queue_get_entry(task_id).await?)
    }
}
