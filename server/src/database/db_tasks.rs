//! Task document persistence
//!
//! CRUD over the `analysis_tasks` table plus the guarded status transitions
//! that enforce the task state machine. Terminal statuses are write-once;
//! worker-side writes are additionally conditioned on the reservation owner
//! so a worker that lost its lease can never overwrite fresher state (its
//! update matches zero rows and the caller discards the result).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::task::{AnalysisReport, AnalysisTask, TaskStatus};
use tracing::{debug, info};

/// Filters and paging for task listings.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub user_id: String,
    pub status: Option<TaskStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl TaskFilter {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Create task table and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_tasks (
            task_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            batch_id TEXT,
            stock_code TEXT NOT NULL,
            parameters TEXT NOT NULL,

            status TEXT NOT NULL DEFAULT 'pending',
            progress INTEGER NOT NULL DEFAULT 0,
            current_step TEXT NOT NULL DEFAULT '',
            message TEXT NOT NULL DEFAULT '',

            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            last_update INTEGER NOT NULL,

            result TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            worker_id TEXT
        )
        "#,
        [],
    )
    .context("Failed to create analysis_tasks table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_user_status
         ON analysis_tasks(user_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_batch ON analysis_tasks(batch_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_created ON analysis_tasks(created_at)",
        [],
    )?;

    info!("Task table created");
    Ok(())
}

/// Insert a freshly created task document.
pub fn insert_task(conn: &Connection, task: &AnalysisTask) -> Result<()> {
    let parameters = serde_json::to_string(&task.parameters)
        .context("Failed to serialize analysis parameters")?;
    let result = task
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize analysis report")?;

    conn.execute(
        r#"
        INSERT INTO analysis_tasks (
            task_id, user_id, batch_id, stock_code, parameters,
            status, progress, current_step, message,
            created_at, started_at, completed_at, last_update,
            result, error_message, retry_count, worker_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
        params![
            task.task_id,
            task.user_id,
            task.batch_id,
            task.stock_code,
            parameters,
            task.status.as_str(),
            task.progress as i64,
            task.current_step,
            task.message,
            task.created_at.timestamp_millis(),
            task.started_at.map(|t| t.timestamp_millis()),
            task.completed_at.map(|t| t.timestamp_millis()),
            task.last_update.timestamp_millis(),
            result,
            task.error_message,
            task.retry_count as i64,
            task.worker_id,
        ],
    )
    .with_context(|| format!("Failed to insert task {}", task.task_id))?;

    debug!(task_id = %task.task_id, stock_code = %task.stock_code, "Created task");
    Ok(())
}

/// Load one task by id.
pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<AnalysisTask>> {
    let task = conn
        .query_row(
            &format!("SELECT {} FROM analysis_tasks WHERE task_id = ?1", COLUMNS),
            params![task_id],
            parse_task_row,
        )
        .optional()
        .with_context(|| format!("Failed to load task {}", task_id))?;
    Ok(task)
}

/// List a user's tasks, newest first, with optional status filter and paging.
pub fn list_tasks(conn: &Connection, filter: &TaskFilter) -> Result<Vec<AnalysisTask>> {
    let limit = filter.limit.max(1) as i64;
    let offset = filter.offset as i64;

    let tasks = match filter.status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM analysis_tasks
                 WHERE user_id = ?1 AND status = ?2
                 ORDER BY created_at DESC, task_id LIMIT ?3 OFFSET ?4",
                COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![filter.user_id, status.as_str(), limit, offset],
                parse_task_row,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM analysis_tasks
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, task_id LIMIT ?2 OFFSET ?3",
                COLUMNS
            ))?;
            let rows = stmt.query_map(params![filter.user_id, limit, offset], parse_task_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(tasks)
}

/// Transition a pending task to running under `worker_id`.
///
/// Stamps `started_at`, records the reservation owner, and fills the
/// analysis date with today when the submission left it open. Returns false
/// when the task is not pending anymore.
pub fn mark_running(conn: &mut Connection, task_id: &str, worker_id: &str) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let tx = conn.transaction()?;

    let row: Option<(String, String)> = tx
        .query_row(
            "SELECT status, parameters FROM analysis_tasks WHERE task_id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (status, raw_parameters) = match row {
        Some(found) => found,
        None => {
            tx.commit()?;
            return Ok(false);
        }
    };
    if status != TaskStatus::Pending.as_str() {
        tx.commit()?;
        return Ok(false);
    }

    let mut parameters: shared::task::AnalysisParameters = serde_json::from_str(&raw_parameters)
        .with_context(|| format!("Corrupt parameters for task {}", task_id))?;
    if parameters.analysis_date.is_none() {
        parameters.analysis_date = Some(Utc::now().format("%Y-%m-%d").to_string());
    }
    let parameters =
        serde_json::to_string(&parameters).context("Failed to serialize analysis parameters")?;

    let changed = tx.execute(
        "UPDATE analysis_tasks
         SET status = 'running', worker_id = ?1, parameters = ?2,
             started_at = ?3, last_update = ?3
         WHERE task_id = ?4 AND status = 'pending'",
        params![worker_id, parameters, now, task_id],
    )?;

    tx.commit().context("Failed to commit running transition")?;
    Ok(changed > 0)
}

/// Lease-guarded completion: write the report, mark `completed`, and bump
/// the batch counter in the same transaction.
pub fn complete_task(
    conn: &mut Connection,
    task_id: &str,
    worker_id: &str,
    report: &AnalysisReport,
) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let result = serde_json::to_string(report).context("Failed to serialize analysis report")?;
    let tx = conn.transaction()?;

    let changed = tx.execute(
        "UPDATE analysis_tasks
         SET status = 'completed', progress = 100, result = ?1,
             completed_at = ?2, last_update = ?2, worker_id = NULL,
             error_message = NULL
         WHERE task_id = ?3 AND worker_id = ?4 AND status IN ('pending', 'running')",
        params![result, now, task_id, worker_id],
    )?;

    if changed > 0 {
        bump_batch_counter_for(&tx, task_id, TaskStatus::Completed)?;
    }

    tx.commit().context("Failed to commit completion")?;
    Ok(changed > 0)
}

/// Record a terminal failure.
///
/// With `worker_id` set this is the lease-guarded worker path and also
/// persists the last observed progress percent; without it, the guard is
/// only "not terminal yet" (scheduler path for retries-exhausted tasks).
pub fn fail_task(
    conn: &mut Connection,
    task_id: &str,
    worker_id: Option<&str>,
    error_message: &str,
    progress: u8,
) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let tx = conn.transaction()?;

    let changed = match worker_id {
        Some(worker) => tx.execute(
            "UPDATE analysis_tasks
             SET status = 'failed', error_message = ?1, progress = ?2,
                 completed_at = ?3, last_update = ?3, worker_id = NULL
             WHERE task_id = ?4 AND worker_id = ?5 AND status IN ('pending', 'running')",
            params![error_message, progress as i64, now, task_id, worker],
        )?,
        None => tx.execute(
            "UPDATE analysis_tasks
             SET status = 'failed', error_message = ?1,
                 completed_at = ?2, last_update = ?2, worker_id = NULL
             WHERE task_id = ?3 AND status IN ('pending', 'running')",
            params![error_message, now, task_id],
        )?,
    };

    if changed > 0 {
        bump_batch_counter_for(&tx, task_id, TaskStatus::Failed)?;
    }

    tx.commit().context("Failed to commit failure")?;
    Ok(changed > 0)
}

/// Set a task to `cancelled` if it is not terminal yet.
///
/// `worker_id` selects the lease-guarded worker path; `None` is the
/// owner-initiated path, which may cancel a task in any non-terminal state.
/// Returns whether a state change occurred.
pub fn cancel_task(conn: &mut Connection, task_id: &str, worker_id: Option<&str>) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let tx = conn.transaction()?;

    let changed = match worker_id {
        Some(worker) => tx.execute(
            "UPDATE analysis_tasks
             SET status = 'cancelled', completed_at = ?1, last_update = ?1, worker_id = NULL
             WHERE task_id = ?2 AND worker_id = ?3 AND status IN ('pending', 'running')",
            params![now, task_id, worker],
        )?,
        None => tx.execute(
            "UPDATE analysis_tasks
             SET status = 'cancelled', completed_at = ?1, last_update = ?1, worker_id = NULL
             WHERE task_id = ?2 AND status IN ('pending', 'running')",
            params![now, task_id],
        )?,
    };

    if changed > 0 {
        bump_batch_counter_for(&tx, task_id, TaskStatus::Cancelled)?;
        debug!(task_id = %task_id, "Task cancelled");
    }

    tx.commit().context("Failed to commit cancellation")?;
    Ok(changed > 0)
}

/// Return a task to `pending` after a retryable failure or a reclaim.
///
/// Clears the reservation owner and the attempt's progress; the next
/// reservation starts a fresh tracker, which is why percent may reset
/// between attempts. A worker reverting its own task passes `worker_id` so
/// the write stays lease-guarded; the scheduler's reclaim path passes `None`
/// because the lease it is cleaning up has already expired.
pub fn revert_to_pending(
    conn: &Connection,
    task_id: &str,
    worker_id: Option<&str>,
    retry_count: u32,
) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let changed = match worker_id {
        Some(worker) => conn.execute(
            "UPDATE analysis_tasks
             SET status = 'pending', worker_id = NULL, retry_count = ?1,
                 progress = 0, current_step = '', message = '',
                 started_at = NULL, last_update = ?2
             WHERE task_id = ?3 AND worker_id = ?4 AND status IN ('pending', 'running')",
            params![retry_count as i64, now, task_id, worker],
        )?,
        None => conn.execute(
            "UPDATE analysis_tasks
             SET status = 'pending', worker_id = NULL, retry_count = ?1,
                 progress = 0, current_step = '', message = '',
                 started_at = NULL, last_update = ?2
             WHERE task_id = ?3 AND status IN ('pending', 'running')",
            params![retry_count as i64, now, task_id],
        )?,
    };
    Ok(changed > 0)
}

/// Count one user's tasks in a given status.
pub fn count_in_status(conn: &Connection, user_id: &str, status: TaskStatus) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM analysis_tasks WHERE user_id = ?1 AND status = ?2",
        params![user_id, status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Bump the batch counter matching a terminal transition, when the task
/// belongs to a batch. Must run inside the transaction of the transition
/// itself.
fn bump_batch_counter_for(conn: &Connection, task_id: &str, status: TaskStatus) -> Result<()> {
    let batch_id: Option<String> = conn
        .query_row(
            "SELECT batch_id FROM analysis_tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    if let Some(batch_id) = batch_id {
        super::db_batches::bump_counter(conn, &batch_id, status)?;
    }
    Ok(())
}

const COLUMNS: &str = "task_id, user_id, batch_id, stock_code, parameters, status, progress, \
                       current_step, message, created_at, started_at, completed_at, last_update, \
                       result, error_message, retry_count, worker_id";

/// Map a task row to the document struct. JSON and timestamp conversion
/// failures surface as rusqlite conversion errors so they propagate through
/// `query_row`/`query_map` unchanged.
fn parse_task_row(row: &Row) -> rusqlite::Result<AnalysisTask> {
    let parameters: String = row.get(4)?;
    let parameters = serde_json::from_str(&parameters).map_err(json_error)?;

    let status: String = row.get(5)?;
    let status = TaskStatus::parse(&status).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;

    let result: Option<String> = row.get(13)?;
    let result = result
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(json_error)?;

    Ok(AnalysisTask {
        task_id: row.get(0)?,
        user_id: row.get(1)?,
        batch_id: row.get(2)?,
        stock_code: row.get(3)?,
        parameters,
        status,
        progress: row.get::<_, i64>(6)? as u8,
        current_step: row.get(7)?,
        message: row.get(8)?,
        created_at: millis_to_datetime(row.get(9)?),
        started_at: row.get::<_, Option<i64>>(10)?.map(millis_to_datetime),
        completed_at: row.get::<_, Option<i64>>(11)?.map(millis_to_datetime),
        last_update: millis_to_datetime(row.get(12)?),
        result,
        error_message: row.get(14)?,
        retry_count: row.get::<_, i64>(15)? as u32,
        worker_id: row.get(16)?,
    })
}

fn json_error(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::task::AnalysisParameters;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        super::super::db_batches::create_tables(&conn).unwrap();
        conn
    }

    fn sample_task(user_id: &str) -> AnalysisTask {
        AnalysisTask::new(user_id, "000001", AnalysisParameters::default())
    }

    fn sample_report() -> AnalysisReport {
        AnalysisReport {
            analysis_id: "a1".to_string(),
            summary: "steady fundamentals".to_string(),
            recommendation: "hold".to_string(),
            confidence_score: 0.7,
            risk_level: "medium".to_string(),
            key_points: vec!["stable earnings".to_string()],
            detailed_analysis: serde_json::json!({"fundamentals": "ok"}),
            execution_time_secs: 12.5,
            tokens_used: 2048,
        }
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();

        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.task_id, task.task_id);
        assert_eq!(loaded.stock_code, "000001");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.parameters, task.parameters);
        assert!(loaded.result.is_none());
    }

    #[test]
    fn test_get_missing_task() {
        let conn = test_conn();
        assert!(get_task(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn test_mark_running_stamps_started_and_date() {
        let mut conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();

        assert!(mark_running(&mut conn, &task.task_id, "node-1").unwrap());

        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.worker_id.as_deref(), Some("node-1"));
        assert!(loaded.started_at.is_some());
        assert!(loaded.parameters.analysis_date.is_some());
    }

    #[test]
    fn test_mark_running_requires_pending() {
        let mut conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();
        mark_running(&mut conn, &task.task_id, "node-1").unwrap();

        assert!(!mark_running(&mut conn, &task.task_id, "node-2").unwrap());
        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.worker_id.as_deref(), Some("node-1"));
    }

    #[test]
    fn test_mark_running_keeps_explicit_date() {
        let mut conn = test_conn();
        let mut task = sample_task("alice");
        task.parameters.analysis_date = Some("2025-06-30".to_string());
        insert_task(&conn, &task).unwrap();

        mark_running(&mut conn, &task.task_id, "node-1").unwrap();
        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.parameters.analysis_date.as_deref(), Some("2025-06-30"));
    }

    #[test]
    fn test_complete_requires_lease() {
        let mut conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();
        mark_running(&mut conn, &task.task_id, "node-1").unwrap();

        // A worker that lost its lease affects zero rows.
        assert!(!complete_task(&mut conn, &task.task_id, "node-2", &sample_report()).unwrap());

        assert!(complete_task(&mut conn, &task.task_id, "node-1", &sample_report()).unwrap());
        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.progress, 100);
        assert!(loaded.completed_at.is_some());
        assert!(loaded.worker_id.is_none());
        assert_eq!(loaded.result.unwrap().recommendation, "hold");
    }

    #[test]
    fn test_terminal_is_write_once() {
        let mut conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();
        mark_running(&mut conn, &task.task_id, "node-1").unwrap();
        complete_task(&mut conn, &task.task_id, "node-1", &sample_report()).unwrap();

        // No path may leave a terminal state.
        assert!(!fail_task(&mut conn, &task.task_id, Some("node-1"), "late", 10).unwrap());
        assert!(!fail_task(&mut conn, &task.task_id, None, "late", 0).unwrap());
        assert!(!cancel_task(&mut conn, &task.task_id, None).unwrap());
        assert!(!revert_to_pending(&conn, &task.task_id, None, 1).unwrap());

        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert!(loaded.result.is_some());
    }

    #[test]
    fn test_fail_records_error_and_progress() {
        let mut conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();
        mark_running(&mut conn, &task.task_id, "node-1").unwrap();

        assert!(fail_task(&mut conn, &task.task_id, Some("node-1"), "data source offline", 40)
            .unwrap());
        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("data source offline"));
        assert_eq!(loaded.progress, 40);
    }

    #[test]
    fn test_cancel_pending_task() {
        let mut conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();

        assert!(cancel_task(&mut conn, &task.task_id, None).unwrap());
        // Second cancel is a no-op.
        assert!(!cancel_task(&mut conn, &task.task_id, None).unwrap());
        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_revert_to_pending_clears_attempt_state() {
        let mut conn = test_conn();
        let task = sample_task("alice");
        insert_task(&conn, &task).unwrap();
        mark_running(&mut conn, &task.task_id, "node-1").unwrap();

        // The lease guard rejects a worker that does not own the task.
        assert!(!revert_to_pending(&conn, &task.task_id, Some("node-2"), 1).unwrap());

        assert!(revert_to_pending(&conn, &task.task_id, Some("node-1"), 1).unwrap());
        let loaded = get_task(&conn, &task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.worker_id.is_none());
        assert!(loaded.started_at.is_none());
        assert_eq!(loaded.progress, 0);
    }

    #[test]
    fn test_list_tasks_filters_and_pages() {
        let mut conn = test_conn();
        for _ in 0..3 {
            insert_task(&conn, &sample_task("alice")).unwrap();
        }
        insert_task(&conn, &sample_task("bob")).unwrap();

        let cancelled = sample_task("alice");
        insert_task(&conn, &cancelled).unwrap();
        cancel_task(&mut conn, &cancelled.task_id, None).unwrap();

        let all = list_tasks(&conn, &TaskFilter::for_user("alice")).unwrap();
        assert_eq!(all.len(), 4);

        let mut filter = TaskFilter::for_user("alice");
        filter.status = Some(TaskStatus::Pending);
        assert_eq!(list_tasks(&conn, &filter).unwrap().len(), 3);

        let mut page = TaskFilter::for_user("alice");
        page.limit = 2;
        page.offset = 3;
        assert_eq!(list_tasks(&conn, &page).unwrap().len(), 1);
    }

    #[test]
    fn test_count_in_status() {
        let mut conn = test_conn();
        let running = sample_task("alice");
        insert_task(&conn, &running).unwrap();
        mark_running(&mut conn, &running.task_id, "node-1").unwrap();
        insert_task(&conn, &sample_task("alice")).unwrap();

        assert_eq!(count_in_status(&conn, "alice", TaskStatus::Running).unwrap(), 1);
        assert_eq!(count_in_status(&conn, "alice", TaskStatus::Pending).unwrap(), 1);
        assert_eq!(count_in_status(&conn, "bob", TaskStatus::Running).unwrap(), 0);
    }
}
