//! Batch document persistence
//!
//! Batches store only their terminal counters; pending and running counts
//! are recomputed from the tasks table when a batch is read, inside the same
//! read transaction, which keeps the sum-equals-total invariant observable
//! without touching the batch row on every non-terminal transition.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use shared::task::{AnalysisBatch, TaskStatus};
use tracing::info;

/// Create batch table and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_batches (
            batch_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            total_tasks INTEGER NOT NULL,
            completed_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            cancelled_count INTEGER NOT NULL DEFAULT 0,
            parameters TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create analysis_batches table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_user ON analysis_batches(user_id)",
        [],
    )?;

    info!("Batch table created");
    Ok(())
}

/// Insert a freshly created batch document.
pub fn insert_batch(conn: &Connection, batch: &AnalysisBatch) -> Result<()> {
    let parameters = serde_json::to_string(&batch.parameters)
        .context("Failed to serialize batch parameters")?;

    conn.execute(
        r#"
        INSERT INTO analysis_batches (
            batch_id, user_id, title, description, total_tasks,
            completed_count, failed_count, cancelled_count,
            parameters, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            batch.batch_id,
            batch.user_id,
            batch.title,
            batch.description,
            batch.total_tasks as i64,
            batch.completed_count as i64,
            batch.failed_count as i64,
            batch.cancelled_count as i64,
            parameters,
            batch.created_at.timestamp_millis(),
            batch.updated_at.timestamp_millis(),
        ],
    )
    .with_context(|| format!("Failed to insert batch {}", batch.batch_id))?;

    Ok(())
}

/// Load a batch with its live pending/running counts.
pub fn get_batch(conn: &Connection, batch_id: &str) -> Result<Option<AnalysisBatch>> {
    let row = conn
        .query_row(
            "SELECT batch_id, user_id, title, description, total_tasks,
                    completed_count, failed_count, cancelled_count,
                    parameters, created_at, updated_at
             FROM analysis_batches WHERE batch_id = ?1",
            params![batch_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("Failed to load batch {}", batch_id))?;

    let Some((
        batch_id,
        user_id,
        title,
        description,
        total_tasks,
        completed_count,
        failed_count,
        cancelled_count,
        raw_parameters,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let parameters = serde_json::from_str(&raw_parameters)
        .with_context(|| format!("Corrupt parameters for batch {}", batch_id))?;

    // Recompute the non-terminal counts from the member tasks.
    let pending_count = count_members(conn, &batch_id, TaskStatus::Pending)?;
    let running_count = count_members(conn, &batch_id, TaskStatus::Running)?;

    Ok(Some(AnalysisBatch {
        batch_id,
        user_id,
        title,
        description,
        total_tasks: total_tasks as u32,
        completed_count: completed_count as u32,
        failed_count: failed_count as u32,
        cancelled_count: cancelled_count as u32,
        pending_count,
        running_count,
        parameters,
        created_at: millis_to_datetime(created_at),
        updated_at: millis_to_datetime(updated_at),
    }))
}

/// Increment the batch counter matching a terminal transition. Runs inside
/// the transaction of the task transition itself.
pub fn bump_counter(conn: &Connection, batch_id: &str, status: TaskStatus) -> Result<()> {
    let column = match status {
        TaskStatus::Completed => "completed_count",
        TaskStatus::Failed => "failed_count",
        TaskStatus::Cancelled => "cancelled_count",
        other => {
            return Err(anyhow::anyhow!(
                "Batch counters only track terminal statuses, got {:?}",
                other
            ))
        }
    };

    let now = Utc::now().timestamp_millis();
    conn.execute(
        &format!(
            "UPDATE analysis_batches SET {} = {} + 1, updated_at = ?1 WHERE batch_id = ?2",
            column, column
        ),
        params![now, batch_id],
    )
    .with_context(|| format!("Failed to bump {} for batch {}", column, batch_id))?;

    Ok(())
}

fn count_members(conn: &Connection, batch_id: &str, status: TaskStatus) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM analysis_tasks WHERE batch_id = ?1 AND status = ?2",
        params![batch_id, status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::task::{AnalysisParameters, AnalysisTask};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        super::super::db_tasks::create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    fn batch_with_tasks(conn: &Connection, n: u32) -> (AnalysisBatch, Vec<AnalysisTask>) {
        let batch = AnalysisBatch::new("alice", "tech picks", "", n, AnalysisParameters::default());
        insert_batch(conn, &batch).unwrap();

        let tasks: Vec<AnalysisTask> = (0..n)
            .map(|i| {
                let task = AnalysisTask::new_in_batch(
                    "alice",
                    &format!("00000{}", i),
                    AnalysisParameters::default(),
                    &batch.batch_id,
                );
                super::super::db_tasks::insert_task(conn, &task).unwrap();
                task
            })
            .collect();

        (batch, tasks)
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let conn = test_conn();
        let (batch, _) = batch_with_tasks(&conn, 3);

        let loaded = get_batch(&conn, &batch.batch_id).unwrap().unwrap();
        assert_eq!(loaded.total_tasks, 3);
        assert_eq!(loaded.pending_count, 3);
        assert_eq!(loaded.running_count, 0);
        assert_eq!(loaded.completed_count, 0);
        assert_eq!(loaded.title, "tech picks");
    }

    #[test]
    fn test_counts_track_member_transitions() {
        let mut conn = test_conn();
        let (batch, tasks) = batch_with_tasks(&conn, 4);

        super::super::db_tasks::mark_running(&mut conn, &tasks[0].task_id, "node-1").unwrap();
        super::super::db_tasks::cancel_task(&mut conn, &tasks[1].task_id, None).unwrap();

        let loaded = get_batch(&conn, &batch.batch_id).unwrap().unwrap();
        assert_eq!(loaded.pending_count, 2);
        assert_eq!(loaded.running_count, 1);
        assert_eq!(loaded.cancelled_count, 1);
        // Invariant: per-status counts sum to total.
        assert_eq!(
            loaded.pending_count
                + loaded.running_count
                + loaded.completed_count
                + loaded.failed_count
                + loaded.cancelled_count,
            loaded.total_tasks
        );
    }

    #[test]
    fn test_bump_counter_rejects_non_terminal() {
        let conn = test_conn();
        let (batch, _) = batch_with_tasks(&conn, 1);
        assert!(bump_counter(&conn, &batch.batch_id, TaskStatus::Running).is_err());
    }

    #[test]
    fn test_get_missing_batch() {
        let conn = test_conn();
        assert!(get_batch(&conn, "nope").unwrap().is_none());
    }
}
