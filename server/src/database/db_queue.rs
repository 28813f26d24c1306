//! Task queue with visibility-timeout reservations
//!
//! This module implements the distributed-queue semantics over SQLite: FIFO
//! ready lists per user, an inflight set with per-reservation deadlines,
//! retry accounting with exponential backoff, and a persisted round-robin
//! cursor for fairness across users. Every operation that touches more than
//! one row runs inside a transaction, so queue state is serializable per
//! task and per user.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::api::QueueCounters;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// A reservation handed to a worker by `reserve`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub task_id: String,
    pub user_id: String,
    /// Retries already consumed before this attempt
    pub retry_count: u32,
    /// Visibility deadline (Unix milliseconds)
    pub deadline_ms: i64,
}

/// Outcome of a negative acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Back on the ready list, not served before `not_before_ms`
    Requeued { retry_count: u32, not_before_ms: i64 },
    /// Removed from the queue; the caller records the terminal failure
    NotRequeued { retry_count: u32 },
    /// The reservation is no longer held by the calling worker
    LeaseLost,
}

/// Outcome of a reclaim sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimOutcome {
    /// Tasks returned to their users' ready lists
    pub requeued: Vec<String>,
    /// Tasks dropped from the queue because their retries are exhausted;
    /// the scheduler records the terminal failure
    pub exhausted: Vec<String>,
}

/// One queue row, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub task_id: String,
    pub user_id: String,
    pub state: String,
    pub enqueued_at_ms: i64,
    pub not_before_ms: i64,
    pub reserved_by: Option<String>,
    pub deadline_ms: Option<i64>,
    pub retry_count: u32,
}

/// Create queue tables and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_queue (
            -- rowid doubles as the FIFO position; re-enqueueing deletes and
            -- re-inserts so retried tasks land at the tail
            id INTEGER PRIMARY KEY AUTOINCREMENT,

            task_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'ready',

            enqueued_at INTEGER NOT NULL,
            not_before INTEGER NOT NULL DEFAULT 0,

            -- Reservation bookkeeping, NULL while ready
            reserved_by TEXT,
            reserved_at INTEGER,
            deadline INTEGER,

            retry_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )
    .context("Failed to create task_queue table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queue_ready
         ON task_queue(state, user_id, not_before)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queue_deadline
         ON task_queue(state, deadline)",
        [],
    )?;

    // Single-row key/value table holding the fairness cursor
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS queue_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create queue_state table")?;

    info!("Task queue tables created");
    Ok(())
}

/// Append a task to its user's ready list.
///
/// Idempotent by task id: if the task is already ready or inflight the call
/// is absorbed and returns false.
pub fn enqueue(conn: &Connection, user_id: &str, task_id: &str) -> Result<bool> {
    let now = now_millis();
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO task_queue (task_id, user_id, state, enqueued_at, not_before, retry_count)
        VALUES (?1, ?2, 'ready', ?3, 0, 0)
        "#,
        params![task_id, user_id, now],
    )?;

    if inserted > 0 {
        debug!(task_id = %task_id, user_id = %user_id, "Enqueued task");
    } else {
        debug!(task_id = %task_id, "Duplicate enqueue absorbed");
    }

    Ok(inserted > 0)
}

/// Reserve up to `max` tasks for `worker_id`.
///
/// Admission predicate per candidate user `u`: `global_inflight < G` and
/// `inflight(u) < U`. User selection is round-robin over users with eligible
/// ready work, starting after the persisted cursor; within a user, strict
/// FIFO by queue position. Returns an empty vector when nothing is
/// admissible.
pub fn reserve(
    conn: &mut Connection,
    worker_id: &str,
    max: usize,
    visibility_timeout_secs: u64,
    global_cap: usize,
    per_user_cap: usize,
) -> Result<Vec<Reservation>> {
    let mut reservations = Vec::new();
    if max == 0 {
        return Ok(reservations);
    }

    let now = now_millis();
    let deadline = now + (visibility_timeout_secs as i64) * 1000;
    let tx = conn.transaction()?;

    {
        let mut global_inflight: usize = tx.query_row(
            "SELECT COUNT(*) FROM task_queue WHERE state = 'inflight'",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;

        if global_inflight >= global_cap {
            tx.commit()?;
            return Ok(reservations);
        }

        // Users with at least one eligible ready task, in stable order. The
        // rotation point comes from the persisted cursor so fairness
        // survives restarts.
        let users: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT user_id FROM task_queue
                 WHERE state = 'ready' AND not_before <= ?1
                 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![now], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        if users.is_empty() {
            tx.commit()?;
            return Ok(reservations);
        }

        let cursor: Option<String> = tx
            .query_row(
                "SELECT value FROM queue_state WHERE key = 'cursor'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let start = match &cursor {
            Some(last) => users.iter().position(|u| u.as_str() > last.as_str()),
            None => None,
        }
        .unwrap_or(0);

        let rotated: Vec<&String> = users[start..].iter().chain(users[..start].iter()).collect();

        let mut user_inflight: HashMap<&String, usize> = HashMap::new();
        for user in &rotated {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM task_queue WHERE state = 'inflight' AND user_id = ?1",
                params![user.as_str()],
                |row| row.get(0),
            )?;
            user_inflight.insert(*user, count as usize);
        }

        let mut drained: HashSet<&String> = HashSet::new();
        let mut last_served: Option<String> = None;

        // One reservation per user per pass; repeat passes until the budget
        // is spent or no user can supply another task.
        'outer: loop {
            let mut progressed = false;

            for user in &rotated {
                if reservations.len() >= max || global_inflight >= global_cap {
                    break 'outer;
                }
                if drained.contains(*user) {
                    continue;
                }
                if user_inflight[*user] >= per_user_cap {
                    drained.insert(*user);
                    continue;
                }

                let head: Option<(i64, String, u32)> = tx
                    .query_row(
                        "SELECT id, task_id, retry_count FROM task_queue
                         WHERE state = 'ready' AND user_id = ?1 AND not_before <= ?2
                         ORDER BY id LIMIT 1",
                        params![user.as_str(), now],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;

                match head {
                    None => {
                        drained.insert(*user);
                    }
                    Some((id, task_id, retry_count)) => {
                        tx.execute(
                            "UPDATE task_queue
                             SET state = 'inflight', reserved_by = ?1, reserved_at = ?2, deadline = ?3
                             WHERE id = ?4",
                            params![worker_id, now, deadline, id],
                        )?;

                        reservations.push(Reservation {
                            task_id,
                            user_id: (*user).clone(),
                            retry_count,
                            deadline_ms: deadline,
                        });
                        *user_inflight.get_mut(*user).expect("user counted above") += 1;
                        global_inflight += 1;
                        last_served = Some((*user).clone());
                        progressed = true;
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        if let Some(user) = last_served {
            tx.execute(
                "INSERT INTO queue_state (key, value) VALUES ('cursor', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![user],
            )?;
        }
    }

    tx.commit().context("Failed to commit reservations")?;

    if !reservations.is_empty() {
        debug!(
            worker_id = %worker_id,
            count = reservations.len(),
            "Reserved tasks"
        );
    }

    Ok(reservations)
}

/// Extend the visibility deadline of a held reservation.
/// Returns false when the lease is not held by `worker_id` anymore.
pub fn renew(
    conn: &Connection,
    task_id: &str,
    worker_id: &str,
    visibility_timeout_secs: u64,
) -> Result<bool> {
    let deadline = now_millis() + (visibility_timeout_secs as i64) * 1000;
    let changed = conn.execute(
        "UPDATE task_queue SET deadline = ?1
         WHERE task_id = ?2 AND state = 'inflight' AND reserved_by = ?3",
        params![deadline, task_id, worker_id],
    )?;
    Ok(changed > 0)
}

/// Remove a finished reservation. Returns false on a lost lease.
pub fn ack(conn: &Connection, task_id: &str, worker_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM task_queue
         WHERE task_id = ?1 AND state = 'inflight' AND reserved_by = ?2",
        params![task_id, worker_id],
    )?;
    if changed > 0 {
        debug!(task_id = %task_id, "Acked task");
    }
    Ok(changed > 0)
}

/// Negative-acknowledge a held reservation.
///
/// When `retryable` and the retry budget allows, the task goes back to the
/// tail of its user's ready list gated by exponential backoff; otherwise it
/// leaves the queue and the caller records the terminal failure.
pub fn nack(
    conn: &mut Connection,
    task_id: &str,
    worker_id: &str,
    retryable: bool,
    max_retries: u32,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
) -> Result<NackOutcome> {
    let now = now_millis();
    let tx = conn.transaction()?;

    let row: Option<(String, u32)> = tx
        .query_row(
            "SELECT user_id, retry_count FROM task_queue
             WHERE task_id = ?1 AND state = 'inflight' AND reserved_by = ?2",
            params![task_id, worker_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (user_id, retry_count) = match row {
        Some(found) => found,
        None => {
            tx.commit()?;
            return Ok(NackOutcome::LeaseLost);
        }
    };

    tx.execute(
        "DELETE FROM task_queue WHERE task_id = ?1",
        params![task_id],
    )?;

    let outcome = if retryable && retry_count < max_retries {
        let new_retry = retry_count + 1;
        let not_before =
            now + (backoff_delay_secs(new_retry, backoff_base_secs, backoff_cap_secs) as i64) * 1000;
        tx.execute(
            "INSERT INTO task_queue (task_id, user_id, state, enqueued_at, not_before, retry_count)
             VALUES (?1, ?2, 'ready', ?3, ?4, ?5)",
            params![task_id, user_id, now, not_before, new_retry],
        )?;
        debug!(
            task_id = %task_id,
            retry = new_retry,
            "Requeued task with backoff"
        );
        NackOutcome::Requeued {
            retry_count: new_retry,
            not_before_ms: not_before,
        }
    } else {
        if retryable {
            warn!(
                task_id = %task_id,
                retries = retry_count,
                "Task exhausted its retries"
            );
        }
        NackOutcome::NotRequeued { retry_count }
    };

    tx.commit().context("Failed to commit nack")?;
    Ok(outcome)
}

/// Remove a task from the queue regardless of state or owner.
/// Safe against missing entries; used by cancellation.
pub fn remove(conn: &Connection, task_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM task_queue WHERE task_id = ?1",
        params![task_id],
    )?;
    Ok(changed > 0)
}

/// Return every expired reservation to its user's ready list.
///
/// This is the recovery path against worker crashes: an inflight entry whose
/// deadline has passed behaves as a retryable nack with an incremented retry
/// count. Entries past the retry budget leave the queue and are reported so
/// the scheduler can record the terminal failure.
pub fn reclaim_expired(
    conn: &mut Connection,
    max_retries: u32,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
) -> Result<ReclaimOutcome> {
    let now = now_millis();
    let tx = conn.transaction()?;
    let mut outcome = ReclaimOutcome::default();

    {
        let expired: Vec<(String, String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT task_id, user_id, retry_count FROM task_queue
                 WHERE state = 'inflight' AND deadline < ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for (task_id, user_id, retry_count) in expired {
            tx.execute(
                "DELETE FROM task_queue WHERE task_id = ?1",
                params![task_id],
            )?;

            if retry_count < max_retries {
                let new_retry = retry_count + 1;
                let not_before = now
                    + (backoff_delay_secs(new_retry, backoff_base_secs, backoff_cap_secs) as i64)
                        * 1000;
                tx.execute(
                    "INSERT INTO task_queue (task_id, user_id, state, enqueued_at, not_before, retry_count)
                     VALUES (?1, ?2, 'ready', ?3, ?4, ?5)",
                    params![task_id, user_id, now, not_before, new_retry],
                )?;
                outcome.requeued.push(task_id);
            } else {
                outcome.exhausted.push(task_id);
            }
        }
    }

    tx.commit().context("Failed to commit reclaim")?;

    if !outcome.requeued.is_empty() || !outcome.exhausted.is_empty() {
        info!(
            requeued = outcome.requeued.len(),
            exhausted = outcome.exhausted.len(),
            "Reclaimed expired reservations"
        );
    }

    Ok(outcome)
}

/// Queue depth counters.
pub fn stats(conn: &Connection) -> Result<QueueCounters> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM task_queue GROUP BY state")?;
    let mut counters = QueueCounters::default();

    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (state, count) = row?;
        match state.as_str() {
            "ready" => counters.ready = count as u64,
            "inflight" => counters.inflight = count as u64,
            _ => {}
        }
    }

    Ok(counters)
}

/// Number of reservations currently held by `worker_id`.
pub fn inflight_for(conn: &Connection, worker_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM task_queue WHERE state = 'inflight' AND reserved_by = ?1",
        params![worker_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Look up a single queue entry.
pub fn get_entry(conn: &Connection, task_id: &str) -> Result<Option<QueueEntry>> {
    let entry = conn
        .query_row(
            "SELECT task_id, user_id, state, enqueued_at, not_before, reserved_by, deadline, retry_count
             FROM task_queue WHERE task_id = ?1",
            params![task_id],
            |row| {
                Ok(QueueEntry {
                    task_id: row.get(0)?,
                    user_id: row.get(1)?,
                    state: row.get(2)?,
                    enqueued_at_ms: row.get(3)?,
                    not_before_ms: row.get(4)?,
                    reserved_by: row.get(5)?,
                    deadline_ms: row.get(6)?,
                    retry_count: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(entry)
}

/// Backoff before the n-th retry: `base * 2^(n-1)`, capped.
fn backoff_delay_secs(retry: u32, base_secs: u64, cap_secs: u64) -> u64 {
    let exponent = retry.saturating_sub(1).min(20);
    base_secs.saturating_mul(1u64 << exponent).min(cap_secs)
}

/// Current Unix time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
