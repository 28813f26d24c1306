//! Streaming adapter: task progress over server-sent events
//!
//! The read side of progress tracking. A stream first emits the current
//! snapshot (live cache when present, synthesized from the task row
//! otherwise), then keeps emitting on meaningful change or at most every
//! `stream_max_interval_seconds` while the task runs. The event carrying a
//! terminal status is the last one.

use crate::cache::LiveCache;
use crate::database::AnalysisDatabase;
use axum::response::sse::Event;
use futures_util::stream::Stream;
use shared::api::TaskSnapshot;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Build the current snapshot for a task, or `None` when it does not exist.
///
/// The live record wins while it is fresh; a stale non-terminal record never
/// masks a terminal state already durable in the store (a reclaimed task
/// whose old worker left a running snapshot behind, for example).
pub async fn current_snapshot(
    database: &Arc<Mutex<AnalysisDatabase>>,
    cache: &LiveCache,
    task_id: &str,
) -> anyhow::Result<Option<TaskSnapshot>> {
    let task = database.lock().await.get_task(task_id).await?;
    let Some(task) = task else {
        return Ok(None);
    };

    let snapshot = TaskSnapshot::from_task(&task);
    let snapshot = match cache.get_progress(task_id) {
        Some(live) if !(task.status.is_terminal() && !live.status.is_terminal()) => {
            snapshot.with_progress(&live)
        }
        _ => snapshot,
    };

    Ok(Some(snapshot))
}

struct StreamState {
    database: Arc<Mutex<AnalysisDatabase>>,
    cache: LiveCache,
    task_id: String,
    max_interval: Duration,
    last: Option<TaskSnapshot>,
    finished: bool,
}

/// Unbounded sequence of snapshot events terminated by a terminal event.
pub fn progress_stream(
    database: Arc<Mutex<AnalysisDatabase>>,
    cache: LiveCache,
    task_id: String,
    max_interval: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = StreamState {
        database,
        cache,
        task_id,
        max_interval,
        last: None,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        let poll = Duration::from_millis(250).min(state.max_interval);
        let deadline = Instant::now() + state.max_interval;

        loop {
            let snapshot =
                match current_snapshot(&state.database, &state.cache, &state.task_id).await {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => {
                        // The task disappeared; end the stream.
                        state.finished = true;
                        return None;
                    }
                    Err(e) => {
                        warn!(task_id = %state.task_id, error = %e, "Progress stream read failed");
                        state.finished = true;
                        return None;
                    }
                };

            let changed = state
                .last
                .as_ref()
                .map(|previous| !same_event(previous, &snapshot))
                .unwrap_or(true);

            if changed || Instant::now() >= deadline {
                let is_terminal = snapshot.status.is_terminal();
                let event = match Event::default().json_data(&snapshot) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(task_id = %state.task_id, error = %e, "Snapshot serialization failed");
                        state.finished = true;
                        return None;
                    }
                };
                state.last = Some(snapshot);
                if is_terminal {
                    state.finished = true;
                }
                return Some((Ok(event), state));
            }

            tokio::time::sleep(poll).await;
        }
    })
}

/// Whether two snapshots would render the same to a client. Timing fields
/// tick on every read, so comparing them would turn every poll into an
/// emission.
fn same_event(a: &TaskSnapshot, b: &TaskSnapshot) -> bool {
    a.status == b.status
        && a.progress == b.progress
        && a.current_step == b.current_step
        && a.message == b.message
        && a.steps == b.steps
        && a.result_data.is_some() == b.result_data.is_some()
        && a.error_message == b.error_message
}
