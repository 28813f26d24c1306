//! In-process live cache for progress records and cancellation flags
//!
//! The cache is the read side of progress streaming: workers write bounded
//! snapshots here, streamers poll it. Entries carry a TTL refreshed on every
//! write so records of finished tasks disappear after a grace period. A
//! periodic sweep evicts expired entries.
// Locks are std (not tokio) because the progress sink writes from blocking
// executor threads; every critical section is a map operation, nothing is
// held across an await.

use shared::progress::ProgressSnapshot;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

struct ProgressEntry {
    snapshot: ProgressSnapshot,
    expires_at: Instant,
}

/// Shared cache of live progress snapshots and cancel flags, keyed by task id.
#[derive(Clone)]
pub struct LiveCache {
    progress: Arc<RwLock<HashMap<String, ProgressEntry>>>,
    cancel_flags: Arc<RwLock<HashMap<String, Instant>>>,
    progress_ttl: Duration,
    cancel_ttl: Duration,
}

impl LiveCache {
    pub fn new(progress_ttl: Duration, cancel_ttl: Duration) -> Self {
        Self {
            progress: Arc::new(RwLock::new(HashMap::new())),
            cancel_flags: Arc::new(RwLock::new(HashMap::new())),
            progress_ttl,
            cancel_ttl,
        }
    }

    /// Store a progress snapshot, refreshing its TTL. Never fails; progress
    /// writes must not take the executor down with them.
    pub fn write_progress(&self, snapshot: ProgressSnapshot) {
        let mut progress = match self.progress.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        progress.insert(
            snapshot.task_id.clone(),
            ProgressEntry {
                snapshot,
                expires_at: Instant::now() + self.progress_ttl,
            },
        );
    }

    /// Read the live snapshot for a task, if one exists and has not expired.
    pub fn get_progress(&self, task_id: &str) -> Option<ProgressSnapshot> {
        let progress = match self.progress.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        progress.get(task_id).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.snapshot.clone())
            } else {
                None
            }
        })
    }

    /// Raise the cancellation flag for a task.
    pub fn set_cancelled(&self, task_id: &str) {
        let mut flags = match self.cancel_flags.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        flags.insert(task_id.to_string(), Instant::now() + self.cancel_ttl);
    }

    /// Whether a cancellation flag is raised for a task. Checked by the
    /// progress sink at every executor checkpoint.
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        let flags = match self.cancel_flags.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        flags
            .get(task_id)
            .map(|expires_at| *expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Evict expired entries. Called periodically from a background task.
    pub fn sweep_expired(&self) {
        let now = Instant::now();

        let removed_progress = {
            let mut progress = match self.progress.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = progress.len();
            progress.retain(|_, entry| entry.expires_at > now);
            before - progress.len()
        };

        let removed_flags = {
            let mut flags = match self.cancel_flags.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = flags.len();
            flags.retain(|_, expires_at| *expires_at > now);
            before - flags.len()
        };

        if removed_progress > 0 || removed_flags > 0 {
            debug!(
                progress = removed_progress,
                cancel_flags = removed_flags,
                "Swept expired cache entries"
            );
        }
    }

    /// Number of live progress records, for diagnostics.
    pub fn progress_len(&self) -> usize {
        match self.progress.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::progress::ProgressTracker;

    fn cache_with_ttl(ttl_ms: u64) -> LiveCache {
        LiveCache::new(Duration::from_millis(ttl_ms), Duration::from_millis(ttl_ms))
    }

    fn snapshot(task_id: &str) -> ProgressSnapshot {
        ProgressTracker::new(task_id, 300).snapshot()
    }

    #[test]
    fn test_write_and_read_progress() {
        let cache = cache_with_ttl(60_000);
        cache.write_progress(snapshot("t1"));

        let loaded = cache.get_progress("t1").unwrap();
        assert_eq!(loaded.task_id, "t1");
        assert!(cache.get_progress("t2").is_none());
    }

    #[test]
    fn test_progress_expires() {
        let cache = cache_with_ttl(10);
        cache.write_progress(snapshot("t1"));
        std::thread::sleep(Duration::from_millis(20));

        assert!(cache.get_progress("t1").is_none());
        cache.sweep_expired();
        assert_eq!(cache.progress_len(), 0);
    }

    #[test]
    fn test_rewrite_refreshes_ttl() {
        let cache = cache_with_ttl(40);
        cache.write_progress(snapshot("t1"));
        std::thread::sleep(Duration::from_millis(25));
        cache.write_progress(snapshot("t1"));
        std::thread::sleep(Duration::from_millis(25));

        // Still alive because the second write refreshed the TTL.
        assert!(cache.get_progress("t1").is_some());
    }

    #[test]
    fn test_cancel_flag_round_trip() {
        let cache = cache_with_ttl(60_000);
        assert!(!cache.is_cancelled("t1"));
        cache.set_cancelled("t1");
        assert!(cache.is_cancelled("t1"));
        assert!(!cache.is_cancelled("t2"));
    }

    #[test]
    fn test_cancel_flag_expires() {
        let cache = cache_with_ttl(10);
        cache.set_cancelled("t1");
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_cancelled("t1"));
    }
}
