//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

/// Default listen address for the REST API
pub fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

/// Default data directory for the task database
pub fn default_data_dir() -> String {
    "./data".to_string()
}

/// Default global concurrency cap (tasks running at once across all users)
pub fn default_max_concurrent_tasks() -> usize {
    10
}

/// Default per-user concurrency cap
pub fn default_per_user_concurrent_tasks() -> usize {
    2
}

/// Default worker pool size per node
pub fn default_worker_pool_size() -> usize {
    10
}

/// Default lease lifetime before a reservation becomes reclaimable (10 minutes)
pub fn default_visibility_timeout() -> u64 {
    600
}

/// Default interval between reclaim sweeps (30 seconds)
pub fn default_reclaim_interval() -> u64 {
    30
}

/// Default scheduler poll interval when idle (5 seconds)
pub fn default_poll_interval() -> u64 {
    5
}

/// Default maximum retry attempts per task
pub fn default_max_retries() -> u32 {
    3
}

/// Default retry backoff base (10 seconds, doubled per retry)
pub fn default_backoff_base() -> u64 {
    10
}

/// Default retry backoff ceiling (5 minutes)
pub fn default_backoff_cap() -> u64 {
    300
}

/// Default model for data collection and tool calling
pub fn default_quick_model() -> String {
    "qwen-turbo".to_string()
}

/// Default model for reasoning and decision making
pub fn default_deep_model() -> String {
    "qwen-max".to_string()
}

/// Default TTL for live progress records past terminal transition (1 hour)
pub fn default_progress_ttl() -> u64 {
    3600
}

/// Default TTL for cancellation flags (1 hour)
pub fn default_cancel_ttl() -> u64 {
    3600
}

/// Default maximum number of stocks in one batch submission
pub fn default_max_batch_size() -> usize {
    100
}

/// Default wait for in-flight workers during shutdown (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

/// Default SQLite busy timeout (5 seconds)
pub fn default_database_busy_timeout() -> u64 {
    5
}

/// Default capacity of the worker completion channel
pub fn default_channel_buffer_size() -> usize {
    1000
}

/// Default minimum interval between live-cache progress writes (milliseconds)
pub fn default_progress_write_interval_ms() -> u64 {
    500
}

/// Default maximum silence between progress stream events (2 seconds)
pub fn default_stream_max_interval() -> u64 {
    2
}
