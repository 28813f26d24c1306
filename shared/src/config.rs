//! Configuration types and validation for the analysis service
//!
//! This module defines the service configuration loaded from server.toml,
//! including validation logic and serialization support. The configuration
//! is a snapshot: it is read once at startup, validated, and passed around
//! immutably; per-submission overrides live on the task record, never here.

use crate::defaults::*;
use crate::task::ResearchDepth;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-depth duration estimates, in seconds, used by the progress tracker
/// as the baseline for remaining-time reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepthEstimates {
    #[serde(default = "default_estimate_quick")]
    pub quick: u64,
    #[serde(default = "default_estimate_basic")]
    pub basic: u64,
    #[serde(default = "default_estimate_standard")]
    pub standard: u64,
    #[serde(default = "default_estimate_deep")]
    pub deep: u64,
    #[serde(default = "default_estimate_comprehensive")]
    pub comprehensive: u64,
}

fn default_estimate_quick() -> u64 {
    ResearchDepth::Quick.estimated_total_secs()
}
fn default_estimate_basic() -> u64 {
    ResearchDepth::Basic.estimated_total_secs()
}
fn default_estimate_standard() -> u64 {
    ResearchDepth::Standard.estimated_total_secs()
}
fn default_estimate_deep() -> u64 {
    ResearchDepth::Deep.estimated_total_secs()
}
fn default_estimate_comprehensive() -> u64 {
    ResearchDepth::Comprehensive.estimated_total_secs()
}

impl Default for DepthEstimates {
    fn default() -> Self {
        Self {
            quick: default_estimate_quick(),
            basic: default_estimate_basic(),
            standard: default_estimate_standard(),
            deep: default_estimate_deep(),
            comprehensive: default_estimate_comprehensive(),
        }
    }
}

impl DepthEstimates {
    pub fn for_depth(&self, depth: ResearchDepth) -> u64 {
        match depth {
            ResearchDepth::Quick => self.quick,
            ResearchDepth::Basic => self.basic,
            ResearchDepth::Standard => self.standard,
            ResearchDepth::Deep => self.deep,
            ResearchDepth::Comprehensive => self.comprehensive,
        }
    }
}

/// Main service configuration loaded from server.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Address the REST API listens on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Directory holding the task database
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Stable identifier of this node, used as the reservation owner for
    /// leases; generated at startup when unset
    #[serde(default)]
    pub node_id: Option<String>,

    // Admission control
    /// Global cap on concurrently running tasks (default: 10)
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Per-user cap on concurrently running tasks (default: 2)
    #[serde(default = "default_per_user_concurrent_tasks")]
    pub per_user_concurrent_tasks: usize,
    /// Number of worker slots on this node (default: 10)
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    // Queue behaviour
    /// Lease lifetime before a reservation becomes reclaimable (default: 600)
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    /// Interval between reclaim sweeps (default: 30)
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_seconds: u64,
    /// Scheduler poll interval when idle (default: 5)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Maximum retry attempts per task (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry backoff base in seconds, doubled per retry (default: 10)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,
    /// Retry backoff ceiling in seconds (default: 300)
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_seconds: u64,

    // Execution
    /// Wall-clock timeout override applied to every depth; 0 selects the
    /// per-depth defaults (default: 0)
    #[serde(default)]
    pub default_analysis_timeout_seconds: u64,
    /// Per-depth duration estimates for remaining-time reporting
    #[serde(default)]
    pub depth_estimates: DepthEstimates,

    // Model defaults applied at submission when the request names none
    #[serde(default = "default_quick_model")]
    pub default_quick_model: String,
    #[serde(default = "default_deep_model")]
    pub default_deep_model: String,

    // Live cache
    /// TTL for live progress records (default: 3600)
    #[serde(default = "default_progress_ttl")]
    pub progress_ttl_seconds: u64,
    /// TTL for cancellation flags (default: 3600)
    #[serde(default = "default_cancel_ttl")]
    pub cancel_ttl_seconds: u64,
    /// Minimum interval between live-cache progress writes in milliseconds
    /// (default: 500)
    #[serde(default = "default_progress_write_interval_ms")]
    pub progress_write_interval_ms: u64,
    /// Maximum silence between progress stream events in seconds (default: 2)
    #[serde(default = "default_stream_max_interval")]
    pub stream_max_interval_seconds: u64,

    // Limits and tuning
    /// Maximum number of stocks in one batch submission (default: 100)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Wait for in-flight workers during shutdown in seconds (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// SQLite busy timeout in seconds (default: 5)
    #[serde(default = "default_database_busy_timeout")]
    pub database_busy_timeout_seconds: u64,
    /// Capacity of the worker completion channel (default: 1000)
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// Optional log file path; stdout only when unset
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        // An empty TOML document yields every serde default.
        toml::from_str("").expect("default configuration must deserialize")
    }
}

impl ServiceConfig {
    /// Load and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServiceConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective wall-clock timeout for one execution attempt at `depth`.
    pub fn analysis_timeout_secs(&self, depth: ResearchDepth) -> u64 {
        if self.default_analysis_timeout_seconds > 0 {
            self.default_analysis_timeout_seconds
        } else {
            depth.default_timeout_secs()
        }
    }

    /// Heartbeat interval derived from the visibility timeout; the lease is
    /// renewed three times per lifetime so a single missed beat is survivable.
    pub fn heartbeat_interval_secs(&self) -> u64 {
        (self.visibility_timeout_seconds / 3).max(1)
    }

    /// Validate the service configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen_address.is_empty() {
            return Err(crate::AnalysisError::Config(
                "listen_address cannot be empty".to_string(),
            )
            .into());
        }

        if self.max_concurrent_tasks == 0 {
            return Err(crate::AnalysisError::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            )
            .into());
        }

        if self.per_user_concurrent_tasks == 0 {
            return Err(crate::AnalysisError::Config(
                "per_user_concurrent_tasks must be at least 1".to_string(),
            )
            .into());
        }

        if self.per_user_concurrent_tasks > self.max_concurrent_tasks {
            return Err(crate::AnalysisError::Config(
                "per_user_concurrent_tasks cannot exceed max_concurrent_tasks".to_string(),
            )
            .into());
        }

        if self.worker_pool_size == 0 {
            return Err(crate::AnalysisError::Config(
                "worker_pool_size must be at least 1".to_string(),
            )
            .into());
        }

        if self.visibility_timeout_seconds == 0 {
            return Err(crate::AnalysisError::Config(
                "visibility_timeout_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.reclaim_interval_seconds == 0 {
            return Err(crate::AnalysisError::Config(
                "reclaim_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.reclaim_interval_seconds >= self.visibility_timeout_seconds {
            return Err(crate::AnalysisError::Config(
                "reclaim_interval_seconds must be shorter than visibility_timeout_seconds"
                    .to_string(),
            )
            .into());
        }

        if self.poll_interval_seconds == 0 {
            return Err(crate::AnalysisError::Config(
                "poll_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.backoff_base_seconds == 0 {
            return Err(crate::AnalysisError::Config(
                "backoff_base_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.backoff_cap_seconds < self.backoff_base_seconds {
            return Err(crate::AnalysisError::Config(
                "backoff_cap_seconds cannot be smaller than backoff_base_seconds".to_string(),
            )
            .into());
        }

        if self.max_batch_size == 0 {
            return Err(crate::AnalysisError::Config(
                "max_batch_size must be at least 1".to_string(),
            )
            .into());
        }

        if self.channel_buffer_size == 0 {
            return Err(crate::AnalysisError::Config(
                "channel_buffer_size must be at least 1".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
