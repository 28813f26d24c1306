//! Shared data structures and utilities for the stock analysis service
//!
//! This crate contains the task and batch documents, analysis parameters,
//! progress tracking logic, API types, and configuration structures used by
//! the orchestration server.

pub mod api;
pub mod config;
pub mod defaults;
pub mod progress;
pub mod task;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{BatchAnalysisRequest, SingleAnalysisRequest, TaskSnapshot};
pub use config::ServiceConfig;
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use task::{AnalysisBatch, AnalysisParameters, AnalysisReport, AnalysisTask, TaskStatus};
pub use utils::{validate_stock_code, validate_user_id};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the analysis service
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Task execution error: {0}")]
    TaskExecution(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
