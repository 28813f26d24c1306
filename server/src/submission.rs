//! Submission path: validation, default filling, task materialization
//!
//! Submission is synchronous only up to the enqueue: it validates the
//! request, fills unspecified models from the effective settings, persists
//! the task (and batch) documents as `pending`, appends them to the queue,
//! and wakes the scheduler. It never waits for execution.

use crate::database::AnalysisDatabase;
use crate::models::ModelRegistry;
use crate::queue::TaskQueue;
use shared::api::{
    BatchAnalysisRequest, BatchAnalysisResponse, SingleAnalysisRequest, SingleAnalysisResponse,
};
use shared::config::ServiceConfig;
use shared::task::{AnalysisBatch, AnalysisParameters, AnalysisTask, TaskStatus};
use shared::utils::{validate_stock_code, validate_user_id};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::info;

/// Errors surfaced by the submission path. Validation problems reach the
/// submitter as 400s and create nothing; everything else is infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Accepts single and batch analysis submissions.
#[derive(Clone)]
pub struct SubmissionService {
    config: Arc<ServiceConfig>,
    database: Arc<Mutex<AnalysisDatabase>>,
    queue: TaskQueue,
    registry: ModelRegistry,
    /// Wakes the scheduler so fresh work skips the poll interval
    submit_notify: Arc<Notify>,
}

impl SubmissionService {
    pub fn new(
        config: Arc<ServiceConfig>,
        database: Arc<Mutex<AnalysisDatabase>>,
        queue: TaskQueue,
        registry: ModelRegistry,
        submit_notify: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            database,
            queue,
            registry,
            submit_notify,
        }
    }

    /// Submit one stock for analysis. Returns as soon as the task is
    /// persisted and queued.
    pub async fn submit_single(
        &self,
        request: &SingleAnalysisRequest,
    ) -> Result<SingleAnalysisResponse, SubmissionError> {
        validate_user_id(&request.user_id).map_err(validation)?;
        validate_stock_code(&request.stock_code).map_err(validation)?;

        let parameters = self.effective_parameters(request.parameters.clone())?;
        let task = AnalysisTask::new(&request.user_id, &request.stock_code, parameters);

        self.database
            .lock()
            .await
            .insert_task(&task)
            .await
            .map_err(SubmissionError::Internal)?;
        self.queue
            .enqueue(&request.user_id, &task.task_id)
            .await
            .map_err(|e| SubmissionError::Internal(e.into()))?;
        self.submit_notify.notify_one();

        info!(
            task_id = %task.task_id,
            user_id = %request.user_id,
            stock_code = %request.stock_code,
            "Accepted analysis task"
        );

        Ok(SingleAnalysisResponse {
            task_id: task.task_id,
            stock_code: request.stock_code.clone(),
            status: TaskStatus::Pending,
        })
    }

    /// Submit a batch of stocks: one batch document plus one task per code,
    /// created in a single transaction, then all enqueued.
    pub async fn submit_batch(
        &self,
        request: &BatchAnalysisRequest,
    ) -> Result<BatchAnalysisResponse, SubmissionError> {
        validate_user_id(&request.user_id).map_err(validation)?;

        if request.stock_codes.is_empty() {
            return Err(SubmissionError::Validation(
                "Batch must contain at least one stock code".to_string(),
            ));
        }
        if request.stock_codes.len() > self.config.max_batch_size {
            return Err(SubmissionError::Validation(format!(
                "Batch size {} exceeds the maximum of {}",
                request.stock_codes.len(),
                self.config.max_batch_size
            )));
        }
        if request.title.trim().is_empty() {
            return Err(SubmissionError::Validation(
                "Batch title cannot be empty".to_string(),
            ));
        }
        for stock_code in &request.stock_codes {
            validate_stock_code(stock_code).map_err(validation)?;
        }

        let parameters = self.effective_parameters(request.parameters.clone())?;
        let batch = AnalysisBatch::new(
            &request.user_id,
            &request.title,
            &request.description,
            request.stock_codes.len() as u32,
            parameters.clone(),
        );

        let tasks: Vec<AnalysisTask> = request
            .stock_codes
            .iter()
            .map(|stock_code| {
                AnalysisTask::new_in_batch(
                    &request.user_id,
                    stock_code,
                    parameters.clone(),
                    &batch.batch_id,
                )
            })
            .collect();

        self.database
            .lock()
            .await
            .insert_batch_with_tasks(&batch, &tasks)
            .await
            .map_err(SubmissionError::Internal)?;

        for task in &tasks {
            self.queue
                .enqueue(&request.user_id, &task.task_id)
                .await
                .map_err(|e| SubmissionError::Internal(e.into()))?;
        }
        self.submit_notify.notify_one();

        info!(
            batch_id = %batch.batch_id,
            user_id = %request.user_id,
            total_tasks = tasks.len(),
            "Accepted analysis batch"
        );

        Ok(BatchAnalysisResponse {
            batch_id: batch.batch_id,
            total_tasks: tasks.len() as u32,
            status: TaskStatus::Pending,
        })
    }

    /// Resolve the effective parameters for a submission: explicit models
    /// must be known to the registry, unspecified ones fall back to the
    /// configured defaults (and, should those be missing from the registry,
    /// to the registry's own defaults).
    fn effective_parameters(
        &self,
        parameters: Option<AnalysisParameters>,
    ) -> Result<AnalysisParameters, SubmissionError> {
        let mut parameters = parameters.unwrap_or_default();

        if parameters.selected_analysts.is_empty() {
            return Err(SubmissionError::Validation(
                "At least one analyst role must be selected".to_string(),
            ));
        }

        for model in [&parameters.quick_analysis_model, &parameters.deep_analysis_model]
            .into_iter()
            .flatten()
        {
            if !self.registry.is_known(model) {
                return Err(SubmissionError::Validation(format!(
                    "Unknown model: {}",
                    model
                )));
            }
        }

        if parameters.quick_analysis_model.is_none() {
            let configured = &self.config.default_quick_model;
            let chosen = if self.registry.is_known(configured) {
                configured.clone()
            } else {
                self.registry.default_quick().to_string()
            };
            parameters.quick_analysis_model = Some(chosen);
        }
        if parameters.deep_analysis_model.is_none() {
            let configured = &self.config.default_deep_model;
            let chosen = if self.registry.is_known(configured) {
                configured.clone()
            } else {
                self.registry.default_deep().to_string()
            };
            parameters.deep_analysis_model = Some(chosen);
        }

        Ok(parameters)
    }
}

fn validation(e: anyhow::Error) -> SubmissionError {
    SubmissionError::Validation(e.to_string())
}
