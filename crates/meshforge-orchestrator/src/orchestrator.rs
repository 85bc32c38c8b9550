//! Batch fan-out, join and aggregation.

use crate::config::{EngineConfig, StoreKind};
use crate::executor::TaskExecutor;
use crate::model::{BatchState, BatchStatus, TaskError, TaskState, TaskStatus, aggregate_status};
use crate::progress::{ProgressEvent, ProgressPublisher};
use crate::retry::RetryPolicy;
use crate::staging::{DataUriStager, SourceStager};
use crate::store::{InMemoryJobStore, JobStore, SqliteJobStore, StoreError};
use futures::future::join_all;
use meshforge_abstraction::{
    BackendError, ErrorKind, GenerationRequest, ModelParamSchema, ParamMap, ValidationError,
};
use meshforge_backends::BackendRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Errors returned by [`BatchOrchestrator`].
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Unknown model type or invalid batch input.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Job store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No batch with this job id.
    #[error("Unknown job '{0}'")]
    UnknownJob(String),

    /// The background batch worker stopped without a result.
    #[error("Batch worker failed: {0}")]
    Worker(String),
}

impl OrchestratorError {
    /// Error kind for backend-classified failures.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Backend(err) => Some(err.kind()),
            Self::Worker(_) => Some(ErrorKind::Internal),
            Self::Store(_) | Self::UnknownJob(_) => None,
        }
    }
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// One input of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    /// Caller-chosen id, unique within the batch.
    pub item_id: String,
    /// URL, data URI or local path of the source image.
    pub source_ref: String,
}

impl BatchItem {
    /// Creates an item.
    pub fn new(item_id: impl Into<String>, source_ref: impl Into<String>) -> Self {
        Self { item_id: item_id.into(), source_ref: source_ref.into() }
    }
}

/// Returned when a batch is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTicket {
    pub job_id: String,
    pub estimated_seconds: u64,
    /// Task ids in item order, for progress subscriptions.
    pub task_ids: Vec<String>,
}

/// Per-item entry of a [`BatchReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub item_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl From<&TaskState> for FileResult {
    fn from(task: &TaskState) -> Self {
        let output = task.result_ref.as_ref();
        Self {
            item_id: task.item_id.clone(),
            status: task.status,
            download_url: output.map(|o| o.download_url.clone()),
            preview_url: output.and_then(|o| o.preview_url.clone()),
            size_bytes: output.and_then(|o| o.size_bytes),
            error: task.error.clone(),
        }
    }
}

/// Consolidated batch result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub job_id: String,
    pub status: BatchStatus,
    /// One entry per item, in submission order.
    pub files: Vec<FileResult>,
}

/// Discovery entry for one model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub model_type: String,
    pub display_name: String,
    pub estimated_seconds: u64,
}

struct RunningBatch {
    cancel: CancellationToken,
    done: watch::Receiver<Option<BatchReport>>,
}

/// Accepts batches, runs their tasks on a bounded pool and aggregates results.
#[derive(Clone)]
pub struct BatchOrchestrator {
    registry: Arc<BackendRegistry>,
    store: Arc<dyn JobStore>,
    publisher: Arc<ProgressPublisher>,
    stager: Arc<dyn SourceStager>,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    retry_policy: RetryPolicy,
    default_deadline: Duration,
    extended_deadline: Duration,
    running: Arc<Mutex<HashMap<String, RunningBatch>>>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("registry", &self.registry)
            .field("max_concurrency", &self.max_concurrency)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    /// Creates an orchestrator over `registry` and `store`.
    pub fn new(registry: BackendRegistry, store: Arc<dyn JobStore>, config: &EngineConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            registry: Arc::new(registry),
            store,
            publisher: Arc::new(ProgressPublisher::with_retention(config.progress_retention())),
            stager: Arc::new(DataUriStager::new(config.staging.max_file_bytes)),
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            retry_policy: config.retry_policy(),
            default_deadline: config.default_deadline(),
            extended_deadline: config.extended_deadline(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builds the provider registry and the configured store.
    pub fn from_config(config: &EngineConfig) -> OrchestratorResult<Self> {
        let registry = BackendRegistry::from_settings(&config.backends);
        let store: Arc<dyn JobStore> = match (config.store.kind, &config.store.path) {
            (StoreKind::Sqlite, Some(path)) => Arc::new(SqliteJobStore::open(path)?),
            (StoreKind::Sqlite, None) => {
                return Err(StoreError::NotFound("store.path for the sqlite store".to_string()).into());
            }
            (StoreKind::Memory, _) => Arc::new(InMemoryJobStore::new()),
        };
        Ok(Self::new(registry, store, config))
    }

    /// Replaces the source stager.
    #[must_use]
    pub fn with_stager(mut self, stager: Arc<dyn SourceStager>) -> Self {
        self.stager = stager;
        self
    }

    /// Progress hub shared by every batch.
    pub fn publisher(&self) -> Arc<ProgressPublisher> {
        Arc::clone(&self.publisher)
    }

    /// The job store.
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Every registered model type with its display data.
    pub fn available_models(&self) -> Vec<ModelSummary> {
        self.registry
            .list_available()
            .into_iter()
            .map(|d| ModelSummary {
                model_type: d.model_type,
                display_name: d.display_meta.display_name,
                estimated_seconds: d.display_meta.estimated_seconds,
            })
            .collect()
    }

    /// Parameter schema of one model type.
    pub fn model_params(&self, model_type: &str) -> Result<ModelParamSchema, BackendError> {
        Ok(self.registry.resolve(model_type)?.param_schema().clone())
    }

    /// Accepts a batch and starts it in the background.
    ///
    /// Nothing is persisted or started when the model type is unknown, the
    /// params are invalid, or the item list is empty or has duplicate ids.
    pub async fn submit_batch(
        &self,
        model_type: &str,
        items: Vec<BatchItem>,
        params: ParamMap,
    ) -> OrchestratorResult<BatchTicket> {
        let backend = self.registry.resolve(model_type)?;
        backend.validate_params(&params).map_err(BackendError::from)?;
        check_items(&items).map_err(BackendError::from)?;

        let mut batch = BatchState::queued(model_type);
        let mut work = Vec::with_capacity(items.len());
        for item in items {
            let task = TaskState::queued(&batch.job_id, &item.item_id);
            let request = GenerationRequest {
                item_id: item.item_id,
                model_type: model_type.to_string(),
                source_ref: item.source_ref,
                params: params.clone(),
            };
            batch.task_ids.push(task.task_id.clone());
            work.push((task, request));
        }

        for (task, _) in &work {
            self.store.put_task(task).await?;
            self.publisher.publish_status(&task.task_id, TaskStatus::Queued, 0, "queued");
        }
        self.store.put_batch(&batch).await?;

        let count = work.len() as u64;
        let waves = count.div_ceil(self.max_concurrency as u64);
        let ticket = BatchTicket {
            job_id: batch.job_id.clone(),
            estimated_seconds: backend.display_meta().estimated_seconds * waves,
            task_ids: batch.task_ids.clone(),
        };

        info!(job_id = %batch.job_id, model_type = %model_type, items = count, "Batch accepted");

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch.job_id.clone(), RunningBatch { cancel: cancel.clone(), done: done_rx });

        let executor = TaskExecutor::new(
            backend,
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
            Arc::clone(&self.stager),
            self.retry_policy.clone(),
            Arc::clone(&self.semaphore),
            self.default_deadline,
            self.extended_deadline,
        )
        .with_cancellation(cancel);

        let this = self.clone();
        tokio::spawn(async move {
            let job_id = batch.job_id.clone();
            let report = this.drive(batch, work, executor).await;
            // Receivers may all be gone.
            let _ = done_tx.send(Some(report));
            this.running.lock().unwrap_or_else(PoisonError::into_inner).remove(&job_id);
        });

        Ok(ticket)
    }

    /// Submits a batch and waits for its report.
    pub async fn run_batch(
        &self,
        model_type: &str,
        items: Vec<BatchItem>,
        params: ParamMap,
    ) -> OrchestratorResult<BatchReport> {
        let ticket = self.submit_batch(model_type, items, params).await?;
        self.wait(&ticket.job_id).await
    }

    /// Waits until a batch is terminal and returns its report.
    pub async fn wait(&self, job_id: &str) -> OrchestratorResult<BatchReport> {
        let done = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map(|running| running.done.clone());

        if let Some(mut done) = done {
            let report = done
                .wait_for(Option::is_some)
                .await
                .map_err(|e| OrchestratorError::Worker(e.to_string()))?
                .clone();
            return report.ok_or_else(|| OrchestratorError::Worker("batch ended without a report".to_string()));
        }

        let report = self.report(job_id).await?;
        if report.status.is_terminal() {
            Ok(report)
        } else {
            Err(OrchestratorError::Worker(format!("batch {} is not running in this process", job_id)))
        }
    }

    /// Stops tasks of a batch that have not started yet.
    ///
    /// Returns `true` when the batch was still running. In-flight tasks finish normally.
    pub async fn cancel(&self, job_id: &str) -> OrchestratorResult<bool> {
        let cancel = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map(|running| running.cancel.clone());

        if let Some(cancel) = cancel {
            info!(job_id = %job_id, "Cancelling batch");
            cancel.cancel();
            return Ok(true);
        }

        match self.store.get_batch(job_id).await? {
            Some(_) => Ok(false),
            None => Err(OrchestratorError::UnknownJob(job_id.to_string())),
        }
    }

    /// Builds the result contract of a batch from the store.
    pub async fn report(&self, job_id: &str) -> OrchestratorResult<BatchReport> {
        let batch = self
            .store
            .get_batch(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownJob(job_id.to_string()))?;
        let tasks = self.store.list_tasks(job_id).await?;

        let status = if batch.is_terminal() {
            batch.status
        } else {
            aggregate_status(tasks.iter().map(|t| t.status))
        };

        Ok(BatchReport {
            job_id: batch.job_id,
            status,
            files: tasks.iter().map(FileResult::from).collect(),
        })
    }

    async fn drive(
        &self,
        mut batch: BatchState,
        work: Vec<(TaskState, GenerationRequest)>,
        executor: TaskExecutor,
    ) -> BatchReport {
        debug!(job_id = %batch.job_id, tasks = work.len(), "Dispatching tasks");

        let mut handles = Vec::with_capacity(work.len());
        let mut pending = Vec::with_capacity(work.len());
        for (task, request) in work {
            let executor = executor.clone();
            pending.push(task.clone());
            handles.push(tokio::spawn(async move { executor.execute(task, request).await }));
        }

        let mut finished = Vec::with_capacity(handles.len());
        for (result, queued) in join_all(handles).await.into_iter().zip(pending) {
            match result {
                Ok(done) => finished.push(done),
                Err(e) => {
                    error!(job_id = %batch.job_id, task_id = %queued.task_id, error = %e, "Task worker failed");
                    finished.push(self.fail_lost_task(queued, &e.to_string()).await);
                }
            }
        }

        batch.recompute(&finished);
        if let Err(e) = self.store.put_batch(&batch).await {
            error!(job_id = %batch.job_id, error = %e, "Failed to record batch result");
        }

        let completed = finished.iter().filter(|t| t.status == TaskStatus::Completed).count();
        info!(
            job_id = %batch.job_id,
            status = %batch.status,
            completed,
            total = finished.len(),
            "Batch finished"
        );

        BatchReport {
            job_id: batch.job_id,
            status: batch.status,
            files: finished.iter().map(FileResult::from).collect(),
        }
    }

    /// Fails a task whose worker died, starting from its last stored state.
    async fn fail_lost_task(&self, queued: TaskState, reason: &str) -> TaskState {
        let mut task = match self.store.get_task(&queued.task_id).await {
            Ok(Some(stored)) => stored,
            _ => queued,
        };
        if task.is_terminal() {
            return task;
        }

        task.fail(TaskError::new(ErrorKind::Internal, format!("task worker failed: {}", reason)));
        if let Err(e) = self.store.put_task(&task).await {
            error!(task_id = %task.task_id, error = %e, "Failed to record task failure");
        }
        let message = task.error.as_ref().map_or("failed", |e| e.message.as_str());
        self.publisher.publish_event(ProgressEvent::new(&task.task_id, task.status, task.progress_percent, message));
        task
    }
}

fn check_items(items: &[BatchItem]) -> Result<(), ValidationError> {
    if items.is_empty() {
        return Err(ValidationError::new("items", "batch must contain at least one item"));
    }
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if item.item_id.is_empty() {
            return Err(ValidationError::new("items", "item id must not be empty"));
        }
        if !seen.insert(item.item_id.as_str()) {
            return Err(ValidationError::new("items", format!("duplicate item id '{}'", item.item_id)));
        }
    }
    Ok(())
}
