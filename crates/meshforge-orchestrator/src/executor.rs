//! Per-item generation pipeline.
//!
//! Stage the source, build the provider request, submit it under the retry
//! policy with a hard per-call deadline, then interpret the result. Every step
//! publishes progress and the terminal state is written to the store once.

use crate::model::{TaskError, TaskState, TaskStatus};
use crate::progress::{ProgressEvent, ProgressPublisher};
use crate::retry::RetryPolicy;
use crate::staging::SourceStager;
use crate::store::{JobStore, StoreError};
use futures::FutureExt;
use meshforge_abstraction::{
    BackendError, BackendRequest, ErrorKind, GenerationBackend, GenerationRequest, ProgressSink,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const UPLOADING_PERCENT: u8 = 5;
const BUILT_PERCENT: u8 = 10;
const SUBMITTED_PERCENT: u8 = 15;
const PROVIDER_SPAN: u16 = 80;

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_DELAY: Duration = Duration::from_millis(50);

/// Maps provider-scale progress into the task's 15-95 band.
struct TaskProgress {
    task_id: String,
    publisher: Arc<ProgressPublisher>,
    percent: AtomicU8,
}

impl TaskProgress {
    fn map(percent: u8) -> u8 {
        SUBMITTED_PERCENT + (u16::from(percent.min(100)) * PROVIDER_SPAN / 100) as u8
    }
}

impl ProgressSink for TaskProgress {
    fn report(&self, percent: u8, message: &str) {
        let mapped = Self::map(percent);
        self.percent.fetch_max(mapped, Ordering::Relaxed);
        self.publisher.publish_status(&self.task_id, TaskStatus::Processing, mapped, message);
    }
}

/// Runs the tasks of one batch against one backend.
#[derive(Clone)]
pub struct TaskExecutor {
    backend: Arc<dyn GenerationBackend>,
    store: Arc<dyn JobStore>,
    publisher: Arc<ProgressPublisher>,
    stager: Arc<dyn SourceStager>,
    retry_policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
    default_deadline: Duration,
    extended_deadline: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("model_type", &self.backend.model_type())
            .field("retry_policy", &self.retry_policy)
            .field("default_deadline", &self.default_deadline)
            .field("extended_deadline", &self.extended_deadline)
            .finish_non_exhaustive()
    }
}

impl TaskExecutor {
    /// Create a new executor.
    ///
    /// # Arguments
    /// * `backend` - Backend every task of the batch is sent to
    /// * `store` - Where task state is written
    /// * `publisher` - Where progress is published
    /// * `stager` - Makes sources fetchable by the backend
    /// * `semaphore` - Shared worker pool
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        store: Arc<dyn JobStore>,
        publisher: Arc<ProgressPublisher>,
        stager: Arc<dyn SourceStager>,
        retry_policy: RetryPolicy,
        semaphore: Arc<Semaphore>,
        default_deadline: Duration,
        extended_deadline: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            publisher,
            stager,
            retry_policy,
            semaphore,
            default_deadline,
            extended_deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` to stop tasks that have not started yet.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deadline applied to each submit call for `params`.
    pub fn deadline_for(&self, request: &GenerationRequest) -> Duration {
        if self.backend.requires_extended_deadline(&request.params) {
            self.extended_deadline
        } else {
            self.default_deadline
        }
    }

    /// Runs one task to a terminal state and returns it.
    pub async fn execute(&self, mut task: TaskState, request: GenerationRequest) -> TaskState {
        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                task.fail(TaskError::new(ErrorKind::Cancelled, "batch cancelled before the task started"));
                return self.finish(task).await;
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            task.fail(TaskError::new(ErrorKind::Internal, "worker pool is closed"));
            return self.finish(task).await;
        };

        debug!(task_id = %task.task_id, item_id = %task.item_id, "Task started");

        // A panicking backend still ends the task through `finish`.
        let outcome = AssertUnwindSafe(self.run(&mut task, &request, permit)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(Failure::Backend(err))) => task.fail(TaskError::from(&err)),
            Ok(Err(Failure::Deadline(deadline))) => task.time_out(TaskError::new(
                ErrorKind::Timeout,
                format!("submit exceeded the {}s deadline", deadline.as_secs_f64()),
            )),
            Err(panic) => task.fail(TaskError::new(
                ErrorKind::Internal,
                format!("task worker panicked: {}", panic_message(panic.as_ref())),
            )),
        }
        self.finish(task).await
    }

    async fn run(
        &self,
        task: &mut TaskState,
        request: &GenerationRequest,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), Failure> {
        self.step(task, TaskStatus::Uploading, UPLOADING_PERCENT, "staging source").await;
        let source_url = self.stager.stage(&request.source_ref).await?;

        self.backend.validate_params(&request.params).map_err(BackendError::from)?;
        let backend_request = self.backend.build_request(&source_url, &request.params)?;
        self.step(task, TaskStatus::Uploading, BUILT_PERCENT, "request built").await;

        let raw = self.submit_with_retry(task, request, &backend_request, permit).await?;
        let output = self.backend.interpret_result(&raw)?;
        task.complete(output);
        Ok(())
    }

    async fn submit_with_retry(
        &self,
        task: &mut TaskState,
        request: &GenerationRequest,
        backend_request: &BackendRequest,
        permit: OwnedSemaphorePermit,
    ) -> Result<serde_json::Value, Failure> {
        let deadline = self.deadline_for(request);
        let mut permit = Some(permit);

        loop {
            if permit.is_none() {
                permit = Some(
                    Arc::clone(&self.semaphore)
                        .acquire_owned()
                        .await
                        .map_err(|_| BackendError::Permanent("worker pool is closed".to_string()))?,
                );
            }

            task.attempt += 1;
            self.step(task, TaskStatus::Submitted, SUBMITTED_PERCENT, "submitted to provider").await;

            let sink = TaskProgress {
                task_id: task.task_id.clone(),
                publisher: Arc::clone(&self.publisher),
                percent: AtomicU8::new(SUBMITTED_PERCENT),
            };
            let result = timeout(deadline, self.backend.submit(backend_request, &sink)).await;
            task.advance(TaskStatus::Processing, sink.percent.load(Ordering::Relaxed));

            let err = match result {
                Ok(Ok(raw)) => return Ok(raw),
                Ok(Err(err)) => err,
                Err(_) => {
                    warn!(task_id = %task.task_id, attempt = task.attempt, deadline_secs = deadline.as_secs(), "Submit deadline expired");
                    return Err(Failure::Deadline(deadline));
                }
            };

            let class = RetryPolicy::classify(&err);
            if !self.retry_policy.should_retry(class, task.attempt) {
                return Err(Failure::Backend(err));
            }

            let delay = self.retry_policy.calculate_delay(task.attempt - 1);
            warn!(
                task_id = %task.task_id,
                attempt = task.attempt,
                class = ?class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after backoff"
            );
            // Free the pool slot while sleeping.
            permit = None;
            tokio::time::sleep(delay).await;
        }
    }

    async fn step(&self, task: &mut TaskState, status: TaskStatus, percent: u8, message: &str) {
        task.advance(status, percent);
        debug!(task_id = %task.task_id, status = %status, percent, "Task step");
        if let Err(e) = self.store.put_task(task).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to record task progress");
        }
        self.publisher.publish_status(&task.task_id, status, percent, message);
    }

    async fn finish(&self, task: TaskState) -> TaskState {
        match &task.error {
            Some(err) => error!(
                task_id = %task.task_id,
                item_id = %task.item_id,
                status = %task.status,
                kind = %err.kind,
                error = %err.message,
                "Task failed"
            ),
            None => debug!(task_id = %task.task_id, item_id = %task.item_id, "Task completed"),
        }

        self.record_terminal(&task).await;

        let message = task.error.as_ref().map_or("completed", |e| e.message.as_str());
        let mut event = ProgressEvent::new(&task.task_id, task.status, task.progress_percent, message);
        event.result_ref.clone_from(&task.result_ref);
        self.publisher.publish_event(event);
        task
    }

    /// Writes a terminal task, retrying transient store failures.
    async fn record_terminal(&self, task: &TaskState) {
        let mut delay = TERMINAL_WRITE_DELAY;
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            match self.store.put_task(task).await {
                Ok(()) => return,
                Err(e @ StoreError::TerminalOverwrite { .. }) => {
                    warn!(task_id = %task.task_id, error = %e, "Terminal task already recorded");
                    return;
                }
                Err(e) if attempt == TERMINAL_WRITE_ATTEMPTS => {
                    error!(task_id = %task.task_id, attempt, error = %e, "Failed to record terminal task state");
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, attempt, error = %e, "Retrying terminal task write");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Why a task did not complete.
enum Failure {
    Backend(BackendError),
    Deadline(Duration),
}

impl From<BackendError> for Failure {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}
