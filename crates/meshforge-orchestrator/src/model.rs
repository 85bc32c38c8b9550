//! Task and batch state records.

use chrono::{DateTime, Utc};
use meshforge_abstraction::{BackendError, ErrorKind, GenerationOutput};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Uploading,
    Submitted,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    /// Terminal statuses never change once written.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Wire name of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl BatchStatus {
    /// Whether the batch has finished.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyCompleted | Self::Failed)
    }

    /// Wire name of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes a batch status from its children's statuses.
///
/// Once every child is terminal: all completed is `Completed`, all failed or
/// timed out is `Failed`, anything else is `PartiallyCompleted`. Before that
/// the batch is `Queued` while no child has left the queue and `Processing`
/// afterwards.
pub fn aggregate_status<I>(statuses: I) -> BatchStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut total = 0usize;
    let mut queued = 0usize;
    let mut completed = 0usize;
    let mut unsuccessful = 0usize;

    for status in statuses {
        total += 1;
        match status {
            TaskStatus::Queued => queued += 1,
            TaskStatus::Completed => completed += 1,
            TaskStatus::Failed | TaskStatus::TimedOut => unsuccessful += 1,
            TaskStatus::Uploading | TaskStatus::Submitted | TaskStatus::Processing => {}
        }
    }

    if total == 0 || queued == total {
        BatchStatus::Queued
    } else if completed + unsuccessful < total {
        BatchStatus::Processing
    } else if completed == total {
        BatchStatus::Completed
    } else if unsuccessful == total {
        BatchStatus::Failed
    } else {
        BatchStatus::PartiallyCompleted
    }
}

/// Error recorded on a failed or timed-out task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    /// Stable error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Raw-shape diagnostic for malformed responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl TaskError {
    /// Creates an error without a diagnostic.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), diagnostic: None }
    }
}

impl From<&BackendError> for TaskError {
    fn from(err: &BackendError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            diagnostic: err.diagnostic().map(str::to_string),
        }
    }
}

/// Persistent state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub task_id: String,
    pub job_id: String,
    pub item_id: String,
    pub status: TaskStatus,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<GenerationOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Submit attempts made so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    /// A freshly queued task with a new id.
    pub fn queued(job_id: &str, item_id: &str) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            item_id: item_id.to_string(),
            status: TaskStatus::Queued,
            progress_percent: 0,
            result_ref: None,
            error: None,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves to a non-terminal status, keeping progress monotonic.
    pub fn advance(&mut self, status: TaskStatus, percent: u8) {
        if self.started_at.is_none() && status != TaskStatus::Queued {
            self.started_at = Some(Utc::now());
        }
        self.status = status;
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    /// Finishes the task successfully.
    pub fn complete(&mut self, output: GenerationOutput) {
        self.status = TaskStatus::Completed;
        self.progress_percent = 100;
        self.result_ref = Some(output);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Finishes the task as `failed`.
    pub fn fail(&mut self, error: TaskError) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Finishes the task as `timed_out` after the submit deadline expired.
    pub fn time_out(&mut self, error: TaskError) {
        self.status = TaskStatus::TimedOut;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}

/// Persistent state of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    pub job_id: String,
    pub model_type: String,
    /// Child task ids in submission order.
    pub task_ids: Vec<String>,
    /// Only ever set by [`BatchState::recompute`]. The stored value moves
    /// from `queued` straight to the final status; live status comes from
    /// aggregating the children.
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchState {
    /// A freshly queued batch with a new job id.
    pub fn queued(model_type: &str) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            model_type: model_type.to_string(),
            task_ids: Vec::new(),
            status: BatchStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether the batch has finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Recomputes `status` from the children and stamps completion.
    pub fn recompute<'a, I>(&mut self, tasks: I)
    where
        I: IntoIterator<Item = &'a TaskState>,
    {
        self.status = aggregate_status(tasks.into_iter().map(|t| t.status));
        if self.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::{Completed, Failed, Processing, Queued, TimedOut, Uploading};

    #[test]
    fn test_aggregate_terminal_rule() {
        assert_eq!(aggregate_status([Completed, Completed]), BatchStatus::Completed);
        assert_eq!(aggregate_status([Failed, TimedOut]), BatchStatus::Failed);
        assert_eq!(aggregate_status([Completed, TimedOut]), BatchStatus::PartiallyCompleted);
        assert_eq!(
            aggregate_status([Completed, Completed, Completed, Failed, Completed]),
            BatchStatus::PartiallyCompleted
        );
    }

    #[test]
    fn test_aggregate_single_item_uses_same_rule() {
        assert_eq!(aggregate_status([Completed]), BatchStatus::Completed);
        assert_eq!(aggregate_status([Failed]), BatchStatus::Failed);
        assert_eq!(aggregate_status([TimedOut]), BatchStatus::Failed);
    }

    #[test]
    fn test_aggregate_in_flight() {
        assert_eq!(aggregate_status([Queued, Queued]), BatchStatus::Queued);
        assert_eq!(aggregate_status([Queued, Uploading]), BatchStatus::Processing);
        assert_eq!(aggregate_status([Completed, Processing]), BatchStatus::Processing);
        assert_eq!(aggregate_status([Completed, Queued]), BatchStatus::Processing);
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let forward = aggregate_status([Completed, Failed, Completed]);
        let reverse = aggregate_status([Completed, Failed, Completed].into_iter().rev());
        assert_eq!(forward, reverse);
        assert_eq!(forward, aggregate_status([Completed, Failed, Completed]));
    }

    #[test]
    fn test_advance_keeps_progress_monotonic() {
        let mut task = TaskState::queued("job", "item");
        task.advance(TaskStatus::Processing, 40);
        task.advance(TaskStatus::Processing, 20);
        assert_eq!(task.progress_percent, 40);
        assert!(task.started_at.is_some());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(TimedOut).unwrap(), "timed_out");
        assert_eq!(
            serde_json::to_value(BatchStatus::PartiallyCompleted).unwrap(),
            "partially_completed"
        );
    }

    #[test]
    fn test_task_error_from_backend_error() {
        let err = BackendError::malformed("no output", &serde_json::json!({"status": "ok"}));
        let task_error = TaskError::from(&err);
        assert_eq!(task_error.kind, ErrorKind::MalformedResponse);
        assert_eq!(task_error.diagnostic.as_deref(), Some("object{status: string}"));
    }
}
