//! Job and task state repository.
//!
//! Non-terminal writes are last-writer-wins. Once a record is terminal it can
//! only be re-written with an identical value; anything else is rejected with
//! [`StoreError::TerminalOverwrite`].

mod memory;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

use crate::model::{BatchState, TaskState};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur in the job store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A write tried to change a record that is already terminal.
    #[error("Refusing to overwrite terminal {record} '{id}'")]
    TerminalOverwrite {
        /// `task` or `batch`.
        record: &'static str,
        /// Record id.
        id: String,
    },

    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking database call could not be completed.
    #[error("Store worker failed: {0}")]
    Worker(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Repository for batch and task state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts or replaces a task record.
    async fn put_task(&self, task: &TaskState) -> StoreResult<()>;

    /// Gets a task by id.
    async fn get_task(&self, task_id: &str) -> StoreResult<Option<TaskState>>;

    /// Inserts or replaces a batch record.
    async fn put_batch(&self, batch: &BatchState) -> StoreResult<()>;

    /// Gets a batch by job id.
    async fn get_batch(&self, job_id: &str) -> StoreResult<Option<BatchState>>;

    /// Lists a batch's tasks in the batch's `task_ids` order.
    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<TaskState>>;
}

/// Outcome of checking a write against the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteCheck {
    /// Store the incoming value.
    Write,
    /// Identical re-write of a terminal record.
    Unchanged,
}

/// Applies the terminal-overwrite rule shared by every store.
pub(crate) fn check_write<T: PartialEq>(
    record: &'static str,
    id: &str,
    existing: Option<&T>,
    incoming: &T,
    is_terminal: impl Fn(&T) -> bool,
) -> StoreResult<WriteCheck> {
    match existing {
        Some(current) if is_terminal(current) => {
            if current == incoming {
                Ok(WriteCheck::Unchanged)
            } else {
                warn!(record, id = %id, "Rejected write over terminal record");
                Err(StoreError::TerminalOverwrite { record, id: id.to_string() })
            }
        }
        _ => Ok(WriteCheck::Write),
    }
}

/// Orders `tasks` by `task_ids`, failing if one is missing.
pub(crate) fn order_tasks(task_ids: &[String], mut tasks: Vec<TaskState>) -> StoreResult<Vec<TaskState>> {
    let mut ordered = Vec::with_capacity(task_ids.len());
    for id in task_ids {
        let index = tasks
            .iter()
            .position(|t| &t.task_id == id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        ordered.push(tasks.swap_remove(index));
    }
    Ok(ordered)
}
