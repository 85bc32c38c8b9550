//! Process-local job store.

use super::{JobStore, StoreError, StoreResult, WriteCheck, check_write, order_tasks};
use crate::model::{BatchState, TaskState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type Cell<T> = Arc<Mutex<Option<T>>>;

/// In-memory [`JobStore`] with one lock per record.
///
/// The outer map lock is held only to look up or insert a record's cell, so
/// writers to different records never wait on each other.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tasks: RwLock<HashMap<String, Cell<TaskState>>>,
    batches: RwLock<HashMap<String, Cell<BatchState>>>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell<T>(map: &RwLock<HashMap<String, Cell<T>>>, key: &str) -> Cell<T> {
        if let Some(cell) = map.read().await.get(key) {
            return Arc::clone(cell);
        }
        let mut map = map.write().await;
        Arc::clone(map.entry(key.to_string()).or_default())
    }

    async fn read<T: Clone>(map: &RwLock<HashMap<String, Cell<T>>>, key: &str) -> Option<T> {
        let cell = map.read().await.get(key).cloned()?;
        cell.lock().await.clone()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put_task(&self, task: &TaskState) -> StoreResult<()> {
        let cell = Self::cell(&self.tasks, &task.task_id).await;
        let mut slot = cell.lock().await;
        if check_write("task", &task.task_id, slot.as_ref(), task, TaskState::is_terminal)?
            == WriteCheck::Write
        {
            *slot = Some(task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<TaskState>> {
        Ok(Self::read(&self.tasks, task_id).await)
    }

    async fn put_batch(&self, batch: &BatchState) -> StoreResult<()> {
        let cell = Self::cell(&self.batches, &batch.job_id).await;
        let mut slot = cell.lock().await;
        if check_write("batch", &batch.job_id, slot.as_ref(), batch, BatchState::is_terminal)?
            == WriteCheck::Write
        {
            *slot = Some(batch.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, job_id: &str) -> StoreResult<Option<BatchState>> {
        Ok(Self::read(&self.batches, job_id).await)
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<TaskState>> {
        let batch = self
            .get_batch(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", job_id)))?;

        let mut tasks = Vec::with_capacity(batch.task_ids.len());
        for id in &batch.task_ids {
            if let Some(task) = Self::read(&self.tasks, id).await {
                tasks.push(task);
            }
        }
        order_tasks(&batch.task_ids, tasks)
    }
}
