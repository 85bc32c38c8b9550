//! SQLite-backed job store.
//!
//! Records are stored as JSON next to a few indexed columns. All database
//! work runs on the blocking pool; the terminal-overwrite check and the write
//! happen in one transaction.

use super::{JobStore, StoreError, StoreResult, WriteCheck, check_write, order_tasks};
use crate::model::{BatchState, TaskState};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// [`JobStore`] persisted to a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    /// * `StoreError::Database` - If the connection or schema creation fails
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        info!("Initializing job store schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                job_id TEXT PRIMARY KEY,
                model_type TEXT NOT NULL,
                status TEXT NOT NULL,
                state_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                state_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id);
            "#,
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    fn load_task(conn: &Connection, task_id: &str) -> StoreResult<Option<TaskState>> {
        let json: Option<String> = conn
            .query_row("SELECT state_json FROM tasks WHERE task_id = ?1", params![task_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    fn load_batch(conn: &Connection, job_id: &str) -> StoreResult<Option<BatchState>> {
        let json: Option<String> = conn
            .query_row("SELECT state_json FROM batches WHERE job_id = ?1", params![job_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn put_task(&self, task: &TaskState) -> StoreResult<()> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing = Self::load_task(&tx, &task.task_id)?;
            if check_write("task", &task.task_id, existing.as_ref(), &task, TaskState::is_terminal)?
                == WriteCheck::Write
            {
                tx.execute(
                    r#"
                    INSERT INTO tasks (task_id, job_id, status, state_json)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(task_id) DO UPDATE SET
                        status = excluded.status,
                        state_json = excluded.state_json
                    "#,
                    params![
                        task.task_id,
                        task.job_id,
                        task.status.as_str(),
                        serde_json::to_string(&task)?
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<TaskState>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| Self::load_task(conn, &task_id)).await
    }

    async fn put_batch(&self, batch: &BatchState) -> StoreResult<()> {
        let batch = batch.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing = Self::load_batch(&tx, &batch.job_id)?;
            if check_write("batch", &batch.job_id, existing.as_ref(), &batch, BatchState::is_terminal)?
                == WriteCheck::Write
            {
                tx.execute(
                    r#"
                    INSERT INTO batches (job_id, model_type, status, state_json)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(job_id) DO UPDATE SET
                        status = excluded.status,
                        state_json = excluded.state_json
                    "#,
                    params![
                        batch.job_id,
                        batch.model_type,
                        batch.status.as_str(),
                        serde_json::to_string(&batch)?
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_batch(&self, job_id: &str) -> StoreResult<Option<BatchState>> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| Self::load_batch(conn, &job_id)).await
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<TaskState>> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let batch = Self::load_batch(conn, &job_id)?
                .ok_or_else(|| StoreError::NotFound(format!("batch {}", job_id)))?;

            let mut stmt = conn.prepare("SELECT state_json FROM tasks WHERE job_id = ?1")?;
            let rows = stmt.query_map(params![job_id], |row| row.get::<_, String>(0))?;
            let mut tasks = Vec::with_capacity(batch.task_ids.len());
            for json in rows {
                tasks.push(serde_json::from_str::<TaskState>(&json?)?);
            }
            order_tasks(&batch.task_ids, tasks)
        })
        .await
    }
}
