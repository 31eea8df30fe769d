use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::schedule::types::{NewTask, Task, TaskResult, TaskStatus};

pub mod entity;
pub mod mapping;
pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;

/// The durable system of record for tasks.
///
/// `claim_next` is the only exclusion primitive of the whole worker fleet: an
/// implementation must move exactly one row from `pending` to `processing` in a
/// single atomic step, so two workers can never both receive the same row.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn insert(&self, task: &NewTask) -> Result<Task>;
    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Claims the oldest pending row that is due at `now`.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>>;

    /// Advisory `processing` mark for tasks that arrived through the priority
    /// queue. Only touches rows still `pending` or `waiting`; returns whether a
    /// row changed.
    async fn mark_processing(&self, task_id: &str, worker_id: &str) -> Result<bool>;

    /// Refreshes `updated_at` of a row still in `processing`.
    async fn touch(&self, task_id: &str) -> Result<()>;

    /// Writes status, result and error log. Moving back to `pending` clears
    /// `worker_id`. Returns whether a row changed.
    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
        error_log: Option<&str>,
    ) -> Result<bool>;

    /// Returns a not-yet-due row to `pending` and clears its owner. Only rows
    /// still `pending` or `waiting` move; returns whether one did.
    async fn release(&self, task_id: &str) -> Result<bool>;

    /// Persists `task` as a `pending` row under its own id. Returns `false`
    /// when a row with that id already exists, leaving it untouched.
    async fn insert_pending(&self, task: &Task) -> Result<bool>;

    /// Resets `processing` rows last updated before `cutoff` to `pending`.
    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
}

/// Opens the store matching the URL scheme.
pub async fn connect(database_url: &str) -> Result<Arc<dyn TaskStore>> {
    if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
        Ok(Arc::new(PostgresTaskStore::new(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteTaskStore::new(database_url).await?))
    } else {
        Err(anyhow::anyhow!("Unsupported database url: {}", database_url))
    }
}
