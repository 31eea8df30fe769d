use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use super::entity::TaskRow;
use super::mapping::{result_to_json, rows_to_tasks};
use super::TaskStore;
use crate::schedule::types::{NewTask, Task, TaskResult, TaskStatus};

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing SQLite task storage at {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid sqlite url: {}", database_url))?;
        Self::with_options(options).await
    }

    pub async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        // WAL lets pollers read while another worker holds the write lock.
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                task_type TEXT NOT NULL,
                platform TEXT NOT NULL,
                payload TEXT NOT NULL,
                result TEXT,
                error_log TEXT,
                worker_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                scheduled_for TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks (status, created_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &NewTask) -> Result<Task> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks
            (id, user_id, status, task_type, platform, payload, created_at, updated_at, scheduled_for)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&task.user_id)
        .bind(task.status.as_str())
        .bind(task.task_type.as_str())
        .bind(task.platform.as_str())
        .bind(Json(task.payload.clone()))
        .bind(now)
        .bind(now)
        .bind(task.scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        Task::try_from(row)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        // A single write statement takes the database write lock up front, so
        // the inner select and the update cannot interleave with another claim.
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'processing', worker_id = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                AND (scheduled_for IS NULL OR scheduled_for <= ?)
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn mark_processing(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'processing', worker_id = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'waiting')
            "#,
        )
        .bind(worker_id)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ? AND status = 'processing'")
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
        error_log: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                result = ?,
                error_log = ?,
                worker_id = CASE WHEN ? = 'pending' THEN NULL ELSE worker_id END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(result_to_json(result)?)
        .bind(error_log)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', worker_id = NULL, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'waiting')
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_pending(&self, task: &Task) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks
            (id, user_id, status, task_type, platform, payload, created_at, updated_at, scheduled_for)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(task.task_type.as_str())
        .bind(task.platform.as_str())
        .bind(Json(task.payload.clone()))
        .bind(task.created_at)
        .bind(Utc::now())
        .bind(task.scheduled_for)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', worker_id = NULL, updated_at = ?
            WHERE status = 'processing' AND updated_at < ?
            "#,
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }
}

#[cfg(test)]
impl SqliteTaskStore {
    /// Store backed by a fresh database file that lives as long as the returned dir.
    pub(crate) async fn temporary() -> Result<(Self, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}", dir.path().join("tasks.db").display());
        Ok((Self::new(&url).await?, dir))
    }
}
