use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::entity::TaskRow;
use super::mapping::{result_to_json, rows_to_tasks};
use super::TaskStore;
use crate::schedule::types::{NewTask, Task, TaskResult, TaskStatus};

pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing Postgres task storage");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS python_tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                task_type TEXT NOT NULL,
                platform TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                result JSONB,
                error_log TEXT,
                worker_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                scheduled_for TIMESTAMPTZ
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_python_tasks_status_created ON python_tasks (status, created_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(&self, task: &NewTask) -> Result<Task> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO python_tasks
            (id, user_id, status, task_type, platform, payload, created_at, updated_at, scheduled_for)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8)
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
        .bind(task.scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        Task::try_from(row)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM python_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        // SKIP LOCKED lets concurrent claimers pass over a row another
        // transaction is already taking instead of queueing behind it.
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            WITH next_task AS (
                SELECT id
                FROM python_tasks
                WHERE status = 'pending'
                  AND (scheduled_for IS NULL OR scheduled_for <= $2)
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE python_tasks t
            SET status = 'processing', worker_id = $1, updated_at = $2
            FROM next_task
            WHERE t.id = next_task.id AND t.status = 'pending'
            RETURNING t.*
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn mark_processing(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE python_tasks
            SET status = 'processing', worker_id = $1, updated_at = now()
            WHERE id = $2 AND status IN ('pending', 'waiting')
            "#,
        )
        .bind(worker_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE python_tasks SET updated_at = now() WHERE id = $1 AND status = 'processing'")
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
            UPDATE python_tasks
            SET status = $1,
                result = $2,
                error_log = $3,
                worker_id = CASE WHEN $1 = 'pending' THEN NULL ELSE worker_id END,
                updated_at = now()
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(result_to_json(result)?)
        .bind(error_log)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE python_tasks
            SET status = 'pending', worker_id = NULL, updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'waiting')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_pending(&self, task: &Task) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO python_tasks
            (id, user_id, status, task_type, platform, payload, created_at, updated_at, scheduled_for)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, now(), $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(task.task_type.as_str())
        .bind(task.platform.as_str())
        .bind(Json(task.payload.clone()))
        .bind(task.created_at)
        .bind(task.scheduled_for)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE python_tasks
            SET status = 'pending', worker_id = NULL, updated_at = now()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM python_tasks WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }
}
