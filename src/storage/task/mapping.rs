use anyhow::{Context, Result};

use crate::schedule::types::{Task, TaskResult};
use crate::storage::task::entity::TaskRow;

impl TryFrom<TaskRow> for Task {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let result = row
            .result
            .map(|r| serde_json::from_value::<TaskResult>(r.0))
            .transpose()
            .with_context(|| format!("Invalid result column for task {}", row.id))?;

        Ok(Task {
            status: row.status.parse().map_err(anyhow::Error::msg)?,
            task_type: row.task_type.parse().map_err(anyhow::Error::msg)?,
            platform: row.platform.parse().map_err(anyhow::Error::msg)?,
            id: row.id,
            user_id: row.user_id,
            payload: row.payload.0,
            result,
            error_log: row.error_log,
            worker_id: row.worker_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            scheduled_for: row.scheduled_for,
        })
    }
}

pub(crate) fn rows_to_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

pub(crate) fn result_to_json(result: Option<&TaskResult>) -> Result<Option<sqlx::types::Json<serde_json::Value>>> {
    Ok(result
        .map(serde_json::to_value)
        .transpose()?
        .map(sqlx::types::Json))
}
