use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;

/// One row of the task table, as both backends return it.
///
/// Enum columns stay strings here; `mapping` validates them into domain types.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub task_type: String,
    pub platform: String,
    pub payload: Json<Value>,
    pub result: Option<Json<Value>>,
    pub error_log: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
}
