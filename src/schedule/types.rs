use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;
use std::str::FromStr;

/// The business action a task runs. Each variant declares whether it recurs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "test-dm")]
    VerificationDm,
    #[serde(rename = "send-reco-newsletter")]
    RecommendationDigest,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::VerificationDm => "test-dm",
            TaskType::RecommendationDigest => "send-reco-newsletter",
        }
    }

    /// Interval to the next occurrence, `None` for one-shot types.
    pub fn recurrence(&self) -> Option<Duration> {
        match self {
            TaskType::VerificationDm => None,
            TaskType::RecommendationDigest => Some(Duration::days(7)),
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test-dm" => Ok(TaskType::VerificationDm),
            "send-reco-newsletter" => Ok(TaskType::RecommendationDigest),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bluesky,
    Mastodon,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Bluesky => "bluesky",
            Platform::Mastodon => "mastodon",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Bluesky => "Bluesky",
            Platform::Mastodon => "Mastodon",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bluesky" => Ok(Platform::Bluesky),
            "mastodon" => Ok(Platform::Mastodon),
            _ => Err(format!("Invalid platform: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Waiting,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Waiting => "waiting",
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;
    fn try_from(status: String) -> Result<Self, Self::Error> {
        status.parse()
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(status: &str) -> Result<Self, Self::Err> {
        match status {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "waiting" => Ok(TaskStatus::Waiting),
            _ => Err(format!("Invalid task status: {}", status)),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output of one execution attempt.
///
/// `fields` carries whatever the platform reported (e.g. `needs_follow`) and is
/// flattened into the stored JSON object next to `success` and `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A run whose precondition was not met. Counts as a success.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::success()
            .skip()
            .with_field("reason", Value::String(reason.into()))
    }

    pub fn skip(mut self) -> Self {
        self.skipped = true;
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub platform: Platform,
    pub payload: Value,
    pub result: Option<TaskResult>,
    pub error_log: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Task {
    /// Recipient handle carried by the payload.
    pub fn handle(&self) -> Option<&str> {
        self.payload
            .get("handle")
            .and_then(Value::as_str)
            .filter(|handle| !handle.is_empty())
    }

    /// Whether `scheduled_for` has not arrived yet.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(false, |at| at > now)
    }
}

/// Input for inserting a fresh record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: String,
    pub task_type: TaskType,
    pub platform: Platform,
    pub payload: Value,
    pub status: TaskStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn pending(user_id: impl Into<String>, task_type: TaskType, platform: Platform, payload: Value) -> Self {
        Self {
            user_id: user_id.into(),
            task_type,
            platform,
            payload,
            status: TaskStatus::Pending,
            scheduled_for: None,
        }
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}
