pub mod direct_message;
pub mod messenger;

use async_trait::async_trait;
use anyhow::Result;
use crate::schedule::types::{Task, TaskResult, TaskType};

pub use direct_message::{RecommendationDigestProcessor, VerificationDmProcessor};
pub use messenger::{Messenger, ScriptMessenger};

/// Business action behind one task type.
///
/// `Ok` with `success == false` is a business failure the executor retries;
/// `Err` is treated the same way.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn task_type(&self) -> TaskType;
    async fn process(&self, task: &Task) -> Result<TaskResult>;
}
