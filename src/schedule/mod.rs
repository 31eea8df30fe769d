pub mod processors;
pub mod scheduler;
pub mod source;
pub mod types;
#[cfg(test)]
mod tests;

use std::sync::Arc;

pub use types::{NewTask, Platform, Task, TaskResult, TaskStatus, TaskType};

pub use crate::storage::task::TaskStore;

pub use processors::{
    Messenger, RecommendationDigestProcessor, ScriptMessenger, TaskProcessor, VerificationDmProcessor,
};

pub use scheduler::{Outcome, RetryExecutor, Rescheduler, StalledTaskRecovery, TaskScheduler, TaskWorker, WorkerSettings};
pub use source::{FallbackSource, PrioritySource, TaskConsumer, TaskSource};

/// Registers both DM processors on a fresh executor.
pub fn create_executor(
    store: Arc<dyn TaskStore>,
    messenger: Arc<dyn Messenger>,
    backoff_base: std::time::Duration,
) -> RetryExecutor {
    let mut executor = RetryExecutor::new(store, backoff_base);
    executor.register_processor(Box::new(VerificationDmProcessor::new(messenger.clone())));
    executor.register_processor(Box::new(RecommendationDigestProcessor::new(messenger)));
    executor
}
