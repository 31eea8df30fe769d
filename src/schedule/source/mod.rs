pub mod fallback;
pub mod priority;

use async_trait::async_trait;
use tracing::debug;

use crate::schedule::types::Task;

pub use fallback::FallbackSource;
pub use priority::PrioritySource;

/// One place a worker can take work from. Sources swallow their own transport
/// errors and report them as "nothing available".
#[async_trait]
pub trait TaskSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn try_next(&self, worker_id: &str) -> Option<Task>;
}

/// Asks each source in order and hands back the first task found.
pub struct TaskConsumer {
    sources: Vec<Box<dyn TaskSource>>,
}

impl TaskConsumer {
    pub fn new(priority: Option<PrioritySource>, fallback: FallbackSource) -> Self {
        let mut sources: Vec<Box<dyn TaskSource>> = Vec::with_capacity(2);
        if let Some(priority) = priority {
            sources.push(Box::new(priority));
        }
        sources.push(Box::new(fallback));
        Self { sources }
    }

    pub async fn next_task(&self, worker_id: &str) -> Option<Task> {
        for source in &self.sources {
            if let Some(task) = source.try_next(worker_id).await {
                debug!(worker_id, task_id = %task.id, source = source.name(), "Consumed task");
                return Some(task);
            }
        }
        None
    }
}
