mod executor;
mod recovery;
mod rescheduler;
mod worker;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use executor::{backoff_delay, Execution, Outcome, RetryExecutor, DEFAULT_ATTEMPT_TIMEOUT};
pub use recovery::{stalled_cutoff, StalledTaskRecovery};
pub use rescheduler::Rescheduler;
pub use worker::{TaskWorker, WorkerSettings};

/// Owns the spawned worker loops and the shutdown switch they listen on.
pub struct TaskScheduler {
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub async fn spawn_worker(&self, worker: TaskWorker) {
        info!(worker_id = %worker.worker_id(), "Spawning worker");
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            worker.run(shutdown).await;
        });
        self.workers.lock().await.push(handle);
    }

    /// Asks every worker to stop after its current task.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
    }

    /// Waits for every spawned worker to exit.
    pub async fn run(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                error!("Worker exited abnormally: {}", e);
            }
        }
    }
}
