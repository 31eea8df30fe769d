#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;
use dm_worker::config::WorkerConfig;
use dm_worker::schedule::{
    create_executor, FallbackSource, PrioritySource, ScriptMessenger, TaskConsumer, TaskScheduler, TaskWorker,
    WorkerSettings,
};
use dm_worker::storage::queue::{PriorityQueue, RedisPriorityQueue};
use dm_worker::storage::task;
use dm_worker::utils::{logger, shutdown::shutdown_signal};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = WorkerConfig::from_env()?;
    let _guard = logger::init(&config.log_dir)?;

    info!(
        worker_id = %config.worker_id,
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "Starting DM worker..."
    );

    if let Some(db_path) = config.database_url.strip_prefix("sqlite://") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(dir) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(dir)?;
        }
    }

    info!("Initializing task storage...");
    let store = task::connect(&config.database_url).await?;

    let priority = match &config.redis_url {
        Some(url) => {
            info!("Initializing priority queue...");
            let queue: Arc<dyn PriorityQueue> = Arc::new(RedisPriorityQueue::new(url).await?);
            Some(PrioritySource::new(
                queue,
                store.clone(),
                config.queue_prefix.clone(),
                config.pop_timeout,
            ))
        }
        None => {
            warn!("REDIS_URL not set, consuming from the task store only");
            None
        }
    };
    let consumer = TaskConsumer::new(priority, FallbackSource::new(store.clone()));

    let messenger = Arc::new(ScriptMessenger::new(config.python.clone(), config.script_dir.clone()));
    let executor = create_executor(store.clone(), messenger, config.retry_backoff_base)
        .with_attempt_timeout(config.attempt_timeout);

    let worker = TaskWorker::new(
        config.worker_id.clone(),
        consumer,
        executor,
        store,
        WorkerSettings::from(&config),
    );

    let scheduler = Arc::new(TaskScheduler::new());
    scheduler.spawn_worker(worker).await;

    tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            shutdown_signal().await;
            scheduler.shutdown();
        }
    });

    scheduler.run().await;
    info!("DM worker stopped");

    Ok(())
}
