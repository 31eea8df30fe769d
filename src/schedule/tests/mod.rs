use super::*;
use crate::schedule::scheduler::backoff_delay;
use crate::storage::queue::{InMemoryPriorityQueue, PriorityQueue};
use crate::storage::task::{InMemoryTaskStore, SqliteTaskStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Fails the first `failures` sends, then succeeds. Records when each send happened.
struct FlakyMessenger {
    failures: usize,
    calls: Mutex<Vec<Instant>>,
}

impl FlakyMessenger {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for FlakyMessenger {
    async fn send_dm(&self, _platform: Platform, _handle: &str, _message: Option<&str>) -> Result<TaskResult> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(Instant::now());
        if calls.len() <= self.failures {
            Ok(TaskResult::failure("platform unavailable"))
        } else {
            Ok(TaskResult::success())
        }
    }
}

struct ErroringProcessor;

#[async_trait]
impl TaskProcessor for ErroringProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::VerificationDm
    }

    async fn process(&self, _task: &Task) -> Result<TaskResult> {
        Err(anyhow!("script crashed"))
    }
}

/// Never finishes, like a DM script stuck on a dead connection.
struct HangingProcessor;

#[async_trait]
impl TaskProcessor for HangingProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::VerificationDm
    }

    async fn process(&self, _task: &Task) -> Result<TaskResult> {
        std::future::pending::<Result<TaskResult>>().await
    }
}

/// Store whose first status write fails, as if the database dropped out once.
struct FailOnceStore {
    inner: InMemoryTaskStore,
    failed: AtomicBool,
}

impl FailOnceStore {
    fn new() -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            failed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskStore for FailOnceStore {
    async fn insert(&self, task: &NewTask) -> Result<Task> {
        self.inner.insert(task).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.inner.get(task_id).await
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        self.inner.claim_next(worker_id, now).await
    }

    async fn mark_processing(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        self.inner.mark_processing(task_id, worker_id).await
    }

    async fn touch(&self, task_id: &str) -> Result<()> {
        self.inner.touch(task_id).await
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
        error_log: Option<&str>,
    ) -> Result<bool> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.inner.update_status(task_id, status, result, error_log).await
    }

    async fn release(&self, task_id: &str) -> Result<bool> {
        self.inner.release(task_id).await
    }

    async fn insert_pending(&self, task: &Task) -> Result<bool> {
        self.inner.insert_pending(task).await
    }

    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.recover_stalled(cutoff).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.inner.list_by_status(status).await
    }
}

fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        idle_interval: Duration::from_millis(10),
        busy_interval: Duration::from_millis(1),
        error_backoff_factor: 2,
        stalled_threshold: Duration::from_secs(60),
        max_attempts: 3,
        jitter_min: Duration::ZERO,
        jitter_max: Duration::ZERO,
    }
}

fn build_worker(
    store: Arc<dyn TaskStore>,
    queue: Option<Arc<dyn PriorityQueue>>,
    messenger: Arc<dyn Messenger>,
    settings: WorkerSettings,
) -> TaskWorker {
    let priority = queue.map(|queue| {
        PrioritySource::new(queue, store.clone(), "consent_tasks", Duration::from_millis(10))
    });
    let consumer = TaskConsumer::new(priority, FallbackSource::new(store.clone()));
    let executor = create_executor(store.clone(), messenger, Duration::from_millis(1));
    TaskWorker::new("worker-test", consumer, executor, store, settings)
}

fn dm(handle: &str) -> NewTask {
    NewTask::pending("user-1", TaskType::VerificationDm, Platform::Bluesky, json!({ "handle": handle }))
}

fn digest(count: u64) -> NewTask {
    NewTask::pending(
        "user-1",
        TaskType::RecommendationDigest,
        Platform::Mastodon,
        json!({ "handle": "@a@b.social", "recommendation_count": count }),
    )
}

#[tokio::test]
async fn test_happy_path_completes_one_shot_task() -> Result<()> {
    let (store, _dir) = SqliteTaskStore::temporary().await?;
    let store: Arc<dyn TaskStore> = Arc::new(store);
    let messenger = FlakyMessenger::new(0);
    let worker = build_worker(store.clone(), None, messenger.clone(), fast_settings());

    let task = store.insert(&dm("alice")).await?;
    assert!(worker.process_next_task().await?);

    let stored = store.get(&task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result, Some(TaskResult::success()));
    assert_eq!(stored.worker_id.as_deref(), Some("worker-test"));
    assert!(stored.error_log.is_none());
    assert_eq!(messenger.calls().len(), 1);

    // one-shot: nothing queued behind it
    assert!(store.list_by_status(TaskStatus::Pending).await?.is_empty());
    assert!(!worker.process_next_task().await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_backs_off_exponentially() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let messenger = FlakyMessenger::always_failing();
    let executor = create_executor(store.clone(), messenger.clone(), Duration::from_secs(1));

    store.insert(&dm("alice")).await?;
    let task = store.claim_next("worker-test", Utc::now()).await?.unwrap();

    let execution = executor.run_with_retry(&task, "worker-test", 3).await?;
    assert_eq!(
        execution.outcome,
        Outcome::Failed {
            error: "platform unavailable".to_string(),
            attempts: 3
        }
    );
    assert!(execution.successor.is_none());

    let calls = messenger.calls();
    assert_eq!(calls.len(), 3);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= backoff_delay(Duration::from_secs(1), 1));
    assert!(gaps[1] >= backoff_delay(Duration::from_secs(1), 2));
    assert!(gaps[1] >= gaps[0]);

    let stored = store.get(&task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error_log.as_deref(), Some("platform unavailable"));
    assert_eq!(stored.result, Some(TaskResult::failure("platform unavailable")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failure() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let messenger = FlakyMessenger::new(1);
    let executor = create_executor(store.clone(), messenger.clone(), Duration::from_secs(1));

    store.insert(&dm("alice")).await?;
    let task = store.claim_next("worker-test", Utc::now()).await?.unwrap();

    let execution = executor.run_with_retry(&task, "worker-test", 3).await?;
    assert!(execution.outcome.is_completed());
    assert_eq!(execution.outcome.attempts(), 2);
    assert_eq!(messenger.calls().len(), 2);
    assert_eq!(store.get(&task.id).await?.unwrap().status, TaskStatus::Completed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_processor_errors_and_zero_attempts() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let mut executor = RetryExecutor::new(store.clone(), Duration::from_secs(1));
    executor.register_processor(Box::new(ErroringProcessor));

    store.insert(&dm("alice")).await?;
    let task = store.claim_next("worker-test", Utc::now()).await?.unwrap();

    // zero is clamped to a single attempt
    let execution = executor.run_with_retry(&task, "worker-test", 0).await?;
    assert_eq!(execution.outcome.attempts(), 1);

    let stored = store.get(&task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error_log.as_deref(), Some("script crashed"));
    assert_eq!(stored.result.unwrap().error.as_deref(), Some("script crashed"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_processor_fails_task() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let executor = RetryExecutor::new(store.clone(), Duration::from_secs(1));

    store.insert(&digest(3)).await?;
    let task = store.claim_next("worker-test", Utc::now()).await?.unwrap();

    let execution = executor.run_with_retry(&task, "worker-test", 2).await?;
    match execution.outcome {
        Outcome::Failed { error, attempts } => {
            assert!(error.contains("No processor found"));
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    // still recurring, so the next occurrence is queued
    assert!(execution.successor.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_recurring_failure_still_schedules_successor() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let messenger = FlakyMessenger::always_failing();
    let executor = create_executor(store.clone(), messenger.clone(), Duration::from_secs(1));

    let due = Utc::now() - ChronoDuration::minutes(1);
    store.insert(&digest(4).scheduled_for(due)).await?;
    let task = store.claim_next("worker-test", Utc::now()).await?.unwrap();

    let execution = executor.run_with_retry(&task, "worker-test", 3).await?;
    assert!(!execution.outcome.is_completed());
    assert_eq!(messenger.calls().len(), 3);

    let successor = execution.successor.unwrap();
    assert_ne!(successor.id, task.id);
    assert_eq!(successor.status, TaskStatus::Pending);
    assert_eq!(successor.task_type, TaskType::RecommendationDigest);
    assert_eq!(successor.payload, task.payload);
    assert_eq!(successor.scheduled_for, Some(due + ChronoDuration::days(7)));

    assert_eq!(store.get(&task.id).await?.unwrap().status, TaskStatus::Failed);
    let pending = store.list_by_status(TaskStatus::Pending).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, successor.id);

    // the successor is not due for a week
    assert!(store.claim_next("worker-test", Utc::now()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_digest_without_recommendations_skips_and_reschedules() -> Result<()> {
    let (store, _dir) = SqliteTaskStore::temporary().await?;
    let store: Arc<dyn TaskStore> = Arc::new(store);
    let messenger = FlakyMessenger::new(0);
    let worker = build_worker(store.clone(), None, messenger.clone(), fast_settings());

    let before = Utc::now();
    let task = store.insert(&digest(0)).await?;
    assert!(worker.process_next_task().await?);

    let stored = store.get(&task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    let result = stored.result.unwrap();
    assert!(result.success);
    assert!(result.skipped);
    assert!(messenger.calls().is_empty());

    let pending = store.list_by_status(TaskStatus::Pending).await?;
    assert_eq!(pending.len(), 1);
    let next_at = pending[0].scheduled_for.unwrap();
    assert!(next_at >= before + ChronoDuration::days(7));
    assert!(next_at <= Utc::now() + ChronoDuration::days(7));
    Ok(())
}

#[tokio::test]
async fn test_future_queued_task_is_deferred() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let queue = Arc::new(InMemoryPriorityQueue::new());
    let messenger = FlakyMessenger::new(0);
    let worker = build_worker(store.clone(), Some(queue.clone()), messenger.clone(), fast_settings());

    let later = Utc::now() + ChronoDuration::hours(2);
    let row = store.insert(&dm("alice").scheduled_for(later)).await?;
    queue
        .push(
            "consent_tasks:2024-01-02",
            &json!({
                "id": row.id,
                "user_id": "user-1",
                "task_type": "test-dm",
                "platform": "bluesky",
                "handle": "alice",
                "scheduled_for": later,
            })
            .to_string(),
        )
        .await?;

    assert!(worker.process_next_task().await?);
    tokio::task::yield_now().await;

    assert!(messenger.calls().is_empty());
    let stored = store.get(&row.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert!(stored.worker_id.is_none());
    assert!(stored.result.is_none());
    Ok(())
}

#[tokio::test]
async fn test_queued_task_runs_before_stored_backlog() -> Result<()> {
    let (store, _dir) = SqliteTaskStore::temporary().await?;
    let store: Arc<dyn TaskStore> = Arc::new(store);
    let queue = Arc::new(InMemoryPriorityQueue::new());
    let messenger = FlakyMessenger::new(0);
    let worker = build_worker(store.clone(), Some(queue.clone()), messenger, fast_settings());

    let backlog = store.insert(&dm("bob")).await?;
    let urgent = store.insert(&dm("alice")).await?;
    queue
        .push(
            "consent_tasks:2024-01-02",
            &json!({
                "id": urgent.id,
                "user_id": "user-1",
                "task_type": "test-dm",
                "platform": "bluesky",
                "handle": "alice",
                "status": "pending",
            })
            .to_string(),
        )
        .await?;

    assert!(worker.process_next_task().await?);
    assert_eq!(store.get(&urgent.id).await?.unwrap().status, TaskStatus::Completed);
    assert_eq!(store.get(&backlog.id).await?.unwrap().status, TaskStatus::Pending);

    // give the detached processing mark a chance to land; it must not undo completion
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get(&urgent.id).await?.unwrap().status, TaskStatus::Completed);

    assert!(worker.process_next_task().await?);
    assert_eq!(store.get(&backlog.id).await?.unwrap().status, TaskStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_scheduler_loop_recovers_and_drains_until_shutdown() -> Result<()> {
    let (sqlite, _dir) = SqliteTaskStore::temporary().await?;
    let stalled = sqlite.insert(&dm("stalled")).await?;
    sqlite.mark_processing(&stalled.id, "crashed-worker").await?;
    sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
        .bind(Utc::now() - ChronoDuration::minutes(10))
        .bind(&stalled.id)
        .execute(sqlite.pool())
        .await?;
    let fresh = sqlite.insert(&dm("fresh")).await?;

    let store: Arc<dyn TaskStore> = Arc::new(sqlite);
    let messenger = FlakyMessenger::new(0);
    let scheduler = Arc::new(TaskScheduler::new());
    scheduler
        .spawn_worker(build_worker(store.clone(), None, messenger.clone(), fast_settings()))
        .await;

    let runner = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let completed = store.list_by_status(TaskStatus::Completed).await?;
        if completed.len() == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "worker did not drain the store");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner).await??;

    for id in [&stalled.id, &fresh.id] {
        let task = store.get(id).await?.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.worker_id.as_deref(), Some("worker-test"));
    }
    assert_eq!(messenger.calls().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_future_queued_task_without_row_is_stored() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let queue = Arc::new(InMemoryPriorityQueue::new());
    let messenger = FlakyMessenger::new(0);
    let worker = build_worker(store.clone(), Some(queue.clone()), messenger.clone(), fast_settings());

    let later = Utc::now() + ChronoDuration::hours(2);
    queue
        .push(
            "consent_tasks:2024-01-02",
            &json!({
                "id": "queued-only",
                "user_id": "user-1",
                "task_type": "test-dm",
                "platform": "bluesky",
                "handle": "alice",
                "scheduled_for": later,
            })
            .to_string(),
        )
        .await?;

    assert!(worker.process_next_task().await?);
    tokio::task::yield_now().await;
    assert!(messenger.calls().is_empty());
    assert!(queue.keys("consent_tasks").await?.is_empty());

    let stored = store.get("queued-only").await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.handle(), Some("alice"));
    assert_eq!(stored.scheduled_for, Some(later));

    // picked up by the fallback claim once due, not before
    assert!(store.claim_next("worker-test", Utc::now()).await?.is_none());
    let claimed = store
        .claim_next("worker-test", later + ChronoDuration::seconds(1))
        .await?
        .unwrap();
    assert_eq!(claimed.id, "queued-only");
    Ok(())
}

#[tokio::test]
async fn test_stale_queue_entry_leaves_finished_row_alone() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let queue = Arc::new(InMemoryPriorityQueue::new());
    let messenger = FlakyMessenger::new(0);
    let worker = build_worker(store.clone(), Some(queue.clone()), messenger.clone(), fast_settings());

    let row = store.insert(&dm("alice")).await?;
    let result = TaskResult::success();
    store
        .update_status(&row.id, TaskStatus::Completed, Some(&result), None)
        .await?;

    let later = Utc::now() + ChronoDuration::hours(2);
    queue
        .push(
            "consent_tasks:2024-01-02",
            &json!({
                "id": row.id,
                "user_id": "user-1",
                "task_type": "test-dm",
                "platform": "bluesky",
                "handle": "alice",
                "scheduled_for": later,
            })
            .to_string(),
        )
        .await?;

    assert!(worker.process_next_task().await?);
    tokio::task::yield_now().await;

    assert!(messenger.calls().is_empty());
    let stored = store.get(&row.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result, Some(result));
    assert!(store.list_by_status(TaskStatus::Pending).await?.is_empty());
    assert!(!worker.process_next_task().await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hung_attempt_times_out_and_retries() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let mut executor =
        RetryExecutor::new(store.clone(), Duration::from_secs(1)).with_attempt_timeout(Duration::from_secs(5));
    executor.register_processor(Box::new(HangingProcessor));

    store.insert(&dm("alice")).await?;
    let task = store.claim_next("worker-test", Utc::now()).await?.unwrap();

    let started = Instant::now();
    let execution = executor.run_with_retry(&task, "worker-test", 3).await?;
    match execution.outcome {
        Outcome::Failed { error, attempts } => {
            assert!(error.contains("timed out"), "unexpected error: {}", error);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    // three timeouts plus the 1s and 2s backoffs
    assert!(started.elapsed() >= Duration::from_secs(18));

    let stored = store.get(&task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_log.unwrap().contains("timed out"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_loop_backs_off_after_an_error() -> Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(FailOnceStore::new());
    let broken = store.insert(&dm("first")).await?;
    let healthy = store.insert(&dm("second")).await?;

    let settings = fast_settings();
    let error_pause = settings.idle_interval * settings.error_backoff_factor;
    let messenger = FlakyMessenger::new(0);
    let scheduler = Arc::new(TaskScheduler::new());
    scheduler
        .spawn_worker(build_worker(store.clone(), None, messenger.clone(), settings.clone()))
        .await;

    let runner = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while store.get(&healthy.id).await?.unwrap().status != TaskStatus::Completed {
        assert!(Instant::now() < deadline, "worker did not recover from the error");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let calls = messenger.calls();
    assert_eq!(calls.len(), 2);
    let gap = calls[1] - calls[0];
    assert!(gap >= error_pause, "gap {:?} shorter than error pause", gap);
    assert!(gap > settings.idle_interval);

    // the lost write leaves the first task to stalled recovery
    assert_eq!(store.get(&broken.id).await?.unwrap().status, TaskStatus::Processing);

    scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner).await??;
    Ok(())
}
