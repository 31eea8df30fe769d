use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;

use crate::schedule::scheduler::stalled_cutoff;

const DEFAULT_WORKER_ID: &str = "dm_worker_1";
const DEFAULT_DATABASE_URL: &str = "sqlite://./data/tasks.db?mode=rwc";
const DEFAULT_QUEUE_PREFIX: &str = "consent_tasks";
const DEFAULT_LOG_DIR: &str = "./logs";

/// Everything the worker process reads from its environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub database_url: String,
    /// Priority queue is disabled when unset.
    pub redis_url: Option<String>,
    pub queue_prefix: String,
    pub pop_timeout: Duration,
    pub idle_interval: Duration,
    pub busy_interval: Duration,
    pub error_backoff_factor: u32,
    pub stalled_threshold: Duration,
    pub max_attempts: u32,
    pub retry_backoff_base: Duration,
    /// Upper bound on one processor call; a hung DM script is killed after it.
    pub attempt_timeout: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub script_dir: PathBuf,
    pub python: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: DEFAULT_WORKER_ID.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            redis_url: None,
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            pop_timeout: Duration::from_millis(1000),
            idle_interval: Duration::from_millis(5000),
            busy_interval: Duration::from_millis(1000),
            error_backoff_factor: 2,
            stalled_threshold: Duration::from_millis(60_000),
            max_attempts: 3,
            retry_backoff_base: Duration::from_millis(1000),
            attempt_timeout: Duration::from_millis(45_000),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(500),
            script_dir: PathBuf::from("."),
            python: python_executable(None),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

impl WorkerConfig {
    /// Reads the process environment, then `.env`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok().or_else(|| dotenv::var(key).ok()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            parse(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let config = Self {
            worker_id: lookup("DM_WORKER_ID").unwrap_or(defaults.worker_id),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: lookup("REDIS_URL").filter(|url| !url.trim().is_empty()),
            queue_prefix: lookup("DM_WORKER_QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
            pop_timeout: millis("DM_WORKER_POP_TIMEOUT_MS", defaults.pop_timeout)?,
            idle_interval: millis("DM_WORKER_IDLE_INTERVAL_MS", defaults.idle_interval)?,
            busy_interval: millis("DM_WORKER_BUSY_INTERVAL_MS", defaults.busy_interval)?,
            error_backoff_factor: parse(&lookup, "DM_WORKER_ERROR_BACKOFF_FACTOR", defaults.error_backoff_factor)?,
            stalled_threshold: millis("DM_WORKER_STALLED_TIMEOUT_MS", defaults.stalled_threshold)?,
            max_attempts: parse(&lookup, "DM_WORKER_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_backoff_base: millis("DM_WORKER_RETRY_BASE_MS", defaults.retry_backoff_base)?,
            attempt_timeout: millis("DM_WORKER_ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout)?,
            jitter_min: millis("DM_WORKER_JITTER_MIN_MS", defaults.jitter_min)?,
            jitter_max: millis("DM_WORKER_JITTER_MAX_MS", defaults.jitter_max)?,
            script_dir: lookup("DM_WORKER_SCRIPT_DIR").map(PathBuf::from).unwrap_or(defaults.script_dir),
            python: python_executable(lookup("VIRTUAL_ENV").as_deref()),
            log_dir: lookup("DM_WORKER_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
        };

        if config.jitter_min > config.jitter_max {
            bail!(
                "DM_WORKER_JITTER_MIN_MS ({:?}) exceeds DM_WORKER_JITTER_MAX_MS ({:?})",
                config.jitter_min,
                config.jitter_max
            );
        }

        // a zero BRPOP timeout blocks until an item arrives
        if config.pop_timeout.is_zero() {
            bail!("DM_WORKER_POP_TIMEOUT_MS must be greater than zero");
        }
        if config.attempt_timeout.is_zero() {
            bail!("DM_WORKER_ATTEMPT_TIMEOUT_MS must be greater than zero");
        }
        // a running attempt is only heartbeated between attempts
        if config.attempt_timeout >= config.stalled_threshold {
            bail!(
                "DM_WORKER_ATTEMPT_TIMEOUT_MS ({:?}) must be shorter than DM_WORKER_STALLED_TIMEOUT_MS ({:?})",
                config.attempt_timeout,
                config.stalled_threshold
            );
        }
        stalled_cutoff(Utc::now(), config.stalled_threshold)
            .map_err(|e| anyhow!("Invalid DM_WORKER_STALLED_TIMEOUT_MS: {}", e))?;

        Ok(config)
    }
}

/// The virtualenv's interpreter when one is active, otherwise `python3` from PATH.
pub fn python_executable(virtual_env: Option<&str>) -> PathBuf {
    match virtual_env.filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir).join("bin").join("python"),
        None => PathBuf::from("python3"),
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value {:?} for {}: {}", raw, key, e)),
        None => Ok(default),
    }
}
