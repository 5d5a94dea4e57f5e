//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `CONVEYOR_DATABASE_URL`: PostgreSQL connection string (required)
//! - `CONVEYOR_EXECUTIONS_MODE`: `regular` or `queue` (default: regular)
//! - `CONVEYOR_EXECUTIONS_TIMEOUT`: default execution timeout in seconds, -1 disables (default: -1)
//! - `CONVEYOR_EXECUTIONS_TIMEOUT_MAX`: ceiling for per-workflow timeouts in seconds (default: 3600)
//! - `CONVEYOR_SAVE_DATA_ON_ERROR`: `all` or `none` (default: all)
//! - `CONVEYOR_SAVE_DATA_ON_SUCCESS`: `all` or `none` (default: all)
//! - `CONVEYOR_SAVE_EXECUTION_PROGRESS`: save per-node progress (default: false)
//! - `CONVEYOR_SAVE_MANUAL_EXECUTIONS`: save manually started executions (default: true)
//! - `CONVEYOR_PRUNE_DATA`: enable retention pruning (default: true)
//! - `CONVEYOR_PRUNE_MAX_AGE_HOURS`: soft-delete age threshold (default: 336)
//! - `CONVEYOR_PRUNE_HARD_DELETE_BUFFER_HOURS`: hard-delete safety buffer (default: 1)
//! - `CONVEYOR_PRUNE_SOFT_INTERVAL_MIN`: soft pass cadence in minutes (default: 60)
//! - `CONVEYOR_PRUNE_HARD_INTERVAL_MIN`: hard pass cadence in minutes (default: 15)
//! - `CONVEYOR_PRUNE_MAX_COUNT`: stored execution count cap, 0 = unlimited (default: 10000)
//! - `CONVEYOR_PRUNE_BATCH_SIZE`: rows per delete batch (default: 100)
//! - `CONVEYOR_QUEUE_PREFIX`: jobs table namespace prefix (default: conveyor)
//! - `CONVEYOR_QUEUE_LOCK_DURATION_MS`: lease duration (default: 30000)
//! - `CONVEYOR_QUEUE_LOCK_RENEW_MS`: renewal heartbeat cadence (default: 15000)
//! - `CONVEYOR_QUEUE_STALLED_INTERVAL_MS`: stalled sweep cadence, 0 disables (default: 30000)
//! - `CONVEYOR_QUEUE_MAX_STALLED_COUNT`: stall budget before dead-letter (default: 1)
//! - `CONVEYOR_QUEUE_RECOVERY_INTERVAL_S`: recovery poll cadence, 0 disables (default: 60)
//! - `CONVEYOR_WORKER_CONCURRENCY`: concurrent jobs per worker (default: 10)
//! - `CONVEYOR_GRACEFUL_SHUTDOWN_TIMEOUT_S`: shutdown drain budget (default: 30)
//! - `CONVEYOR_HEALTH_CHECK_ACTIVE`: enable the health endpoint (default: false)
//! - `CONVEYOR_HEALTH_CHECK_PORT`: health endpoint port (default: 5678)

use std::{env, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};

use crate::execution::SaveData;
use crate::timeout::validate_timeout;

/// Default port for the health check endpoint.
pub const DEFAULT_HEALTH_PORT: u16 = 5678;

/// Whether executions run directly or are dispatched via the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    Regular,
    Queue,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "regular" => Ok(Self::Regular),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown executions mode: {other}")),
        }
    }
}

/// Process configuration, loaded once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Whether executions run directly or via the queue.
    pub dispatch_mode: DispatchMode,

    pub executions: ExecutionsConfig,
    pub prune: PruneConfig,
    pub queue: QueueConfig,
    pub health: HealthConfig,
}

/// Execution timeout and save-policy defaults.
#[derive(Debug, Clone)]
pub struct ExecutionsConfig {
    /// Default per-execution timeout. None disables timeout enforcement.
    pub default_timeout: Option<Duration>,

    /// Ceiling for per-workflow timeout overrides (seconds).
    pub max_timeout_secs: u64,

    pub save_on_error: SaveData,
    pub save_on_success: SaveData,
    pub save_progress: bool,
    pub save_manual: bool,
}

/// Retention pruner settings.
#[derive(Debug, Clone)]
pub struct PruneConfig {
    pub enabled: bool,

    /// How old finished execution data has to be to get soft-deleted.
    pub max_age: Duration,

    /// How long a soft-deleted execution is protected from the hard pass.
    /// Excludes recent executions the user may still be inspecting.
    pub hard_delete_buffer: Duration,

    pub soft_interval: Duration,
    pub hard_interval: Duration,

    /// Maximum stored executions; oldest-finished are evicted past this.
    /// Not necessarily pruned exactly to the cap. 0 = no limit.
    pub max_count: u64,

    /// Rows per delete batch.
    pub batch_size: usize,
}

/// Queue lease protocol settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Namespace prefix for queue tables.
    pub prefix: String,

    /// Lease period for a worker to work on a job.
    pub lock_duration: Duration,

    /// How frequently a worker renews its lease.
    pub lock_renew_time: Duration,

    /// How often to check for stalled jobs. None disables the check.
    pub stalled_interval: Option<Duration>,

    /// Max times a stalled job is re-queued before being dead-lettered.
    pub max_stalled_count: u32,

    /// Active backend polling that recovers from backend crashes.
    /// None disables it.
    pub recovery_interval: Option<Duration>,

    /// Concurrent jobs per worker process.
    pub worker_concurrency: usize,

    /// How long to wait for running executions before exiting the worker.
    pub graceful_shutdown_timeout: Duration,
}

/// Health check endpoint settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_HEALTH_PORT,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|value| value == "true" || value == "1")
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` if present, then reads from the environment. Invalid
    /// settings (a default timeout above the ceiling, a zero lease duration)
    /// are rejected here rather than surfacing mid-execution.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("CONVEYOR_DATABASE_URL")
            .context("CONVEYOR_DATABASE_URL environment variable is required")?;

        let dispatch_mode = env::var("CONVEYOR_EXECUTIONS_MODE")
            .unwrap_or_else(|_| "regular".to_string())
            .parse()
            .map_err(|err: String| anyhow::anyhow!(err))
            .context("invalid CONVEYOR_EXECUTIONS_MODE")?;

        let max_timeout_secs: u64 = env_parse("CONVEYOR_EXECUTIONS_TIMEOUT_MAX", 3600);
        let default_timeout_raw: i64 = env_parse("CONVEYOR_EXECUTIONS_TIMEOUT", -1);
        let default_timeout = validate_timeout(default_timeout_raw, max_timeout_secs)
            .context("invalid CONVEYOR_EXECUTIONS_TIMEOUT")?;

        let save_on_error = env::var("CONVEYOR_SAVE_DATA_ON_ERROR")
            .unwrap_or_else(|_| "all".to_string())
            .parse()
            .map_err(|err: String| anyhow::anyhow!(err))
            .context("invalid CONVEYOR_SAVE_DATA_ON_ERROR")?;
        let save_on_success = env::var("CONVEYOR_SAVE_DATA_ON_SUCCESS")
            .unwrap_or_else(|_| "all".to_string())
            .parse()
            .map_err(|err: String| anyhow::anyhow!(err))
            .context("invalid CONVEYOR_SAVE_DATA_ON_SUCCESS")?;

        let executions = ExecutionsConfig {
            default_timeout,
            max_timeout_secs,
            save_on_error,
            save_on_success,
            save_progress: env_bool("CONVEYOR_SAVE_EXECUTION_PROGRESS", false),
            save_manual: env_bool("CONVEYOR_SAVE_MANUAL_EXECUTIONS", true),
        };

        let prune = PruneConfig {
            enabled: env_bool("CONVEYOR_PRUNE_DATA", true),
            max_age: Duration::from_secs(env_parse("CONVEYOR_PRUNE_MAX_AGE_HOURS", 336u64) * 3600),
            hard_delete_buffer: Duration::from_secs(
                env_parse("CONVEYOR_PRUNE_HARD_DELETE_BUFFER_HOURS", 1u64) * 3600,
            ),
            soft_interval: Duration::from_secs(
                env_parse("CONVEYOR_PRUNE_SOFT_INTERVAL_MIN", 60u64) * 60,
            ),
            hard_interval: Duration::from_secs(
                env_parse("CONVEYOR_PRUNE_HARD_INTERVAL_MIN", 15u64) * 60,
            ),
            max_count: env_parse("CONVEYOR_PRUNE_MAX_COUNT", 10_000u64),
            batch_size: env_parse("CONVEYOR_PRUNE_BATCH_SIZE", 100usize),
        };

        let lock_duration_ms: u64 = env_parse("CONVEYOR_QUEUE_LOCK_DURATION_MS", 30_000);
        if lock_duration_ms == 0 {
            bail!("CONVEYOR_QUEUE_LOCK_DURATION_MS must be greater than zero");
        }
        let stalled_interval_ms: u64 = env_parse("CONVEYOR_QUEUE_STALLED_INTERVAL_MS", 30_000);
        let recovery_interval_s: u64 = env_parse("CONVEYOR_QUEUE_RECOVERY_INTERVAL_S", 60);

        let queue = QueueConfig {
            prefix: env::var("CONVEYOR_QUEUE_PREFIX").unwrap_or_else(|_| "conveyor".to_string()),
            lock_duration: Duration::from_millis(lock_duration_ms),
            lock_renew_time: Duration::from_millis(env_parse(
                "CONVEYOR_QUEUE_LOCK_RENEW_MS",
                15_000,
            )),
            stalled_interval: match stalled_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_stalled_count: env_parse("CONVEYOR_QUEUE_MAX_STALLED_COUNT", 1u32),
            recovery_interval: match recovery_interval_s {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            worker_concurrency: std::cmp::max(1, env_parse("CONVEYOR_WORKER_CONCURRENCY", 10usize)),
            graceful_shutdown_timeout: Duration::from_secs(env_parse(
                "CONVEYOR_GRACEFUL_SHUTDOWN_TIMEOUT_S",
                30,
            )),
        };

        let health = HealthConfig {
            enabled: env_bool("CONVEYOR_HEALTH_CHECK_ACTIVE", false),
            port: env_parse("CONVEYOR_HEALTH_CHECK_PORT", DEFAULT_HEALTH_PORT),
        };

        Ok(Self {
            database_url,
            dispatch_mode,
            executions,
            prune,
            queue,
            health,
        })
    }

    /// Create a test configuration with defaults.
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            dispatch_mode: DispatchMode::Queue,
            executions: ExecutionsConfig {
                default_timeout: None,
                max_timeout_secs: 3600,
                save_on_error: SaveData::All,
                save_on_success: SaveData::All,
                save_progress: false,
                save_manual: true,
            },
            prune: PruneConfig {
                enabled: true,
                max_age: Duration::from_secs(336 * 3600),
                hard_delete_buffer: Duration::from_secs(3600),
                soft_interval: Duration::from_secs(3600),
                hard_interval: Duration::from_secs(900),
                max_count: 10_000,
                batch_size: 100,
            },
            queue: QueueConfig {
                prefix: "conveyor".to_string(),
                lock_duration: Duration::from_millis(30_000),
                lock_renew_time: Duration::from_millis(15_000),
                stalled_interval: Some(Duration::from_millis(30_000)),
                max_stalled_count: 1,
                recovery_interval: Some(Duration::from_secs(60)),
                worker_concurrency: 2,
                graceful_shutdown_timeout: Duration::from_secs(30),
            },
            health: HealthConfig::default(),
        }
    }
}
