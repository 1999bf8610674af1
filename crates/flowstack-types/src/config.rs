//! Engine configuration types for Flowstack.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls wave
//! concurrency, queue worker behavior, and scheduler coordination. All
//! fields have sensible defaults so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Flowstack engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum steps started concurrently within one wave. Larger waves run
    /// in sub-batches of this size.
    #[serde(default = "default_max_step_concurrency")]
    pub max_step_concurrency: usize,

    /// Hard cap on `while` loop iterations when the step declares none.
    #[serde(default = "default_while_iteration_cap")]
    pub while_iteration_cap: u32,

    /// Default per-invocation timeout in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Queue worker settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Cron coordination settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_max_step_concurrency() -> usize {
    10
}

fn default_while_iteration_cap() -> u32 {
    1000
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_concurrency: default_max_step_concurrency(),
            while_iteration_cap: default_while_iteration_cap(),
            step_timeout_secs: default_step_timeout_secs(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue settings
// ---------------------------------------------------------------------------

/// Per-partition worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrent jobs per partition worker pool.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Requests-per-minute limit per partition.
    #[serde(default = "default_jobs_per_minute")]
    pub jobs_per_minute: u32,

    /// Maximum delivery attempts before a job is recorded as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in seconds for exponential retry backoff.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Completed/failed jobs older than this are reaped.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// At most this many completed/failed jobs are retained per partition.
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_jobs_per_minute() -> u32 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_retention_count() -> usize {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            jobs_per_minute: default_jobs_per_minute(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            retention_secs: default_retention_secs(),
            retention_count: default_retention_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler settings
// ---------------------------------------------------------------------------

/// Leader-election and timer-sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Distributed lock key shared by the scheduler fleet.
    #[serde(default = "default_lock_key")]
    pub lock_key: String,

    /// Lock TTL in seconds. Must exceed the check interval.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Interval between election ticks (acquire attempt or renewal).
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_lock_key() -> String {
    "flowstack:scheduler:leader".to_string()
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_check_interval_secs() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_key: default_lock_key(),
            lock_ttl_secs: default_lock_ttl_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
