//! Tenant-partitioned job queue manager.
//!
//! One logical queue per organization (a reserved "admin" partition for
//! organization-less workflows), created lazily on first enqueue. Each
//! partition runs its own worker loop with bounded concurrency and a
//! jobs-per-minute limiter, so one tenant's backlog cannot starve another's.
//!
//! Failed jobs retry up to the configured attempt limit with exponential
//! backoff from a multi-second base; finished jobs are reaped past the
//! retention window. When the durable backend is absent or unreachable at
//! enqueue time, the job executes synchronously in-process -- logged at high
//! severity, never dropped, never silent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use flowstack_types::config::QueueConfig;
use flowstack_types::job::QueueJob;
use flowstack_types::workflow::WorkflowRun;
use futures_util::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::queue::QueueBackend;
use crate::repository::workflow::WorkflowStore;

use super::error::EngineError;
use super::executor::WorkflowEngine;
use super::resilience::{LimiterConfig, RateLimiter};

/// How long an idle worker waits before polling its partition again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often each partition worker reaps finished jobs.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Executes one claimed job. The queue manager is generic over this seam so
/// tests can drive it without a real engine.
pub trait JobRunner: Send + Sync {
    fn run_job<'a>(
        &'a self,
        job: &'a QueueJob,
    ) -> BoxFuture<'a, Result<WorkflowRun, EngineError>>;
}

impl<S: WorkflowStore + 'static> JobRunner for WorkflowEngine<S> {
    fn run_job<'a>(
        &'a self,
        job: &'a QueueJob,
    ) -> BoxFuture<'a, Result<WorkflowRun, EngineError>> {
        Box::pin(self.execute_workflow(
            job.workflow_id,
            job.user_id,
            job.trigger_type,
            job.trigger_data.clone(),
        ))
    }
}

// ---------------------------------------------------------------------------
// EnqueueResult
// ---------------------------------------------------------------------------

/// Outcome of `queue_workflow_execution`.
#[derive(Debug)]
pub struct EnqueueResult {
    /// `false` when the job executed synchronously in degraded mode.
    pub queued: bool,
    pub job_id: Uuid,
    /// The terminal run, present only for synchronous execution.
    pub run: Option<WorkflowRun>,
}

// ---------------------------------------------------------------------------
// JobQueueManager
// ---------------------------------------------------------------------------

/// Per-process queue manager owning one worker pool per tenant partition.
///
/// Constructed explicitly and passed by reference -- tests get a fresh
/// manager (and fresh partition registry) per case.
pub struct JobQueueManager {
    backend: Option<Arc<dyn QueueBackend>>,
    runner: Arc<dyn JobRunner>,
    config: QueueConfig,
    workers: DashMap<String, tokio::task::JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl JobQueueManager {
    /// Create a manager over a durable backend.
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        runner: Arc<dyn JobRunner>,
        config: QueueConfig,
    ) -> Self {
        Self {
            backend: Some(backend),
            runner,
            config,
            workers: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a manager with no durable backend: every enqueue executes
    /// synchronously in-process (documented single-instance fallback).
    pub fn without_backend(runner: Arc<dyn JobRunner>, config: QueueConfig) -> Self {
        Self {
            backend: None,
            runner,
            config,
            workers: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start workers for every partition the backend already knows about.
    /// Idempotent; new partitions still spawn lazily on first enqueue.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        if let Some(backend) = &self.backend {
            let partitions = backend
                .partitions()
                .await
                .map_err(|e| EngineError::Infrastructure(e.to_string()))?;
            for partition in partitions {
                self.ensure_worker(&partition);
            }
        }
        Ok(())
    }

    /// Enqueue a job on its tenant partition, falling back to synchronous
    /// in-process execution when the backend is absent or unreachable.
    pub async fn queue_workflow_execution(
        &self,
        job: QueueJob,
    ) -> Result<EnqueueResult, EngineError> {
        let job_id = job.id;

        if let Some(backend) = &self.backend {
            match backend.push(job.clone()).await {
                Ok(()) => {
                    self.ensure_worker(job.partition());
                    tracing::debug!(
                        job_id = %job_id,
                        partition = job.partition(),
                        workflow_id = %job.workflow_id,
                        "job enqueued"
                    );
                    return Ok(EnqueueResult {
                        queued: true,
                        job_id,
                        run: None,
                    });
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job_id,
                        error = %e,
                        "queue backend unreachable, executing workflow synchronously"
                    );
                }
            }
        } else {
            tracing::warn!(
                job_id = %job_id,
                "no queue backend configured, executing workflow synchronously"
            );
        }

        let run = self.runner.run_job(&job).await?;
        Ok(EnqueueResult {
            queued: false,
            job_id,
            run: Some(run),
        })
    }

    /// Number of live partition workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop every partition worker. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.workers.iter() {
            entry.value().abort();
        }
        self.workers.clear();
        tracing::info!("job queue manager stopped");
    }

    fn ensure_worker(&self, partition: &str) {
        let Some(backend) = &self.backend else {
            return;
        };
        self.workers.entry(partition.to_string()).or_insert_with(|| {
            tracing::info!(partition, "starting partition worker");
            tokio::spawn(worker_loop(
                Arc::clone(backend),
                Arc::clone(&self.runner),
                self.config.clone(),
                partition.to_string(),
                self.shutdown.child_token(),
            ))
        });
    }
}

impl Drop for JobQueueManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Exponential backoff from the configured base: base, 2*base, 4*base, ...
pub fn backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_secs.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))))
}

async fn worker_loop(
    backend: Arc<dyn QueueBackend>,
    runner: Arc<dyn JobRunner>,
    config: QueueConfig,
    partition: String,
    cancel: CancellationToken,
) {
    let limiter = Arc::new(RateLimiter::new(LimiterConfig::per_minute(
        config.jobs_per_minute,
        config.worker_concurrency.max(1),
    )));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut last_reap = tokio::time::Instant::now();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        while in_flight.try_join_next().is_some() {}

        if last_reap.elapsed() >= REAP_INTERVAL {
            let before = Utc::now() - chrono::Duration::seconds(config.retention_secs as i64);
            match backend.reap(before, config.retention_count).await {
                Ok(reaped) if reaped > 0 => {
                    tracing::debug!(partition = partition.as_str(), reaped, "reaped finished jobs");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(partition = partition.as_str(), error = %e, "reap failed");
                }
            }
            last_reap = tokio::time::Instant::now();
        }

        let capacity = config
            .worker_concurrency
            .max(1)
            .saturating_sub(in_flight.len());
        if capacity == 0 {
            // Pool saturated: wait for one job to finish.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = in_flight.join_next() => {}
            }
            continue;
        }

        let jobs = match backend.claim(&partition, capacity).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(partition = partition.as_str(), error = %e, "claim failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
        };

        if jobs.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            continue;
        }

        for job in jobs {
            let permit = limiter.acquire().await;
            let backend = Arc::clone(&backend);
            let runner = Arc::clone(&runner);
            let config = config.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                process_job(backend, runner, &config, job).await;
            });
        }
    }

    // Let claimed work settle rather than abandoning it mid-flight.
    while in_flight.join_next().await.is_some() {}
    tracing::info!(partition = partition.as_str(), "partition worker stopped");
}

async fn process_job(
    backend: Arc<dyn QueueBackend>,
    runner: Arc<dyn JobRunner>,
    config: &QueueConfig,
    job: QueueJob,
) {
    let job_id = job.id;
    match runner.run_job(&job).await {
        Ok(run) => {
            tracing::info!(
                job_id = %job_id,
                run_id = %run.id,
                attempt = job.attempt,
                "job completed"
            );
            if let Err(e) = backend.ack(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "ack failed");
            }
        }
        Err(e) => {
            let message = e.to_string();
            if job.attempt < config.max_attempts {
                let delay = backoff_delay(config.backoff_base_secs, job.attempt);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                tracing::warn!(
                    job_id = %job_id,
                    attempt = job.attempt,
                    max_attempts = config.max_attempts,
                    delay_secs = delay.as_secs(),
                    error = message.as_str(),
                    "job failed, scheduling retry"
                );
                if let Err(persist) = backend.fail(job, &message, Some(retry_at)).await {
                    tracing::error!(job_id = %job_id, error = %persist, "retry scheduling failed");
                }
            } else {
                tracing::error!(
                    job_id = %job_id,
                    attempt = job.attempt,
                    error = message.as_str(),
                    "job failed permanently"
                );
                if let Err(persist) = backend.fail(job, &message, None).await {
                    tracing::error!(job_id = %job_id, error = %persist, "failure record failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
