//! In-memory queue backend.
//!
//! Per-partition waiting queues with claim/ack/fail bookkeeping, delayed
//! retry via `run_after`, and bounded retention of finished jobs. Durable
//! backends (e.g. Redis) implement the same trait; this one serves tests and
//! single-process deployments where losing the queue with the process is
//! acceptable.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use flowstack_core::repository::queue::QueueBackend;
use flowstack_types::error::RepositoryError;
use flowstack_types::job::QueueJob;
use uuid::Uuid;

/// Terminal record of a finished job.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub job_id: Uuid,
    pub partition: String,
    pub finished_at: DateTime<Utc>,
    /// `None` for completed jobs, the final error for failed ones.
    pub error: Option<String>,
}

#[derive(Default)]
struct Partition {
    waiting: VecDeque<QueueJob>,
    claimed: HashMap<Uuid, QueueJob>,
    finished: Vec<FinishedJob>,
}

/// In-memory implementation of `QueueBackend`.
#[derive(Default)]
pub struct InMemoryQueueBackend {
    partitions: Mutex<HashMap<String, Partition>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished records for a partition (test observability).
    pub fn finished(&self, partition: &str) -> Vec<FinishedJob> {
        self.partitions
            .lock()
            .expect("queue map poisoned")
            .get(partition)
            .map(|p| p.finished.clone())
            .unwrap_or_default()
    }
}

impl QueueBackend for InMemoryQueueBackend {
    fn push<'a>(
        &'a self,
        job: QueueJob,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        let mut partitions = self.partitions.lock().expect("queue map poisoned");
        partitions
            .entry(job.partition().to_string())
            .or_default()
            .waiting
            .push_back(job);
        Box::pin(async { Ok(()) })
    }

    fn claim<'a>(
        &'a self,
        partition: &'a str,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueJob>, RepositoryError>> + Send + 'a>> {
        let mut partitions = self.partitions.lock().expect("queue map poisoned");
        let state = partitions.entry(partition.to_string()).or_default();
        let now = Utc::now();

        // Due jobs claim highest-priority first, FIFO within a priority.
        let mut due: Vec<QueueJob> = Vec::new();
        let mut deferred = VecDeque::new();
        while let Some(job) = state.waiting.pop_front() {
            if job.run_after.is_none_or(|t| t <= now) {
                due.push(job);
            } else {
                deferred.push_back(job);
            }
        }
        due.sort_by_key(|job| std::cmp::Reverse(job.priority));

        let mut claimed = Vec::new();
        for job in due {
            if claimed.len() < max {
                state.claimed.insert(job.id, job.clone());
                claimed.push(job);
            } else {
                deferred.push_back(job);
            }
        }
        state.waiting = deferred;

        Box::pin(async move { Ok(claimed) })
    }

    fn ack<'a>(
        &'a self,
        job_id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        let mut partitions = self.partitions.lock().expect("queue map poisoned");
        for (name, state) in partitions.iter_mut() {
            if state.claimed.remove(job_id).is_some() {
                state.finished.push(FinishedJob {
                    job_id: *job_id,
                    partition: name.clone(),
                    finished_at: Utc::now(),
                    error: None,
                });
                return Box::pin(async { Ok(()) });
            }
        }
        Box::pin(async { Err(RepositoryError::NotFound) })
    }

    fn fail<'a>(
        &'a self,
        mut job: QueueJob,
        error: &'a str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        let mut partitions = self.partitions.lock().expect("queue map poisoned");
        let name = job.partition().to_string();
        let state = partitions.entry(name.clone()).or_default();
        state.claimed.remove(&job.id);

        match retry_at {
            Some(at) => {
                job.attempt += 1;
                job.run_after = Some(at);
                state.waiting.push_back(job);
            }
            None => {
                state.finished.push(FinishedJob {
                    job_id: job.id,
                    partition: name,
                    finished_at: Utc::now(),
                    error: Some(error.to_string()),
                });
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn partitions<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, RepositoryError>> + Send + 'a>> {
        let names = self
            .partitions
            .lock()
            .expect("queue map poisoned")
            .keys()
            .cloned()
            .collect();
        Box::pin(async move { Ok(names) })
    }

    fn depth<'a>(
        &'a self,
        partition: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, RepositoryError>> + Send + 'a>> {
        let depth = self
            .partitions
            .lock()
            .expect("queue map poisoned")
            .get(partition)
            .map(|p| p.waiting.len())
            .unwrap_or(0);
        Box::pin(async move { Ok(depth) })
    }

    fn reap<'a>(
        &'a self,
        before: DateTime<Utc>,
        keep_most_recent: usize,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + 'a>> {
        let mut partitions = self.partitions.lock().expect("queue map poisoned");
        let mut reaped = 0u64;
        for state in partitions.values_mut() {
            let before_len = state.finished.len();
            state.finished.retain(|f| f.finished_at >= before);
            // Keep only the newest `keep_most_recent` records
            if state.finished.len() > keep_most_recent {
                state
                    .finished
                    .sort_by_key(|f| std::cmp::Reverse(f.finished_at));
                state.finished.truncate(keep_most_recent);
            }
            reaped += (before_len - state.finished.len()) as u64;
        }
        Box::pin(async move { Ok(reaped) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
