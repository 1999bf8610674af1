//! Durable queue backend trait.
//!
//! Named, tenant-partitioned queues with at-least-once delivery, delayed
//! retry, and bounded retention of finished jobs. The engine's queue manager
//! drives these primitives; the backend owns durability.
//!
//! Methods return boxed futures so the backend can live behind
//! `Arc<dyn QueueBackend>`.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use flowstack_types::error::RepositoryError;
use flowstack_types::job::QueueJob;
use uuid::Uuid;

/// Durable, at-least-once job queue partitioned by organization.
pub trait QueueBackend: Send + Sync {
    /// Append a job to its partition (created lazily on first push).
    fn push<'a>(
        &'a self,
        job: QueueJob,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;

    /// Claim up to `max` due jobs from a partition. Claimed jobs are
    /// invisible to other claimers until acked or failed.
    fn claim<'a>(
        &'a self,
        partition: &'a str,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueJob>, RepositoryError>> + Send + 'a>>;

    /// Mark a claimed job as completed.
    fn ack<'a>(
        &'a self,
        job_id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;

    /// Record a failed attempt. With `retry_at` set the job is requeued
    /// (attempt incremented, invisible until the given time); without it the
    /// job is recorded as permanently failed.
    fn fail<'a>(
        &'a self,
        job: QueueJob,
        error: &'a str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;

    /// Names of all partitions that currently exist.
    fn partitions<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, RepositoryError>> + Send + 'a>>;

    /// Number of waiting (unclaimed, due or delayed) jobs in a partition.
    fn depth<'a>(
        &'a self,
        partition: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, RepositoryError>> + Send + 'a>>;

    /// Drop finished jobs older than `before`, keeping at most
    /// `keep_most_recent` per partition. Returns the number reaped.
    fn reap<'a>(
        &'a self,
        before: DateTime<Utc>,
        keep_most_recent: usize,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + 'a>>;
}
