//! Distributed lock backend trait.
//!
//! The leader lock is the only mutable state shared across worker processes,
//! and it is only ever touched through these atomic conditional primitives:
//! set-if-absent-with-TTL, conditional-extend, and delete-if-held. A Redis
//! implementation maps these onto SET NX PX / conditional PEXPIRE /
//! conditional DEL; the in-memory implementation mirrors the same semantics
//! for tests and single-process deployments.
//!
//! Methods return boxed futures so the backend can live behind
//! `Arc<dyn LockBackend>`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use flowstack_types::error::RepositoryError;

/// Atomic conditional operations on a single expiring lock key.
pub trait LockBackend: Send + Sync {
    /// Set `key` to `holder` with the given TTL, only if the key is absent
    /// (or expired). Returns `true` when the lock was acquired.
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        holder: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>>;

    /// Extend the TTL, only if `holder` still owns the key. Returns `false`
    /// when the lock was lost (expired or taken by another holder).
    fn extend<'a>(
        &'a self,
        key: &'a str,
        holder: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>>;

    /// Delete the key if `holder` owns it. Used on clean shutdown so another
    /// process can take over without waiting for expiry.
    fn release<'a>(
        &'a self,
        key: &'a str,
        holder: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;
}
