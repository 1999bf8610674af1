//! In-memory distributed lock backend.
//!
//! Mirrors the Redis semantics the leader elector expects -- SET NX PX,
//! conditional PEXPIRE, conditional DEL -- over a local map. Useful for
//! tests and single-process deployments; it provides the same atomic
//! conditional behavior within one process, not across processes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flowstack_core::repository::lock::LockBackend;
use flowstack_types::error::RepositoryError;

/// One lock entry: current holder and expiry instant.
struct LockEntry {
    holder: String,
    expires_at: Instant,
}

/// In-memory implementation of `LockBackend`.
#[derive(Default)]
pub struct InMemoryLockBackend {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current live holder of a key, if any (test observability).
    pub fn holder_of(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().expect("lock map poisoned");
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.holder.clone())
    }
}

impl LockBackend for InMemoryLockBackend {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        holder: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>> {
        let mut entries = self.entries.lock().expect("lock map poisoned");
        let now = Instant::now();
        let acquired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                entries.insert(
                    key.to_string(),
                    LockEntry {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        };
        Box::pin(async move { Ok(acquired) })
    }

    fn extend<'a>(
        &'a self,
        key: &'a str,
        holder: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>> {
        let mut entries = self.entries.lock().expect("lock map poisoned");
        let now = Instant::now();
        let extended = match entries.get_mut(key) {
            Some(entry) if entry.holder == holder && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        };
        Box::pin(async move { Ok(extended) })
    }

    fn release<'a>(
        &'a self,
        key: &'a str,
        holder: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        let mut entries = self.entries.lock().expect("lock map poisoned");
        if entries.get(key).is_some_and(|e| e.holder == holder) {
            entries.remove(key);
        }
        Box::pin(async { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(80);

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_expiry() {
        let lock = InMemoryLockBackend::new();
        assert!(lock.try_acquire("k", "a", TTL).await.unwrap());
        assert!(!lock.try_acquire("k", "b", TTL).await.unwrap());
        assert_eq!(lock.holder_of("k").as_deref(), Some("a"));

        tokio::time::sleep(TTL + Duration::from_millis(20)).await;
        assert!(lock.try_acquire("k", "b", TTL).await.unwrap(), "expired key is acquirable");
        assert_eq!(lock.holder_of("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_extend_requires_live_ownership() {
        let lock = InMemoryLockBackend::new();
        lock.try_acquire("k", "a", TTL).await.unwrap();

        assert!(lock.extend("k", "a", TTL).await.unwrap());
        assert!(!lock.extend("k", "b", TTL).await.unwrap(), "non-holder cannot extend");

        tokio::time::sleep(TTL + Duration::from_millis(20)).await;
        assert!(!lock.extend("k", "a", TTL).await.unwrap(), "expired lock cannot be extended");
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let lock = InMemoryLockBackend::new();
        lock.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap();

        lock.release("k", "b").await.unwrap();
        assert_eq!(lock.holder_of("k").as_deref(), Some("a"), "non-holder release is a no-op");

        lock.release("k", "a").await.unwrap();
        assert!(lock.holder_of("k").is_none());
        assert!(lock.try_acquire("k", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let lock = InMemoryLockBackend::new();
        assert!(lock.try_acquire("k1", "a", TTL).await.unwrap());
        assert!(lock.try_acquire("k2", "b", TTL).await.unwrap());
    }
}
