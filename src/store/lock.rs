//! Distributed lock over the ephemeral store.
//!
//! `acquire` is a write-if-absent with TTL; `release` is the scripted
//! compare-and-delete, so a lock that outlived its TTL can never delete a
//! successor's token. The TTL is a safety net only and must exceed the
//! critical section it guards.

use crate::store::{EphemeralStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock is held by another owner")]
    Contended,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof of acquisition; holds the token compare-and-delete checks against.
#[derive(Debug, Clone)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn EphemeralStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock. `None` means contention.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, StoreError> {
        metrics::counter!("lock_acquire_attempts_total", 1);
        let token = Uuid::new_v4().to_string();
        let acquired = self.store.set_nx_ex(key, &token, ttl).await?;
        if acquired {
            metrics::counter!("lock_acquire_success_total", 1);
            Ok(Some(LockGuard {
                key: key.to_string(),
                token,
            }))
        } else {
            metrics::counter!("lock_acquire_contended_total", 1);
            Ok(None)
        }
    }

    /// Release the lock iff we still own it.
    pub async fn release(&self, guard: &LockGuard) -> Result<bool, StoreError> {
        let released = self
            .store
            .compare_and_delete(&guard.key, &guard.token)
            .await?;
        if !released {
            metrics::counter!("lock_release_lost_total", 1);
        }
        Ok(released)
    }

    /// Run `f` under the lock, releasing on every exit path. Contention is
    /// surfaced as [`LockError::Contended`] without running `f`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(key, ttl).await?.ok_or(LockError::Contended)?;
        let out = f().await;
        if let Err(e) = self.release(&guard).await {
            // The TTL will reclaim the key; losing the release is not fatal.
            warn!(key = %guard.key, error = %e, "failed to release distributed lock");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock() -> (DistributedLock, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DistributedLock::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_acquire_then_contend() {
        let (lock, _store) = lock();
        let guard = lock
            .acquire("accept:w-1", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("first acquire wins");

        assert!(lock
            .acquire("accept:w-1", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        assert!(lock.release(&guard).await.unwrap());
        assert!(lock
            .acquire("accept:w-1", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let (lock, _store) = lock();
        let guard = lock
            .acquire("k", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let stale = LockGuard {
            key: "k".to_string(),
            token: "someone-elses-token".to_string(),
        };
        assert!(!lock.release(&stale).await.unwrap());
        // the real owner still can
        assert!(lock.release(&guard).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_exit() {
        let (lock, _store) = lock();
        let value = lock
            .with_lock("k", Duration::from_secs(5), || async { 41 + 1 })
            .await
            .unwrap();
        assert_eq!(value, 42);

        // lock is free again
        assert!(lock
            .acquire("k", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_with_lock_contention_skips_closure() {
        let (lock, _store) = lock();
        let _held = lock
            .acquire("k", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = lock
            .with_lock("k", Duration::from_secs(5), || async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        assert!(matches!(result, Err(LockError::Contended)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
