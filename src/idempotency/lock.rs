//! Short-lived mutual exclusion per idempotency key.
//!
//! Acquisition is a single `set_if_absent` of a random owner token under the
//! key's lock slot; release is a compare-and-delete against that token, so a
//! worker whose lock already expired can never delete a newer holder's lock.
//! A lock whose owner never releases it expires with its TTL.

use crate::error::StoreResult;
use crate::idempotency::key_generator::{IdempotencyKey, KeyNamespace};
use crate::idempotency::storage::SharedStore;
use std::time::Duration;
use uuid::Uuid;

/// Outcome of a lock acquisition attempt.
pub enum LockAcquisition {
    Acquired(LockGuard),
    /// Another worker holds the lock.
    Contended,
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired(_))
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    namespace: KeyNamespace,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: SharedStore, namespace: KeyNamespace, ttl: Duration) -> Self {
        Self {
            store,
            namespace,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Attempts to acquire the lock with the configured TTL.
    ///
    /// A store error is returned as-is; callers must not proceed without
    /// exclusivity.
    pub async fn acquire(&self, key: &IdempotencyKey) -> StoreResult<LockAcquisition> {
        self.acquire_with_ttl(key, self.ttl).await
    }

    pub async fn acquire_with_ttl(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
    ) -> StoreResult<LockAcquisition> {
        let lock_key = self.namespace.lock_key(key);
        let owner_token = Uuid::new_v4().to_string();

        if self.store.set_if_absent(&lock_key, &owner_token, ttl).await? {
            tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "Acquired processing lock");
            Ok(LockAcquisition::Acquired(LockGuard {
                store: self.store.clone(),
                lock_key,
                owner_token,
                released: false,
            }))
        } else {
            Ok(LockAcquisition::Contended)
        }
    }

    /// Releases the lock only if it is still held by `owner_token`.
    pub async fn release(&self, key: &IdempotencyKey, owner_token: &str) -> StoreResult<bool> {
        let lock_key = self.namespace.lock_key(key);
        self.store.delete_if_equals(&lock_key, owner_token).await
    }

    pub async fn is_held(&self, key: &IdempotencyKey) -> StoreResult<bool> {
        let lock_key = self.namespace.lock_key(key);
        Ok(self.store.get(&lock_key).await?.is_some())
    }
}

/// Held lock. Dropping an unreleased guard schedules a compare-and-delete on
/// the current tokio runtime, so a cancelled caller does not keep the lock
/// until its TTL runs out.
pub struct LockGuard {
    store: SharedStore,
    lock_key: String,
    owner_token: String,
    released: bool,
}

impl LockGuard {
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Releases the lock. Returns false if it had already expired or changed hands.
    pub async fn release(mut self) -> StoreResult<bool> {
        let result = self
            .store
            .delete_if_equals(&self.lock_key, &self.owner_token)
            .await;
        self.released = true;

        match &result {
            Ok(false) => {
                tracing::warn!(lock_key = %self.lock_key, "Lock was no longer held at release")
            }
            Err(e) => {
                tracing::warn!(lock_key = %self.lock_key, error = %e, "Lock release failed, relying on TTL")
            }
            Ok(true) => {}
        }
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Outside a runtime the TTL is the only cleanup left.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let lock_key = std::mem::take(&mut self.lock_key);
        let owner_token = std::mem::take(&mut self.owner_token);

        handle.spawn(async move {
            match store.delete_if_equals(&lock_key, &owner_token).await {
                Ok(_) => tracing::debug!(lock_key = %lock_key, "Released lock from dropped guard"),
                Err(e) => {
                    tracing::warn!(lock_key = %lock_key, error = %e, "Dropped guard could not release lock")
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::key_generator::IdempotencyKeyGenerator;
    use crate::idempotency::storage::{KeyValueStore, MemoryStore};
    use std::sync::Arc;

    fn manager(store: Arc<MemoryStore>) -> LockManager {
        LockManager::new(store, KeyNamespace::default(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_second_acquire_is_contended() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(store.clone());
        let key = IdempotencyKeyGenerator::new().key("venmo", "txn_1", None);

        let first = locks.acquire(&key).await.unwrap();
        assert!(first.is_acquired());
        assert!(!locks.acquire(&key).await.unwrap().is_acquired());
        assert!(locks.is_held(&key).await.unwrap());

        if let LockAcquisition::Acquired(guard) = first {
            assert!(guard.release().await.unwrap());
        }
        assert!(!locks.is_held(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(store.clone());
        let key = IdempotencyKeyGenerator::new().key("venmo", "txn_2", None);

        let LockAcquisition::Acquired(guard) = locks.acquire(&key).await.unwrap() else {
            panic!("expected lock");
        };

        assert!(!locks.release(&key, "someone-else").await.unwrap());
        assert!(locks.is_held(&key).await.unwrap());
        assert!(locks.release(&key, guard.owner_token()).await.unwrap());

        // The guard's own release now finds nothing to delete.
        assert!(!guard.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lock() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(store.clone());
        let key = IdempotencyKeyGenerator::new().key("sms", "m9", None);

        let acquisition = locks.acquire(&key).await.unwrap();
        let lock_key = KeyNamespace::default().lock_key(&key);
        drop(acquisition);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.get(&lock_key).await.unwrap(), None);
    }
}
