use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Process-wide registry of named async locks.
#[derive(Default)]
pub(crate) struct LockManager {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    last_used: Instant,
}

/// Held while the key is locked. Dropping it unlocks.
pub(crate) struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }
}

impl LockManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            lock: Arc::new(AsyncMutex::new(())),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Arc::clone(&entry.lock)
    }

    /// Wait until `key` is free and take it.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard {
        let guard = self.handle(key).lock_owned().await;
        tracing::trace!(key, "Lock acquired");
        KeyGuard { key: key.to_string(), _guard: guard }
    }

    /// Take `key` only if nobody holds it.
    pub(crate) fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let guard = self.handle(key).try_lock_owned().ok()?;
        Some(KeyGuard { key: key.to_string(), _guard: guard })
    }

    pub(crate) fn is_locked(&self, key: &str) -> bool {
        self.entries().get(key).is_some_and(|entry| entry.lock.try_lock().is_err())
    }

    /// Drop entries nobody holds or waits on that were last used over `max_age` ago.
    pub(crate) fn remove_stale(&self, max_age: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            let idle = Arc::strong_count(&entry.lock) == 1 && entry.lock.try_lock().is_ok();
            !(idle && entry.last_used.elapsed() >= max_age)
        });

        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "Removed stale locks");
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let manager = LockManager::new();
        let guard = manager.lock("course101::hw0::alice").await;

        assert!(manager.is_locked("course101::hw0::alice"));
        assert!(manager.try_lock("course101::hw0::alice").is_none());
        assert!(manager.try_lock("course101::hw0::bob").is_some());

        drop(guard);
        assert!(manager.try_lock("course101::hw0::alice").is_some());
    }

    #[tokio::test]
    async fn waiters_run_after_release() {
        let manager = Arc::new(LockManager::new());
        let guard = manager.lock("key").await;

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let guard = manager.lock("key").await;
                guard.key().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.expect("join"), "key");
    }

    #[tokio::test]
    async fn only_idle_entries_are_stale() {
        let manager = LockManager::new();
        let held = manager.lock("held").await;
        drop(manager.lock("idle").await);

        assert_eq!(manager.remove_stale(Duration::from_secs(3600)), 0);
        assert_eq!(manager.remove_stale(Duration::ZERO), 1);
        assert_eq!(manager.len(), 1);
        assert!(manager.is_locked("held"));

        drop(held);
    }
}
