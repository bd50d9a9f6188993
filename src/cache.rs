// Probe cache - time-boxed storage of serialized metric lists
//
// Probes may ask for their result to be cached (`cache=5m`). Entries hold the
// serialized `MetricList` bytes and expire after the requested duration. A
// per-key build lock makes sure only one probe computes a given entry at a time;
// concurrent probes for the same key wait and then read the fresh entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

/// Longest time an entry may live
pub const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

struct CacheEntry {
    data: Vec<u8>,
    expires_at: Instant,
}

/// In-memory cache for probe results
#[derive(Default)]
pub struct ProbeCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached bytes for a key, unless missing or expired
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.data.clone())
    }

    /// Stores an entry; `ttl` is clamped to `MAX_TTL`
    pub async fn set(&self, key: &str, data: Vec<u8>, ttl: Duration) {
        let entry = CacheEntry {
            data,
            expires_at: Instant::now() + ttl.min(MAX_TTL),
        };
        self.entries.lock().await.insert(key.to_string(), entry);
    }

    /// Acquires the build lock of a key
    ///
    /// Hold the guard while checking the cache, computing and storing the
    /// entry, so that at most one build per key is in flight. Hand the guard
    /// back through `release` once done.
    pub async fn build_lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.build_locks.lock().await;
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        lock.lock_owned().await
    }

    /// Releases a build lock, forgetting it when no other probe waits for it
    pub async fn release(&self, key: &str, guard: OwnedMutexGuard<()>) {
        let mut locks = self.build_locks.lock().await;
        drop(guard);

        // the map holds the last reference once nobody waits
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    /// Removes expired entries, returning how many were dropped
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Spawns a background task that evicts expired entries periodically
    pub fn spawn_janitor(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(every);

            loop {
                timer.tick().await;

                let evicted = self.evict_expired().await;
                if evicted > 0 {
                    debug!("evicted {} expired cache entries", evicted);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_and_set() {
        let cache = ProbeCache::new();
        assert!(cache.get("cache:resources").await.is_none());

        cache
            .set("cache:resources", b"data".to_vec(), Duration::from_secs(60))
            .await;

        assert_eq!(cache.get("cache:resources").await, Some(b"data".to_vec()));
        assert!(cache.get("cache:other").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_hidden_and_evicted() {
        let cache = ProbeCache::new();
        cache.set("cache:a", b"a".to_vec(), Duration::ZERO).await;
        cache.set("cache:b", b"b".to_vec(), Duration::from_secs(60)).await;

        assert!(cache.get("cache:a").await.is_none());
        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.evict_expired().await, 0);
        assert!(cache.get("cache:b").await.is_some());
    }

    #[tokio::test]
    async fn test_ttl_is_clamped() {
        let cache = ProbeCache::new();
        cache
            .set("cache:a", b"a".to_vec(), Duration::from_secs(u64::MAX))
            .await;

        assert!(cache.get("cache:a").await.is_some());
        let entries = cache.entries.lock().await;
        assert!(entries["cache:a"].expires_at <= Instant::now() + MAX_TTL);
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let cache = ProbeCache::new();

        for index in 0..100 {
            let key = format!("cache:module-{}", index);
            let guard = cache.build_lock(&key).await;
            cache.release(&key, guard).await;
        }

        assert!(cache.build_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_lock_while_waited_for() {
        let cache = Arc::new(ProbeCache::new());
        let guard = cache.build_lock("cache:a").await;

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let guard = cache.build_lock("cache:a").await;
                cache.release("cache:a", guard).await;
            })
        };

        // let the waiter queue up on the lock
        while Arc::strong_count(&cache.build_locks.lock().await["cache:a"]) < 3 {
            tokio::task::yield_now().await;
        }

        cache.release("cache:a", guard).await;
        assert!(cache.build_locks.lock().await.contains_key("cache:a"));

        waiter.await.unwrap();
        assert!(cache.build_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_build_lock_serializes_per_key() {
        let cache = Arc::new(ProbeCache::new());

        let guard = cache.build_lock("cache:a").await;

        // another key is independent
        let other = tokio::time::timeout(Duration::from_millis(50), cache.build_lock("cache:b")).await;
        assert!(other.is_ok());

        // the same key waits for the first guard
        let same = tokio::time::timeout(Duration::from_millis(50), cache.build_lock("cache:a")).await;
        assert!(same.is_err());

        drop(guard);
        let same = tokio::time::timeout(Duration::from_millis(50), cache.build_lock("cache:a")).await;
        assert!(same.is_ok());
    }
}
