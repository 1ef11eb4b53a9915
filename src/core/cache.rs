//! Bounded, TTL based credential cache.
//!
//! Used for verified accounts (keyed by principal id) and for password hash
//! verification results (keyed by principal plus expected hash). Entries are
//! evicted lazily on access and by [`CredentialCache::sweep`], which the
//! gateway runs periodically in the background.
use std::{future::Future, hash::Hash, sync::Arc, time::Duration};

use scc::HashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::utils::graceful_shutdown::ShutdownToken;

/// When an entry's time-to-live is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpirePolicy {
    /// Entries never expire; only capacity eviction removes them.
    Never,
    /// TTL counts from insertion.
    #[default]
    AfterWrite,
    /// TTL counts from the last successful read.
    AfterRead,
}

/// A cached value with its bookkeeping timestamps.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            last_accessed_at: now,
        }
    }

    fn is_expired(&self, policy: ExpirePolicy, ttl: Duration, now: Instant) -> bool {
        match policy {
            ExpirePolicy::Never => false,
            ExpirePolicy::AfterWrite => now.duration_since(self.created_at) >= ttl,
            ExpirePolicy::AfterRead => now.duration_since(self.last_accessed_at) >= ttl,
        }
    }
}

/// Concurrent cache with a size bound and a per-entry expiry policy.
pub struct CredentialCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    max_size: usize,
    ttl: Duration,
    policy: ExpirePolicy,
}

impl<K, V> CredentialCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_size: usize, ttl: Duration, policy: ExpirePolicy) -> Self {
        Self {
            entries: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
            policy,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn policy(&self) -> ExpirePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a live entry. Expired entries are removed on the spot.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entry = self.entries.get_async(key).await?;

        if entry.get().is_expired(self.policy, self.ttl, now) {
            let _ = entry.remove_entry();
            return None;
        }

        let cached = entry.get_mut();
        cached.last_accessed_at = now;
        Some(cached.value.clone())
    }

    /// Insert or replace an entry, evicting if the cache is full.
    pub async fn put(&self, key: K, value: V) {
        let now = Instant::now();

        if self.entries.len() >= self.max_size && !self.entries.contains_async(&key).await {
            if self.sweep().await == 0 {
                self.evict_least_recently_used().await;
            }
        }

        match self.entries.entry_async(key).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = CacheEntry::new(value, now);
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(CacheEntry::new(value, now));
            }
        }
    }

    pub async fn invalidate(&self, key: &K) -> bool {
        self.entries.remove_async(key).await.is_some()
    }

    pub async fn clear(&self) {
        self.entries.clear_async().await;
    }

    /// Return the cached value or run `load`. Only `Ok(Some(_))` results are
    /// stored, so misses and failures are retried on the next call.
    pub async fn get_or_load<F, Fut, E>(&self, key: &K, load: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        let loaded = load().await?;
        if let Some(value) = &loaded {
            self.put(key.clone(), value.clone()).await;
        }
        Ok(loaded)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        let (policy, ttl) = (self.policy, self.ttl);

        self.entries
            .retain_async(|_, entry| !entry.is_expired(policy, ttl, now))
            .await;

        before.saturating_sub(self.entries.len())
    }

    async fn evict_least_recently_used(&self) {
        let mut oldest: Option<(K, Instant)> = None;

        self.entries
            .retain_async(|key, entry| {
                let older = oldest
                    .as_ref()
                    .is_none_or(|(_, seen)| entry.last_accessed_at < *seen);
                if older {
                    oldest = Some((key.clone(), entry.last_accessed_at));
                }
                true
            })
            .await;

        if let Some((key, _)) = oldest {
            let _ = self.entries.remove_async(&key).await;
        }
    }

    /// Blocking counterpart of [`get`](Self::get) for callers outside an
    /// async context.
    pub fn get_sync(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entry = self.entries.get_sync(key)?;

        if entry.get().is_expired(self.policy, self.ttl, now) {
            let _ = entry.remove_entry();
            return None;
        }

        let cached = entry.get_mut();
        cached.last_accessed_at = now;
        Some(cached.value.clone())
    }

    /// Blocking counterpart of [`put`](Self::put).
    pub fn put_sync(&self, key: K, value: V) {
        let now = Instant::now();

        if self.entries.len() >= self.max_size && !self.entries.contains_sync(&key) {
            let (policy, ttl) = (self.policy, self.ttl);
            let before = self.entries.len();
            self.entries
                .retain_sync(|_, entry| !entry.is_expired(policy, ttl, now));
            if before == self.entries.len() {
                self.evict_least_recently_used_sync();
            }
        }

        match self.entries.entry_sync(key) {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = CacheEntry::new(value, now);
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(CacheEntry::new(value, now));
            }
        }
    }

    fn evict_least_recently_used_sync(&self) {
        let mut oldest: Option<(K, Instant)> = None;

        self.entries.retain_sync(|key, entry| {
            let older = oldest
                .as_ref()
                .is_none_or(|(_, seen)| entry.last_accessed_at < *seen);
            if older {
                oldest = Some((key.clone(), entry.last_accessed_at));
            }
            true
        });

        if let Some((key, _)) = oldest {
            let _ = self.entries.remove_sync(&key);
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: ShutdownToken,
        name: &'static str,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            tracing::debug!(cache = name, removed, "Swept expired cache entries");
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        tracing::debug!(cache = name, "Cache sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::advance;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_after_write_expiry() {
        let cache = CredentialCache::new(10, Duration::from_secs(60), ExpirePolicy::AfterWrite);
        cache.put("alice".to_string(), 1u32).await;

        advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get(&"alice".to_string()).await, Some(1));

        // Reads do not extend the lifetime of an after-write entry
        advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(&"alice".to_string()).await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_read_expiry_is_extended_by_reads() {
        let cache = CredentialCache::new(10, Duration::from_secs(60), ExpirePolicy::AfterRead);
        cache.put("bob".to_string(), "v").await;

        for _ in 0..5 {
            advance(Duration::from_secs(45)).await;
            assert_eq!(cache.get(&"bob".to_string()).await, Some("v"));
        }

        advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&"bob".to_string()).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let cache = CredentialCache::new(2, Duration::from_secs(600), ExpirePolicy::AfterRead);
        cache.put(1u8, "one").await;
        advance(Duration::from_secs(1)).await;
        cache.put(2u8, "two").await;
        advance(Duration::from_secs(1)).await;

        // Touch 1 so that 2 becomes the eviction candidate
        assert_eq!(cache.get(&1).await, Some("one"));
        advance(Duration::from_secs(1)).await;
        cache.put(3u8, "three").await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2).await, None);
        assert_eq!(cache.get(&1).await, Some("one"));
        assert_eq!(cache.get(&3).await, Some("three"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = CredentialCache::new(10, Duration::from_secs(10), ExpirePolicy::AfterWrite);
        cache.put("old", 1).await;
        advance(Duration::from_secs(8)).await;
        cache.put("new", 2).await;
        advance(Duration::from_secs(3)).await;

        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"new").await, Some(2));
    }

    #[tokio::test]
    async fn test_get_or_load_does_not_cache_misses_or_failures() {
        let cache: CredentialCache<String, u32> =
            CredentialCache::new(10, Duration::from_secs(60), ExpirePolicy::AfterWrite);
        let calls = AtomicUsize::new(0);
        let key = "carol".to_string();

        let failed: Result<Option<u32>, &str> = cache
            .get_or_load(&key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("store offline")
            })
            .await;
        assert!(failed.is_err());

        let missing: Result<Option<u32>, &str> = cache
            .get_or_load(&key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await;
        assert_eq!(missing, Ok(None));

        for _ in 0..3 {
            let found: Result<Option<u32>, &str> = cache
                .get_or_load(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(7))
                })
                .await;
            assert_eq!(found, Ok(Some(7)));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_access_respects_capacity_and_ttl() {
        let cache = CredentialCache::new(3, Duration::from_secs(60), ExpirePolicy::AfterWrite);
        for n in 0..10u32 {
            cache.put_sync(n, n);
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_sync(&0), None);
        assert_eq!(cache.get_sync(&9), Some(9));

        advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get_sync(&9), None);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = CredentialCache::new(10, Duration::from_secs(60), ExpirePolicy::Never);
        cache.put("k", 1).await;
        assert!(cache.invalidate(&"k").await);
        assert!(!cache.invalidate(&"k").await);
        assert_eq!(cache.get(&"k").await, None);
    }
}
