//! Keyed result storage with per-slot expiry and invalidation-triggered refetch.
//!
//! Each base key owns one entry holding a root slot (the no-options result)
//! and one child slot per distinct options value. Values are stored as JSON,
//! so the cached copy never aliases the live data handed out to callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::key::{QueryKey, canonical_options};
use crate::toolkit::Registry;

/// A single cached value and the timer that will evict it.
struct Slot {
    value: String,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Cached values for one base key.
#[derive(Default)]
struct CacheEntry {
    root: Option<Slot>,
    children: HashMap<String, Slot>,
}

impl CacheEntry {
    fn is_empty(&self) -> bool {
        self.root.is_none() && self.children.is_empty()
    }
}

struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    generation: AtomicU64,
    registry: Weak<Registry>,
}

impl CacheInner {
    fn evict(&self, base_key: &str, child: Option<&str>, generation: u64) {
        let Entry::Occupied(mut occupied) = self.entries.entry(base_key.to_string()) else {
            return;
        };

        let entry = occupied.get_mut();
        let evicted = match child {
            None => entry
                .root
                .take_if(|slot| slot.generation == generation)
                .is_some(),
            Some(child) => {
                let current = entry
                    .children
                    .get(child)
                    .is_some_and(|slot| slot.generation == generation);
                current && entry.children.remove(child).is_some()
            }
        };

        if entry.is_empty() {
            occupied.remove();
        }
        if evicted {
            debug!(base_key, child, "Evicted expired cache slot");
        }
    }
}

/// Shared cache store for query results.
///
/// Cloning is cheap; clones share the same storage.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Creates a standalone cache that is not attached to any registry.
    ///
    /// Invalidating keys in a standalone cache only drops the stored values.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Weak::new())
    }

    pub(crate) fn with_registry(registry: Weak<Registry>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                generation: AtomicU64::new(0),
                registry,
            }),
        }
    }

    /// Stores `value` in the slot addressed by `key`, replacing any previous value.
    ///
    /// The slot is evicted once `ttl` has elapsed. Overwriting a slot cancels its
    /// previous timer. A zero `ttl` disables caching and the call does nothing.
    /// Writes made outside a tokio runtime are skipped, since no eviction timer
    /// could be scheduled for them.
    pub fn write<T: Serialize>(&self, key: &QueryKey, value: &T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let serialized = match serde_json::to_string(value) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(key = %key, error = %err, "Skipping cache write, value is not serializable");
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "Skipping cache write outside of a tokio runtime");
            return;
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let child = key.options.as_ref().map(canonical_options);

        // The shard stays locked until the slot is in place, so an eviction
        // timer that fires early blocks in `evict` instead of missing the slot.
        let mut entry = self.inner.entries.entry(key.base_key.clone()).or_default();
        let timer = self.schedule_eviction(&runtime, &key.base_key, child.clone(), generation, ttl);
        let slot = Slot {
            value: serialized,
            generation,
            timer: Some(timer),
        };
        match child {
            None => entry.root = Some(slot),
            Some(child) => {
                entry.children.insert(child, slot);
            }
        }
        drop(entry);
        debug!(key = %key, ?ttl, "Cached query data");
    }

    fn schedule_eviction(
        &self,
        runtime: &tokio::runtime::Handle,
        base_key: &str,
        child: Option<String>,
        generation: u64,
        ttl: Duration,
    ) -> AbortHandle {
        let inner = Arc::downgrade(&self.inner);
        let base_key = base_key.to_string();

        let task = runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = inner.upgrade() {
                inner.evict(&base_key, child.as_deref(), generation);
            }
        });
        task.abort_handle()
    }

    /// Reads the value cached for `key`.
    ///
    /// Returns `None` if the slot is empty, has expired, or holds data that does
    /// not decode as `T`.
    pub fn read<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let entry = self.inner.entries.get(&key.base_key)?;
        let slot = match &key.options {
            None => entry.root.as_ref(),
            Some(options) => entry.children.get(&canonical_options(options)),
        }?;

        match serde_json::from_str(&slot.value) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "Cached data could not be decoded, treating as a miss");
                None
            }
        }
    }

    /// Returns `true` if a value is cached for `key`.
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .get(&key.base_key)
            .is_some_and(|entry| match &key.options {
                None => entry.root.is_some(),
                Some(options) => entry.children.contains_key(&canonical_options(options)),
            })
    }

    /// Number of base keys with at least one cached value.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drops cached data for `key` and refetches the affected queries.
    ///
    /// Without options the whole base-key entry is dropped and every registered
    /// query under that base key refetches. With options only the matching
    /// child slot is dropped and only the query registered under exactly that
    /// key refetches. Refetches run concurrently; this resolves once all of
    /// them have settled, whether they succeeded or failed.
    pub async fn invalidate(&self, key: &QueryKey) {
        let dropped = match &key.options {
            None => self.inner.entries.remove(&key.base_key).is_some(),
            Some(options) => match self.inner.entries.entry(key.base_key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let dropped = occupied
                        .get_mut()
                        .children
                        .remove(&canonical_options(options))
                        .is_some();
                    if occupied.get().is_empty() {
                        occupied.remove();
                    }
                    dropped
                }
                Entry::Vacant(_) => false,
            },
        };

        let targets = self
            .inner
            .registry
            .upgrade()
            .map(|registry| registry.refetch_targets(key))
            .unwrap_or_default();

        debug!(key = %key, dropped, refetches = targets.len(), "Invalidating query");
        join_all(targets.iter().map(|query| query.refetch_boxed())).await;
    }

    /// Drops every cached value. Does not trigger any refetch.
    pub fn clear(&self) {
        self.inner.entries.clear();
        debug!("Cleared query cache");
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    fn todos() -> QueryKey {
        QueryKey::new("todos")
    }

    fn todo(id: u32) -> QueryKey {
        QueryKey::with_options("todos", json!({ "id": id }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_read() {
        let cache = QueryCache::new();
        assert!(cache.read::<Vec<String>>(&todos()).is_none());

        cache.write(&todos(), &vec!["a".to_string()], Duration::from_secs(60));

        assert_eq!(cache.read::<Vec<String>>(&todos()), Some(vec!["a".to_string()]));
        assert!(cache.contains(&todos()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_and_children_are_separate_slots() {
        let cache = QueryCache::new();
        cache.write(&todos(), &0, Duration::from_secs(60));
        cache.write(&todo(1), &1, Duration::from_secs(60));
        cache.write(&todo(2), &2, Duration::from_secs(60));

        assert_eq!(cache.read::<i32>(&todos()), Some(0));
        assert_eq!(cache.read::<i32>(&todo(1)), Some(1));
        assert_eq!(cache.read::<i32>(&todo(2)), Some(2));
        assert!(cache.read::<i32>(&todo(3)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_expires_after_ttl() {
        let cache = QueryCache::new();
        cache.write(&todos(), &42, Duration::from_secs(60));

        sleep(Duration::from_secs(59)).await;
        assert_eq!(cache.read::<i32>(&todos()), Some(42));

        sleep(Duration::from_secs(2)).await;
        assert!(cache.read::<i32>(&todos()).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_disables_caching() {
        let cache = QueryCache::new();
        cache.write(&todos(), &42, Duration::ZERO);
        assert!(cache.read::<i32>(&todos()).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_reschedules_eviction() {
        let cache = QueryCache::new();
        cache.write(&todos(), &1, Duration::from_secs(10));

        sleep(Duration::from_secs(5)).await;
        cache.write(&todos(), &2, Duration::from_secs(10));

        // The first timer would have fired here.
        sleep(Duration::from_secs(7)).await;
        assert_eq!(cache.read::<i32>(&todos()), Some(2));

        sleep(Duration::from_secs(4)).await;
        assert!(cache.read::<i32>(&todos()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_is_per_slot() {
        let cache = QueryCache::new();
        cache.write(&todos(), &0, Duration::from_secs(10));
        cache.write(&todo(1), &1, Duration::from_secs(60));

        sleep(Duration::from_secs(11)).await;
        assert!(cache.read::<i32>(&todos()).is_none());
        assert_eq!(cache.read::<i32>(&todo(1)), Some(1));
        assert_eq!(cache.len(), 1);

        sleep(Duration::from_secs(50)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_with_wrong_type_is_a_miss() {
        let cache = QueryCache::new();
        cache.write(&todos(), &"text", Duration::from_secs(60));
        assert!(cache.read::<i32>(&todos()).is_none());
        assert_eq!(cache.read::<String>(&todos()), Some("text".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_value_is_a_copy() {
        let cache = QueryCache::new();
        let mut live = vec![1, 2];
        cache.write(&todos(), &live, Duration::from_secs(60));
        live.push(3);

        assert_eq!(cache.read::<Vec<i32>>(&todos()), Some(vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_without_options_drops_whole_entry() {
        let cache = QueryCache::new();
        cache.write(&todos(), &0, Duration::from_secs(60));
        cache.write(&todo(1), &1, Duration::from_secs(60));

        cache.invalidate(&todos()).await;

        assert!(cache.read::<i32>(&todos()).is_none());
        assert!(cache.read::<i32>(&todo(1)).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_with_options_drops_only_that_child() {
        let cache = QueryCache::new();
        cache.write(&todos(), &0, Duration::from_secs(60));
        cache.write(&todo(1), &1, Duration::from_secs(60));
        cache.write(&todo(2), &2, Duration::from_secs(60));

        cache.invalidate(&todo(1)).await;

        assert_eq!(cache.read::<i32>(&todos()), Some(0));
        assert!(cache.read::<i32>(&todo(1)).is_none());
        assert_eq!(cache.read::<i32>(&todo(2)), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_last_child_removes_entry() {
        let cache = QueryCache::new();
        cache.write(&todo(1), &1, Duration::from_secs(60));

        cache.invalidate(&todo(1)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_missing_entry_is_harmless() {
        let cache = QueryCache::new();
        cache.invalidate(&todos()).await;
        cache.invalidate(&todo(1)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear() {
        let cache = QueryCache::new();
        cache.write(&todos(), &0, Duration::from_secs(60));
        cache.write(&QueryKey::new("users"), &1, Duration::from_secs(60));

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.read::<i32>(&todos()).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tiny_ttl_always_expires() {
        let cache = QueryCache::new();
        for i in 0..500 {
            let key = QueryKey::with_options("todos", json!({ "page": i }));
            cache.write(&key, &i, Duration::from_nanos(1));
        }

        // Timers that fire while the write is still inserting must wait for it.
        sleep(Duration::from_millis(200)).await;
        assert!(cache.is_empty());
    }

    #[test]
    fn test_write_outside_runtime_is_skipped() {
        let cache = QueryCache::new();
        cache.write(&todos(), &42, Duration::from_secs(60));
        assert!(cache.read::<i32>(&todos()).is_none());
    }
}
