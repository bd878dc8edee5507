use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use farfield_common::{SceneDescription, VariantId};
use serde::{Deserialize, Serialize};

/// Cache key: source path plus variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetKey {
    pub path: String,
    pub variant: VariantId,
}

impl AssetKey {
    pub fn new(path: impl Into<String>, variant: VariantId) -> Self {
        Self {
            path: path.into(),
            variant,
        }
    }
}

struct CacheEntry {
    payload: Arc<SceneDescription>,
    stamp: u64,
    ref_count: u32,
}

/// Hit/miss and occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes: usize,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

struct CacheInner {
    entries: HashMap<AssetKey, CacheEntry>,
    stamp: u64,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Maps (path, variant) to converted scene descriptions.
///
/// Least-recently-used entries are evicted once the cache is over its entry
/// or byte ceiling, except entries with a positive ref count: those are
/// attached to the live scene and must survive regardless of recency.
///
/// Shared between the main thread and workers; one narrow mutex guards the
/// map, held only for the map operation, never across a decode.
pub struct AssetCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    max_bytes: usize,
}

impl AssetCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stamp: 0,
                bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_entries,
            max_bytes,
        }
    }

    /// Look up a converted asset, refreshing its recency on hit.
    pub fn get(&self, key: &AssetKey) -> Option<Arc<SceneDescription>> {
        let mut inner = self.inner.lock().expect("asset cache poisoned");
        inner.stamp += 1;
        let stamp = inner.stamp;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.stamp = stamp;
                let payload = Arc::clone(&entry.payload);
                inner.hits += 1;
                Some(payload)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a converted asset, evicting stale unpinned entries if the
    /// cache goes over budget. Never blocks and never fails; if everything
    /// is pinned the cache temporarily runs over budget.
    pub fn insert(&self, key: AssetKey, payload: Arc<SceneDescription>) {
        let mut inner = self.inner.lock().expect("asset cache poisoned");
        inner.stamp += 1;
        let stamp = inner.stamp;
        if let Some(old) = inner.entries.remove(&key) {
            inner.bytes = inner.bytes.saturating_sub(old.payload.approx_bytes);
        }
        inner.bytes += payload.approx_bytes;
        inner.entries.insert(
            key,
            CacheEntry {
                payload,
                stamp,
                ref_count: 0,
            },
        );
        Self::evict_over_budget(&mut inner, self.max_entries, self.max_bytes);
    }

    /// Mark an entry as attached to the live scene. Pinned entries are
    /// never evicted.
    pub fn pin(&self, key: &AssetKey) {
        let mut inner = self.inner.lock().expect("asset cache poisoned");
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.ref_count += 1;
        }
    }

    /// Drop one attachment reference.
    pub fn unpin(&self, key: &AssetKey) {
        let mut inner = self.inner.lock().expect("asset cache poisoned");
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    pub fn contains(&self, key: &AssetKey) -> bool {
        let inner = self.inner.lock().expect("asset cache poisoned");
        inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("asset cache poisoned");
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("asset cache poisoned");
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
            bytes: inner.bytes,
            evictions: inner.evictions,
        }
    }

    fn evict_over_budget(inner: &mut CacheInner, max_entries: usize, max_bytes: usize) {
        while inner.entries.len() > max_entries || inner.bytes > max_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else {
                // Everything live is pinned; nothing can go.
                break;
            };
            if let Some(evicted) = inner.entries.remove(&key) {
                inner.bytes = inner.bytes.saturating_sub(evicted.payload.approx_bytes);
                inner.evictions += 1;
                tracing::trace!(path = %key.path, "evicted converted asset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farfield_common::NodeKind;

    fn scene(name: &str, bytes: usize) -> Arc<SceneDescription> {
        Arc::new(SceneDescription {
            name: name.into(),
            kind: NodeKind::Object,
            vertex_count: 4,
            index_count: 6,
            approx_bytes: bytes,
        })
    }

    fn key(n: u32) -> AssetKey {
        AssetKey::new(format!("meshes/{n}.bin"), VariantId::BASE)
    }

    #[test]
    fn insert_then_get() {
        let cache = AssetCache::new(8, 1 << 20);
        cache.insert(key(1), scene("a", 100));
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(2)).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn lru_eviction_on_entry_ceiling() {
        let cache = AssetCache::new(3, 1 << 20);
        for n in 0..3 {
            cache.insert(key(n), scene("s", 10));
        }
        // Touch 0 so 1 is the least recently used.
        assert!(cache.get(&key(0)).is_some());

        cache.insert(key(3), scene("s", 10));
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let cache = AssetCache::new(2, 1 << 20);
        cache.insert(key(0), scene("pinned", 10));
        cache.pin(&key(0));
        cache.insert(key(1), scene("s", 10));
        cache.insert(key(2), scene("s", 10));
        cache.insert(key(3), scene("s", 10));

        // The pinned entry is the oldest by recency but must survive.
        assert!(cache.contains(&key(0)));
        assert_eq!(cache.len(), 2);

        cache.unpin(&key(0));
        cache.insert(key(4), scene("s", 10));
        cache.insert(key(5), scene("s", 10));
        assert!(!cache.contains(&key(0)));
    }

    #[test]
    fn byte_ceiling_triggers_eviction() {
        let cache = AssetCache::new(100, 250);
        cache.insert(key(0), scene("s", 100));
        cache.insert(key(1), scene("s", 100));
        cache.insert(key(2), scene("s", 100));
        assert!(cache.stats().bytes <= 250);
        assert!(!cache.contains(&key(0)));
    }

    #[test]
    fn all_pinned_runs_over_budget_without_blocking() {
        let cache = AssetCache::new(1, 1 << 20);
        cache.insert(key(0), scene("s", 10));
        cache.pin(&key(0));
        cache.insert(key(1), scene("s", 10));
        cache.pin(&key(1));
        // Over the entry ceiling, but both are pinned.
        assert_eq!(cache.len(), 2);
    }
}
