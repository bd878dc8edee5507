use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// LRU byte cache bounded by total payload bytes, not entry count.
///
/// Recency is tracked with monotonically increasing stamps and a queue of
/// (path, stamp) pairs; stale queue entries are skipped on eviction and the
/// queue is compacted when it grows well past the live entry count.
#[derive(Debug)]
pub struct ByteCache {
    map: HashMap<String, CachedBytes>,
    lru: VecDeque<(String, u64)>,
    stamp: u64,
    bytes: usize,
    budget: usize,
}

#[derive(Debug)]
struct CachedBytes {
    data: Arc<Vec<u8>>,
    stamp: u64,
}

impl ByteCache {
    pub fn new(budget: usize) -> Self {
        Self {
            map: HashMap::new(),
            lru: VecDeque::new(),
            stamp: 0,
            bytes: 0,
            budget,
        }
    }

    pub fn get(&mut self, path: &str) -> Option<Arc<Vec<u8>>> {
        self.stamp += 1;
        let stamp = self.stamp;
        let entry = self.map.get_mut(path)?;
        entry.stamp = stamp;
        let data = Arc::clone(&entry.data);
        self.lru.push_back((path.to_owned(), stamp));
        self.maybe_compact();
        Some(data)
    }

    pub fn put(&mut self, path: &str, data: Arc<Vec<u8>>) {
        if data.len() > self.budget {
            return;
        }
        if let Some(old) = self.map.remove(path) {
            self.bytes = self.bytes.saturating_sub(old.data.len());
        }
        self.stamp += 1;
        self.bytes += data.len();
        self.map
            .insert(path.to_owned(), CachedBytes { data, stamp: self.stamp });
        self.lru.push_back((path.to_owned(), self.stamp));
        self.evict_over_budget();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn evict_over_budget(&mut self) {
        while self.bytes > self.budget {
            let Some((path, stamp)) = self.lru.pop_front() else {
                break;
            };
            // A newer stamp means the entry was touched since this queue
            // record was pushed; skip it.
            let live = self.map.get(&path).is_some_and(|e| e.stamp == stamp);
            if !live {
                continue;
            }
            if let Some(evicted) = self.map.remove(&path) {
                self.bytes = self.bytes.saturating_sub(evicted.data.len());
                tracing::trace!(path, bytes = evicted.data.len(), "evicted from byte cache");
            }
        }
    }

    fn maybe_compact(&mut self) {
        let max = self.map.len().saturating_mul(8).max(1024);
        if self.lru.len() <= max {
            return;
        }
        let mut fresh = VecDeque::with_capacity(self.map.len());
        for (path, entry) in &self.map {
            fresh.push_back((path.clone(), entry.stamp));
        }
        fresh.make_contiguous().sort_by_key(|&(_, s)| s);
        self.lru = fresh;
    }
}
