use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Bounded LRU cache for embeddings keyed by (model, text).
///
/// Recency is tracked with a monotonic tick per entry plus a queue of
/// (tick, key) observations; stale queue entries are discarded lazily during
/// eviction, keeping both lookup and eviction amortized O(1).
pub struct EmbeddingCache {
    max_entries: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    recency: VecDeque<(u64, String)>,
    tick: u64,
}

struct CacheEntry {
    vector: Vec<f32>,
    tick: u64,
}

impl EmbeddingCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                tick: 0,
            }),
        }
    }

    /// Cache key for a (model, text) pair.
    pub fn key(model: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        if self.max_entries == 0 {
            return None;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        let vector = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.tick = tick;
                Some(entry.vector.clone())
            }
            None => None,
        };
        if vector.is_some() {
            inner.recency.push_back((tick, key.to_string()));
        }
        vector
    }

    pub fn put(&self, key: String, vector: Vec<f32>) {
        if self.max_entries == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        inner.recency.push_back((tick, key.clone()));
        inner.entries.insert(key, CacheEntry { vector, tick });

        while inner.entries.len() > self.max_entries {
            match inner.recency.pop_front() {
                Some((seen_tick, seen_key)) => {
                    // Only evict if this observation is the entry's latest.
                    let is_current = inner
                        .entries
                        .get(&seen_key)
                        .is_some_and(|e| e.tick == seen_tick);
                    if is_current {
                        inner.entries.remove(&seen_key);
                    }
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.recency.clear();
    }
}
