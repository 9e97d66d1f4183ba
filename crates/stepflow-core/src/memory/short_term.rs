//! Capacity-bounded LRU memory.
//!
//! Entries live in a slab (`Vec` of nodes plus a free list) threaded by a
//! doubly linked list in recency order, with a `HashMap` from key to slot.
//! Lookup with reorder, insert and eviction of the least recently used entry
//! are all O(1).

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use stepflow_types::error::RepositoryError;

use super::store::MemoryStore;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: String,
    value: Value,
    prev: usize,
    next: usize,
}

/// Hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl MemoryStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct Lru {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self.node(slot).map(|n| (n.prev, n.next)) else {
            return;
        };
        match self.node_mut(prev) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match self.node_mut(next) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = NIL;
            node.next = old_head;
        }
        match self.node_mut(old_head) {
            Some(h) => h.prev = slot,
            None => self.tail = slot,
        }
        self.head = slot;
    }

    fn touch(&mut self, slot: usize) {
        if self.head != slot {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn get(&mut self, key: &str) -> Option<Value> {
        match self.index.get(key).copied() {
            Some(slot) => {
                self.touch(slot);
                self.hits += 1;
                self.node(slot).map(|n| n.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace; returns the evicted key, if any.
    fn put(&mut self, key: &str, value: Value) -> Option<String> {
        if let Some(slot) = self.index.get(key).copied() {
            if let Some(node) = self.node_mut(slot) {
                node.value = value;
            }
            self.touch(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.evict_lru()
        } else {
            None
        };

        let node = Node {
            key: key.to_string(),
            value,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key.to_string(), slot);
        self.push_front(slot);
        evicted
    }

    fn evict_lru(&mut self) -> Option<String> {
        let slot = self.tail;
        self.unlink(slot);
        let node = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.index.remove(&node.key);
        self.evictions += 1;
        Some(node.key)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Nodes from most to least recently used.
    fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
        std::iter::successors(self.node(self.head), |n| self.node(n.next))
    }
}

// ---------------------------------------------------------------------------
// ShortTermMemory
// ---------------------------------------------------------------------------

/// In-process LRU key/value memory, safe to share across workers.
#[derive(Debug)]
pub struct ShortTermMemory {
    inner: Mutex<Lru>,
}

impl ShortTermMemory {
    /// Memory holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::new(capacity.max(1))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lru> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key)
    }

    /// Insert or replace `key`. Returns the key evicted to make room, if any.
    pub fn put(&self, key: &str, value: Value) -> Option<String> {
        let evicted = self.lock().put(key, value);
        if let Some(old) = &evicted {
            tracing::trace!(evicted = %old, "short-term memory evicted entry");
        }
        evicted
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        let lru = self.lock();
        MemoryStats {
            entries: lru.index.len(),
            capacity: lru.capacity,
            hits: lru.hits,
            misses: lru.misses,
            evictions: lru.evictions,
        }
    }

    fn matching(&self, query: &str, limit: usize) -> Vec<(String, Value)> {
        let needle = query.to_lowercase();
        self.lock()
            .iter()
            .filter(|n| {
                needle.is_empty()
                    || n.key.to_lowercase().contains(&needle)
                    || value_text(&n.value).to_lowercase().contains(&needle)
            })
            .take(limit)
            .map(|n| (n.key.clone(), n.value.clone()))
            .collect()
    }

    fn keys(&self) -> Vec<String> {
        self.lock().iter().map(|n| n.key.clone()).collect()
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl MemoryStore for ShortTermMemory {
    async fn store(&self, key: &str, value: Value) -> Result<(), RepositoryError> {
        self.put(key, value);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        Ok(self.get(key))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, Value)>, RepositoryError> {
        Ok(self.matching(query, limit))
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        self.lock().clear();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, RepositoryError> {
        Ok(self.keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_evicts_least_recently_used() {
        let mem = ShortTermMemory::new(2);
        assert_eq!(mem.put("a", json!(1)), None);
        assert_eq!(mem.put("b", json!(2)), None);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(mem.get("a"), Some(json!(1)));
        assert_eq!(mem.put("c", json!(3)), Some("b".to_string()));

        assert!(mem.contains("a"));
        assert!(!mem.contains("b"));
        assert!(mem.contains("c"));
        assert_eq!(mem.len(), 2);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let mem = ShortTermMemory::new(2);
        mem.put("a", json!(1));
        mem.put("b", json!(2));
        assert_eq!(mem.put("a", json!(10)), None);
        assert_eq!(mem.get("a"), Some(json!(10)));
        assert_eq!(mem.put("c", json!(3)), Some("b".to_string()));
    }

    #[test]
    fn test_slots_reused_after_eviction() {
        let mem = ShortTermMemory::new(3);
        for i in 0..100 {
            mem.put(&format!("k{i}"), json!(i));
        }
        assert_eq!(mem.len(), 3);
        assert!(mem.lock().slots.len() <= 3);
        assert_eq!(mem.keys(), vec!["k99", "k98", "k97"]);
        assert_eq!(mem.stats().evictions, 97);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let mem = ShortTermMemory::new(4);
        mem.put("x", json!("y"));
        mem.get("x");
        mem.get("x");
        mem.get("missing");
        let stats = mem.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(MemoryStats::default().hit_ratio(), 0.0);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mem = ShortTermMemory::new(0);
        mem.put("a", json!(1));
        assert_eq!(mem.put("b", json!(2)), Some("a".to_string()));
        assert_eq!(mem.stats().capacity, 1);
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let mem = ShortTermMemory::new(8);
        mem.store("plan/goal", json!("Add OAuth login")).await.unwrap();
        mem.store("step/1/output", json!({ "files": ["auth.rs"] })).await.unwrap();
        mem.store("step/2/output", json!("tests pass")).await.unwrap();

        assert_eq!(
            mem.retrieve("plan/goal").await.unwrap(),
            Some(json!("Add OAuth login"))
        );
        assert_eq!(mem.retrieve("nope").await.unwrap(), None);

        let hits = mem.search("OUTPUT", 10).await.unwrap();
        let keys: Vec<&str> = hits.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["step/2/output", "step/1/output"]);

        let by_value = mem.search("auth.rs", 10).await.unwrap();
        assert_eq!(by_value.len(), 1);
        assert_eq!(by_value[0].0, "step/1/output");

        assert_eq!(mem.search("", 2).await.unwrap().len(), 2);

        // retrieve moved plan/goal to the front.
        assert_eq!(
            mem.list().await.unwrap(),
            vec!["plan/goal", "step/2/output", "step/1/output"]
        );

        mem.clear().await.unwrap();
        assert!(mem.is_empty());
        assert!(mem.list().await.unwrap().is_empty());
        mem.store("again", json!(true)).await.unwrap();
        assert_eq!(mem.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_across_tasks() {
        let mem = Arc::new(ShortTermMemory::new(64));
        let mut handles = Vec::new();
        for t in 0..4 {
            let mem = mem.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..8 {
                    mem.store(&format!("t{t}/{i}"), json!(i)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(mem.len(), 32);
    }
}
