//! Short-term memoization cache
//!
//! TTL-bounded and size-bounded (LRU). Entries expire lazily on access;
//! failures here only cost a cache miss, never a decision.

use crate::clock::Clock;
use crate::types::MemoryRecord;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct CacheEntry {
    record: MemoryRecord,
    inserted_at: Duration,
    last_access: u64,
}

pub struct ShortTermCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
    entries: HashMap<Uuid, CacheEntry>,
    access_counter: u64,
}

impl ShortTermCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, capacity: usize) -> Self {
        Self {
            clock,
            ttl,
            capacity,
            entries: HashMap::new(),
            access_counter: 0,
        }
    }

    pub fn insert(&mut self, record: MemoryRecord) {
        let now = self.clock.now();
        self.access_counter += 1;
        if !self.entries.contains_key(&record.id) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.entries.insert(
            record.id,
            CacheEntry {
                record,
                inserted_at: now,
                last_access: self.access_counter,
            },
        );
    }

    pub fn get(&mut self, id: &Uuid) -> Option<MemoryRecord> {
        let now = self.clock.now();
        let entry = self.entries.get(id)?;
        if now.saturating_sub(entry.inserted_at) >= self.ttl {
            self.entries.remove(id);
            return None;
        }
        self.access_counter += 1;
        let counter = self.access_counter;
        let entry = self.entries.get_mut(id)?;
        entry.last_access = counter;
        Some(entry.record.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&mut self) {
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(id, _)| *id)
        {
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::RecordKind;
    use chrono::{TimeZone, Utc};

    fn record() -> MemoryRecord {
        MemoryRecord::new(RecordKind::Observation, serde_json::json!({"v": 1}))
    }

    fn cache(ttl_secs: u64, capacity: usize) -> (Arc<ManualClock>, ShortTermCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let cache = ShortTermCache::new(clock.clone(), Duration::from_secs(ttl_secs), capacity);
        (clock, cache)
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let (clock, mut cache) = cache(60, 8);
        let r = record();
        let id = r.id;
        cache.insert(r);
        assert!(cache.get(&id).is_some());

        clock.advance(Duration::from_secs(61));
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let (_clock, mut cache) = cache(3600, 2);
        let a = record();
        let b = record();
        let c = record();
        let (ida, idb, idc) = (a.id, b.id, c.id);

        cache.insert(a);
        cache.insert(b);
        // Touch a so b becomes the least recently used.
        assert!(cache.get(&ida).is_some());
        cache.insert(c);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&idb).is_none());
        assert!(cache.get(&ida).is_some());
        assert!(cache.get(&idc).is_some());
    }

    #[test]
    fn test_reinsert_same_id_does_not_evict() {
        let (_clock, mut cache) = cache(3600, 2);
        let a = record();
        let b = record();
        let ida = a.id;
        cache.insert(a.clone());
        cache.insert(b);
        cache.insert(a);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ida).is_some());
    }
}
