use std::collections::HashMap;

use thiserror::Error;

use crate::tracer::record::TraceRecord;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("aggregation store full ({capacity} entries)")]
    Full { capacity: usize },
}

/// Fixed-capacity table of in-flight records keyed by correlation id.
///
/// The map is allocated once at its full size and never grows past it;
/// inserting a new key into a full store fails instead.
#[derive(Debug)]
pub struct AggregationStore {
    entries: HashMap<u32, TraceRecord>,
    capacity: usize,
}

impl AggregationStore {
    /// Allocate a store that holds at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Record stored under `key`, if any.
    pub fn lookup_or_none(&self, key: u32) -> Option<&TraceRecord> {
        self.entries.get(&key)
    }

    /// Insert or overwrite. Only a new key counts against capacity.
    pub fn insert(&mut self, key: u32, record: TraceRecord) -> Result<(), StoreError> {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = record;
            return Ok(());
        }

        if self.entries.len() >= self.capacity {
            return Err(StoreError::Full {
                capacity: self.capacity,
            });
        }

        self.entries.insert(key, record);
        Ok(())
    }

    /// Bump the merge counter of an existing record. Returns the new count,
    /// or `None` when the key is absent.
    pub fn increment(&mut self, key: u32, delta: u64) -> Option<u64> {
        let rec = self.entries.get_mut(&key)?;
        rec.counter = rec.counter.saturating_add(delta);
        Some(rec.counter)
    }

    /// Take the record stored under `key` out of the store.
    pub fn remove(&mut self, key: u32) -> Option<TraceRecord> {
        self.entries.remove(&key)
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of distinct keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(id: u32) -> TraceRecord {
        TraceRecord {
            id,
            counter: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut store = AggregationStore::new(4);
        assert!(store.lookup_or_none(1).is_none());

        store.insert(1, record(1)).unwrap();
        assert_eq!(store.lookup_or_none(1).map(|r| r.id), Some(1));
        assert_eq!(store.len(), 1);

        let removed = store.remove(1).expect("entry exists");
        assert_eq!(removed.id, 1);
        assert!(store.is_empty());
        assert!(store.remove(1).is_none());
    }

    #[test]
    fn test_full_store_rejects_new_keys() {
        let mut store = AggregationStore::new(2);
        store.insert(1, record(1)).unwrap();
        store.insert(2, record(2)).unwrap();

        assert_eq!(
            store.insert(3, record(3)),
            Err(StoreError::Full { capacity: 2 })
        );
        assert_eq!(store.len(), 2);

        // Overwriting an existing key is still allowed.
        store.insert(2, record(2)).unwrap();

        store.remove(1);
        store.insert(3, record(3)).unwrap();
    }

    #[test]
    fn test_increment() {
        let mut store = AggregationStore::new(2);
        store.insert(9, record(9)).unwrap();

        assert_eq!(store.increment(9, 1), Some(2));
        assert_eq!(store.increment(9, 3), Some(5));
        assert_eq!(store.increment(10, 1), None);
        assert_eq!(store.lookup_or_none(9).map(|r| r.counter), Some(5));
    }

    #[test]
    fn test_zero_capacity() {
        let mut store = AggregationStore::new(0);
        assert!(store.insert(1, record(1)).is_err());
    }
}
