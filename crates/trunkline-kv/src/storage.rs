//! Storage engine boundary.
//!
//! The framework treats storage as an external collaborator: handlers call
//! it, nothing else knows it exists. Concurrent access across connections
//! is the engine's own business, which the in-memory engine settles with a
//! plain mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

/// What the key/value handlers need from an engine.
pub trait Storage: Send + Sync + 'static {
    /// Value under `key`, if any.
    fn get(&self, key: u64) -> Option<Bytes>;
    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: u64, value: Bytes);
    /// Point-in-time copy of all records, the iteration basis of GetAll.
    fn snapshot(&self) -> Vec<(u64, Bytes)>;
    /// Number of records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash-map engine for tests and demos.
#[derive(Debug, Default)]
pub struct MemStorage {
    map: Mutex<HashMap<u64, Bytes>>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage::default()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: u64) -> Option<Bytes> {
        self.map.lock().unwrap().get(&key).cloned()
    }

    fn put(&self, key: u64, value: Bytes) {
        self.map.lock().unwrap().insert(key, value);
    }

    fn snapshot(&self) -> Vec<(u64, Bytes)> {
        let map = self.map.lock().unwrap();
        let mut records: Vec<(u64, Bytes)> = map.iter().map(|(k, v)| (*k, v.clone())).collect();
        records.sort_by_key(|(k, _)| *k);
        records
    }

    fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_replace() {
        let storage = MemStorage::new();
        assert_eq!(storage.get(23), None);
        storage.put(23, Bytes::from_static(b"hello"));
        assert_eq!(storage.get(23), Some(Bytes::from_static(b"hello")));
        storage.put(23, Bytes::from_static(b"world"));
        assert_eq!(storage.get(23), Some(Bytes::from_static(b"world")));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_copy() {
        let storage = MemStorage::new();
        storage.put(2, Bytes::from_static(b"b"));
        storage.put(1, Bytes::from_static(b"a"));
        let snap = storage.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, 1);
        assert_eq!(snap[1].0, 2);

        storage.put(3, Bytes::from_static(b"c"));
        assert_eq!(snap.len(), 2);
    }
}
