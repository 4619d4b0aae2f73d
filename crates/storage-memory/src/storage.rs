//! In-memory key-value store.

use im::OrdMap;
use lodestone_storage::{keys, RawKvStore, StoreError, StoreResult};
use std::sync::RwLock;

/// In-memory storage for simulation and testing.
///
/// Uses `im::OrdMap` which provides:
/// - Deterministic ordering (like BTreeMap)
/// - O(1) clone via structural sharing
///
/// Same operations produce identical results across runs, and prefix scans
/// come out in ascending key order for free.
pub struct MemoryKvStore {
    data: RwLock<OrdMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(OrdMap::new()),
        }
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Drop all data (useful for testing).
    pub fn clear(&self) {
        self.data.write().unwrap().clear();
    }

    /// Delete a key without going through [`RawKvStore::remove`].
    ///
    /// Test hook for simulating store corruption (a trie node vanishing
    /// from under a live root).
    pub fn corrupt_remove(&self, key: &[u8]) -> bool {
        self.data.write().unwrap().remove(key).is_some()
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RawKvStore for MemoryKvStore {
    fn get_opt(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut data = self.data.write().unwrap();
        match data.get(key) {
            Some(existing) if existing == value => Ok(()),
            Some(_) => Err(StoreError::content_mismatch(key)),
            None => {
                data.insert(key.to_vec(), value.to_vec());
                Ok(())
            }
        }
    }

    fn remove(&self, key: &[u8]) -> StoreResult<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read().unwrap();
        let iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)> + '_> =
            match keys::next_prefix(prefix) {
                Some(end) => Box::new(data.range(prefix.to_vec()..end)),
                None => Box::new(data.range(prefix.to_vec()..)),
            };
        Ok(iter
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
