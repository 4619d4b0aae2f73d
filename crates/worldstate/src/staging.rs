//! Rollbackable speculative layer over a cached trie.

use crate::cached::{scan_overlay, CachedTrie, Pending};
use lodestone_codec::Codec;
use lodestone_storage::{RawKvStore, StoreResult};
use std::collections::BTreeMap;

/// A speculative mutation layer over a [`CachedTrie`].
///
/// Transaction execution mutates a staging view; the whole batch then
/// either folds into the enclosing cache ([`commit`](Self::commit)) or
/// evaporates ([`rollback`](Self::rollback)). Both consume the staging
/// value, so a closed staging view cannot be touched — the open/closed
/// state machine is enforced by ownership rather than checked at runtime.
///
/// The exclusive borrow of the parent also means the cache cannot drift
/// while speculation is in flight, and parent reads through a shared
/// reference elsewhere see none of the staged changes until commit.
pub struct StagingTrie<'a, K, V, S> {
    parent: &'a mut CachedTrie<K, V, S>,
    pending: BTreeMap<Vec<u8>, Pending<K, V>>,
}

impl<'a, K, V, S> StagingTrie<'a, K, V, S>
where
    K: Codec + Clone,
    V: Codec + Clone,
    S: RawKvStore,
{
    /// Open a staging view over `parent`.
    pub fn new(parent: &'a mut CachedTrie<K, V, S>) -> Self {
        Self {
            parent,
            pending: BTreeMap::new(),
        }
    }

    /// Number of staged mutations.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Look up a key through the staging layer, then the parent.
    pub fn get_opt(&self, key: &K) -> StoreResult<Option<V>> {
        match self.pending.get(&key.encode()) {
            Some(Pending::Inserted(_, v)) | Some(Pending::Updated(_, v)) => Ok(Some(v.clone())),
            Some(Pending::Removed(_)) => Ok(None),
            None => self.parent.get_opt(key),
        }
    }

    /// Look up a key, failing when absent.
    pub fn get(&self, key: &K) -> StoreResult<V> {
        self.get_opt(key)?
            .ok_or_else(|| CachedTrie::<K, V, S>::key_not_found(key))
    }

    /// Check key presence.
    pub fn exists(&self, key: &K) -> StoreResult<bool> {
        Ok(self.get_opt(key)?.is_some())
    }

    /// Stage an insert or overwrite.
    ///
    /// Markers are classified relative to the view through the parent;
    /// [`CachedTrie::merge_marker`] renormalises them on commit.
    pub fn put(&mut self, key: K, value: V) -> StoreResult<()> {
        let encoded = key.encode();
        let marker = match self.pending.get(&encoded) {
            Some(Pending::Inserted(..)) => Pending::Inserted(key, value),
            Some(Pending::Updated(..)) | Some(Pending::Removed(_)) => Pending::Updated(key, value),
            None => match self.parent.pending().get(&encoded) {
                Some(Pending::Inserted(..)) | Some(Pending::Updated(..)) => {
                    Pending::Updated(key, value)
                }
                Some(Pending::Removed(_)) => Pending::Inserted(key, value),
                None => {
                    if self.parent.base().exists(&key)? {
                        Pending::Updated(key, value)
                    } else {
                        Pending::Inserted(key, value)
                    }
                }
            },
        };
        self.pending.insert(encoded, marker);
        Ok(())
    }

    /// Stage a removal. Fails with `KeyNotFound` when the key is not
    /// visible through this view.
    pub fn remove(&mut self, key: &K) -> StoreResult<()> {
        let encoded = key.encode();
        match self.pending.get(&encoded) {
            Some(Pending::Inserted(..)) => {
                self.pending.remove(&encoded);
                Ok(())
            }
            Some(Pending::Updated(..)) => {
                self.pending.insert(encoded, Pending::Removed(key.clone()));
                Ok(())
            }
            Some(Pending::Removed(_)) => Err(CachedTrie::<K, V, S>::key_not_found(key)),
            None => match self.parent.pending().get(&encoded) {
                Some(Pending::Inserted(..)) | Some(Pending::Updated(..)) => {
                    self.pending.insert(encoded, Pending::Removed(key.clone()));
                    Ok(())
                }
                Some(Pending::Removed(_)) => Err(CachedTrie::<K, V, S>::key_not_found(key)),
                None => {
                    if self.parent.base().exists(key)? {
                        self.pending.insert(encoded, Pending::Removed(key.clone()));
                        Ok(())
                    } else {
                        Err(CachedTrie::<K, V, S>::key_not_found(key))
                    }
                }
            },
        }
    }

    /// Fold the staged mutations into the parent cache (staged entries
    /// win on conflict) and close this view.
    ///
    /// Pure map merging: O(staged entries), no byte-store access.
    pub fn commit(self) {
        let Self { parent, pending } = self;
        for (encoded, marker) in pending {
            parent.merge_marker(encoded, marker);
        }
    }

    /// Discard the staged mutations and close this view.
    pub fn rollback(self) {
        // Dropping the pending map is the whole operation.
    }

    /// Entries under a digest prefix, as seen through this view.
    ///
    /// Union of the persisted scan, the parent's pending map, and the
    /// staged map, outermost layer winning.
    pub fn scan<F>(&self, prefix: &[u8], max: usize, pred: F) -> StoreResult<Vec<(K, V)>>
    where
        F: Fn(&K, &V) -> bool,
    {
        scan_overlay(
            self.parent.base(),
            [self.parent.pending(), &self.pending],
            prefix,
            max,
            pred,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_storage_memory::MemoryKvStore;
    use lodestone_storage::StoreError;
    use lodestone_trie::SparseMerkleTrie;
    use std::sync::Arc;

    type TestTrie = SparseMerkleTrie<Vec<u8>, Vec<u8>, MemoryKvStore>;
    type TestCache = CachedTrie<Vec<u8>, Vec<u8>, MemoryKvStore>;

    fn cache_with(entries: &[(&[u8], &[u8])]) -> TestCache {
        let mut trie = TestTrie::empty(Arc::new(MemoryKvStore::new()));
        for (k, v) in entries {
            trie = trie.put(&k.to_vec(), &v.to_vec()).unwrap();
        }
        TestCache::new(trie)
    }

    #[test]
    fn test_staging_reads_through_parent() {
        let mut cache = cache_with(&[(b"a", b"1")]);
        cache.put(b"b".to_vec(), b"2".to_vec()).unwrap();

        let staging = StagingTrie::new(&mut cache);
        assert_eq!(staging.get(&b"a".to_vec()).unwrap(), b"1".to_vec());
        assert_eq!(staging.get(&b"b".to_vec()).unwrap(), b"2".to_vec());
    }

    #[test]
    fn test_rollback_discards_everything() {
        let mut cache = cache_with(&[(b"a", b"1")]);
        let mut staging = StagingTrie::new(&mut cache);
        staging.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        staging.remove(&b"a".to_vec()).unwrap();
        assert_eq!(staging.get_opt(&b"a".to_vec()).unwrap(), None);
        staging.rollback();

        assert_eq!(cache.get(&b"a".to_vec()).unwrap(), b"1".to_vec());
        assert_eq!(cache.get_opt(&b"b".to_vec()).unwrap(), None);
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_commit_folds_into_parent() {
        let mut cache = cache_with(&[(b"a", b"1")]);
        let mut staging = StagingTrie::new(&mut cache);
        staging.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        staging.remove(&b"a".to_vec()).unwrap();
        staging.commit();

        assert_eq!(cache.get_opt(&b"a".to_vec()).unwrap(), None);
        assert_eq!(cache.get(&b"b".to_vec()).unwrap(), b"2".to_vec());
    }

    #[test]
    fn test_commit_normalises_against_parent_inserts() {
        // Parent holds a buffered insert that never reached the base;
        // staging removes it; after commit the parent buffer must be
        // empty, not holding a bogus remove of a base-absent key.
        let mut cache = cache_with(&[]);
        cache.put(b"fresh".to_vec(), b"v".to_vec()).unwrap();

        let mut staging = StagingTrie::new(&mut cache);
        staging.remove(&b"fresh".to_vec()).unwrap();
        staging.commit();

        assert_eq!(cache.pending_len(), 0);
        let root_before = cache.base().root_hash();
        assert_eq!(cache.persist().unwrap().root_hash(), root_before);
    }

    #[test]
    fn test_commit_after_remove_and_reinsert() {
        // Base has the key; staging removes and re-inserts it. The net
        // marker must persist as an overwrite, not a fresh insert.
        let mut cache = cache_with(&[(b"a", b"1")]);
        let mut staging = StagingTrie::new(&mut cache);
        staging.remove(&b"a".to_vec()).unwrap();
        staging.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        staging.commit();

        assert_eq!(cache.get(&b"a".to_vec()).unwrap(), b"2".to_vec());
        let persisted = cache.persist().unwrap();
        assert_eq!(persisted.get(&b"a".to_vec()).unwrap(), b"2".to_vec());
    }

    #[test]
    fn test_staged_remove_of_invisible_key_fails() {
        let mut cache = cache_with(&[(b"a", b"1")]);
        cache.remove(&b"a".to_vec()).unwrap();

        let mut staging = StagingTrie::new(&mut cache);
        assert!(matches!(
            staging.remove(&b"a".to_vec()),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_staged_insert_over_parent_removed_key() {
        // Base has the key, parent removed it, staging re-creates it.
        let mut cache = cache_with(&[(b"a", b"1")]);
        cache.remove(&b"a".to_vec()).unwrap();

        let mut staging = StagingTrie::new(&mut cache);
        staging.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        staging.commit();

        assert_eq!(cache.get(&b"a".to_vec()).unwrap(), b"2".to_vec());
        let persisted = cache.persist().unwrap();
        assert_eq!(persisted.get(&b"a".to_vec()).unwrap(), b"2".to_vec());
    }

    #[test]
    fn test_scan_through_all_layers() {
        let mut cache = cache_with(&[(b"a", b"1"), (b"b", b"2")]);
        cache.put(b"c".to_vec(), b"3".to_vec()).unwrap();

        let mut staging = StagingTrie::new(&mut cache);
        staging.put(b"d".to_vec(), b"4".to_vec()).unwrap();
        staging.remove(&b"b".to_vec()).unwrap();
        staging.remove(&b"c".to_vec()).unwrap();

        let mut seen: Vec<Vec<u8>> = staging
            .scan(&[], 100, |_, _| true)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        seen.sort();
        assert_eq!(seen, vec![b"a".to_vec(), b"d".to_vec()]);
    }
}
