//! Write-buffer layer over a persisted trie.

use lodestone_codec::Codec;
use lodestone_storage::{RawKvStore, StoreError, StoreResult};
use lodestone_trie::SparseMerkleTrie;
use lodestone_types::Hash;
use std::collections::BTreeMap;

/// A buffered mutation, tagged with what `persist` needs to know about
/// the key's presence in the persisted base.
///
/// The tag is what lets staging `commit` and cache `persist` run without
/// re-reading the base: `Inserted` keys fold in as trie puts of fresh
/// keys, `Removed` keys as trie removes of keys known to be down there.
#[derive(Debug, Clone)]
pub enum Pending<K, V> {
    /// Key absent from the base; becomes a trie insert on persist.
    Inserted(K, V),

    /// Key present in the base; becomes a trie overwrite on persist.
    Updated(K, V),

    /// Key present in the base; becomes a trie remove on persist.
    Removed(K),
}

/// A write-buffer over a persisted [`SparseMerkleTrie`].
///
/// Reads consult the pending map first and fall through to the base.
/// Mutations never touch the byte store until [`persist`](Self::persist),
/// which folds the buffer into the base in ascending encoded-key order
/// (deterministic, so the same pending set always produces the same
/// root). A cached trie has no root hash of its own.
pub struct CachedTrie<K, V, S> {
    base: SparseMerkleTrie<K, V, S>,
    pending: BTreeMap<Vec<u8>, Pending<K, V>>,
}

impl<K, V, S> CachedTrie<K, V, S>
where
    K: Codec + Clone,
    V: Codec + Clone,
    S: RawKvStore,
{
    /// Start a buffer over `base`.
    pub fn new(base: SparseMerkleTrie<K, V, S>) -> Self {
        Self {
            base,
            pending: BTreeMap::new(),
        }
    }

    /// The persisted trie under the buffer.
    pub fn base(&self) -> &SparseMerkleTrie<K, V, S> {
        &self.base
    }

    /// Number of buffered mutations.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Look up a key through the buffer.
    pub fn get_opt(&self, key: &K) -> StoreResult<Option<V>> {
        match self.pending.get(&key.encode()) {
            Some(Pending::Inserted(_, v)) | Some(Pending::Updated(_, v)) => Ok(Some(v.clone())),
            Some(Pending::Removed(_)) => Ok(None),
            None => self.base.get_opt(key),
        }
    }

    /// Look up a key, failing when absent.
    pub fn get(&self, key: &K) -> StoreResult<V> {
        self.get_opt(key)?
            .ok_or_else(|| Self::key_not_found(key))
    }

    /// Check key presence through the buffer.
    pub fn exists(&self, key: &K) -> StoreResult<bool> {
        Ok(self.get_opt(key)?.is_some())
    }

    /// Buffer an insert or overwrite.
    pub fn put(&mut self, key: K, value: V) -> StoreResult<()> {
        let encoded = key.encode();
        let marker = match self.pending.get(&encoded) {
            Some(Pending::Inserted(..)) => Pending::Inserted(key, value),
            Some(Pending::Updated(..)) | Some(Pending::Removed(_)) => Pending::Updated(key, value),
            None => {
                if self.base.exists(&key)? {
                    Pending::Updated(key, value)
                } else {
                    Pending::Inserted(key, value)
                }
            }
        };
        self.pending.insert(encoded, marker);
        Ok(())
    }

    /// Buffer a removal. Fails with `KeyNotFound` when the key is visible
    /// neither in the buffer nor in the base.
    pub fn remove(&mut self, key: &K) -> StoreResult<()> {
        let encoded = key.encode();
        match self.pending.get(&encoded) {
            Some(Pending::Inserted(..)) => {
                // Never reached the base; the insert and the remove cancel.
                self.pending.remove(&encoded);
                Ok(())
            }
            Some(Pending::Updated(..)) => {
                self.pending.insert(encoded, Pending::Removed(key.clone()));
                Ok(())
            }
            Some(Pending::Removed(_)) => Err(Self::key_not_found(key)),
            None => {
                if self.base.exists(key)? {
                    self.pending.insert(encoded, Pending::Removed(key.clone()));
                    Ok(())
                } else {
                    Err(Self::key_not_found(key))
                }
            }
        }
    }

    /// Fold the buffer into the base and return the new persisted trie.
    ///
    /// Entries fold in ascending encoded-key order; the resulting root is
    /// a pure function of the base root and the pending set. A failure
    /// partway leaves the previous persisted trie untouched (the nodes
    /// written so far are unreferenced orphans).
    pub fn persist(self) -> StoreResult<SparseMerkleTrie<K, V, S>> {
        let mut trie = self.base;
        for marker in self.pending.into_values() {
            trie = match marker {
                Pending::Inserted(k, v) | Pending::Updated(k, v) => trie.put(&k, &v)?,
                Pending::Removed(k) => trie.remove(&k)?,
            };
        }
        Ok(trie)
    }

    /// Entries under a digest prefix, as seen through the buffer.
    ///
    /// Union of the persisted scan and the pending map: pending inserts
    /// and updates overlay the persisted result, pending removes drop
    /// out of it. Output stays in digest order and is capped at `max`.
    pub fn scan<F>(&self, prefix: &[u8], max: usize, pred: F) -> StoreResult<Vec<(K, V)>>
    where
        F: Fn(&K, &V) -> bool,
    {
        scan_overlay(&self.base, [&self.pending], prefix, max, pred)
    }

    pub(crate) fn key_not_found(key: &K) -> StoreError {
        StoreError::KeyNotFound(SparseMerkleTrie::<K, V, S>::key_digest(key).to_hex())
    }

    pub(crate) fn pending(&self) -> &BTreeMap<Vec<u8>, Pending<K, V>> {
        &self.pending
    }

    /// Fold one staged marker into this buffer (staging wins on conflict).
    ///
    /// Staged markers are classified relative to the *view through this
    /// buffer*, so they are normalised here against this buffer's own
    /// marker to keep the base-presence tags truthful. Pure map work; the
    /// byte store is never touched.
    pub(crate) fn merge_marker(&mut self, encoded: Vec<u8>, marker: Pending<K, V>) {
        match marker {
            Pending::Inserted(k, v) => {
                // Staged as a fresh insert: the key was invisible through
                // this buffer, i.e. untracked-and-absent, or removed here.
                let normalised = match self.pending.get(&encoded) {
                    Some(Pending::Removed(_)) => Pending::Updated(k, v),
                    _ => Pending::Inserted(k, v),
                };
                self.pending.insert(encoded, normalised);
            }
            Pending::Updated(k, v) => {
                // Staged as an overwrite of a visible key; whether that
                // key is really in the base is this buffer's call.
                let normalised = match self.pending.get(&encoded) {
                    Some(Pending::Inserted(..)) => Pending::Inserted(k, v),
                    _ => Pending::Updated(k, v),
                };
                self.pending.insert(encoded, normalised);
            }
            Pending::Removed(k) => match self.pending.get(&encoded) {
                Some(Pending::Inserted(..)) => {
                    // The insert never left this buffer; cancel it.
                    self.pending.remove(&encoded);
                }
                _ => {
                    self.pending.insert(encoded, Pending::Removed(k));
                }
            },
        }
    }
}

/// Overlay pending layers (outermost last) onto a persisted scan.
pub(crate) fn scan_overlay<'a, K, V, S, F, I>(
    base: &SparseMerkleTrie<K, V, S>,
    layers: I,
    prefix: &[u8],
    max: usize,
    pred: F,
) -> StoreResult<Vec<(K, V)>>
where
    K: Codec + Clone + 'a,
    V: Codec + Clone + 'a,
    S: RawKvStore,
    F: Fn(&K, &V) -> bool,
    I: IntoIterator<Item = &'a BTreeMap<Vec<u8>, Pending<K, V>>>,
{
    let mut merged: BTreeMap<Vec<u8>, (K, V)> = BTreeMap::new();
    for (k, v) in base.scan(prefix, max, &pred)? {
        let digest = SparseMerkleTrie::<K, V, S>::key_digest(&k);
        merged.insert(digest.as_bytes().to_vec(), (k, v));
    }

    for layer in layers {
        for (encoded, marker) in layer {
            let digest = Hash::from_bytes(encoded);
            if !digest.as_bytes().starts_with(prefix) {
                continue;
            }
            let digest_key = digest.as_bytes().to_vec();
            match marker {
                Pending::Inserted(k, v) | Pending::Updated(k, v) => {
                    if pred(k, v) {
                        merged.insert(digest_key, (k.clone(), v.clone()));
                    } else {
                        // An overwrite can take a previously matching
                        // entry out of the result set.
                        merged.remove(&digest_key);
                    }
                }
                Pending::Removed(_) => {
                    merged.remove(&digest_key);
                }
            }
        }
    }

    Ok(merged.into_values().take(max).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_storage_memory::MemoryKvStore;
    use std::sync::Arc;

    type TestTrie = SparseMerkleTrie<Vec<u8>, Vec<u8>, MemoryKvStore>;
    type TestCache = CachedTrie<Vec<u8>, Vec<u8>, MemoryKvStore>;

    fn base_with(entries: &[(&[u8], &[u8])]) -> TestTrie {
        let mut trie = TestTrie::empty(Arc::new(MemoryKvStore::new()));
        for (k, v) in entries {
            trie = trie.put(&k.to_vec(), &v.to_vec()).unwrap();
        }
        trie
    }

    #[test]
    fn test_reads_fall_through_to_base() {
        let cache = TestCache::new(base_with(&[(b"a", b"1")]));
        assert_eq!(cache.get(&b"a".to_vec()).unwrap(), b"1".to_vec());
        assert_eq!(cache.get_opt(&b"x".to_vec()).unwrap(), None);
    }

    #[test]
    fn test_pending_put_shadows_base() {
        let mut cache = TestCache::new(base_with(&[(b"a", b"1")]));
        cache.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(cache.get(&b"a".to_vec()).unwrap(), b"2".to_vec());
        // Base untouched until persist.
        assert_eq!(cache.base().get(&b"a".to_vec()).unwrap(), b"1".to_vec());
    }

    #[test]
    fn test_remove_shadows_base() {
        let mut cache = TestCache::new(base_with(&[(b"a", b"1")]));
        cache.remove(&b"a".to_vec()).unwrap();
        assert_eq!(cache.get_opt(&b"a".to_vec()).unwrap(), None);
        assert!(!cache.exists(&b"a".to_vec()).unwrap());
        // Removing again fails: the key is no longer visible.
        assert!(matches!(
            cache.remove(&b"a".to_vec()),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_insert_then_remove_cancels() {
        let mut cache = TestCache::new(base_with(&[]));
        cache.put(b"fresh".to_vec(), b"v".to_vec()).unwrap();
        cache.remove(&b"fresh".to_vec()).unwrap();
        assert_eq!(cache.pending_len(), 0);
        // Persist of the empty buffer leaves the root alone.
        let root_before = cache.base().root_hash();
        assert_eq!(cache.persist().unwrap().root_hash(), root_before);
    }

    #[test]
    fn test_remove_of_unknown_key_fails() {
        let mut cache = TestCache::new(base_with(&[]));
        assert!(matches!(
            cache.remove(&b"nope".to_vec()),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_persist_matches_direct_puts() {
        let mut cache = TestCache::new(base_with(&[(b"a", b"1")]));
        cache.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        cache.put(b"c".to_vec(), b"3".to_vec()).unwrap();
        cache.remove(&b"a".to_vec()).unwrap();
        let persisted = cache.persist().unwrap();

        let direct = base_with(&[(b"b", b"2"), (b"c", b"3")]);
        assert_eq!(persisted.root_hash(), direct.root_hash());
    }

    #[test]
    fn test_persist_is_deterministic_over_buffer_insert_order() {
        let base = base_with(&[]);
        let mut one = TestCache::new(base.clone());
        one.put(b"x".to_vec(), b"1".to_vec()).unwrap();
        one.put(b"y".to_vec(), b"2".to_vec()).unwrap();

        let mut two = TestCache::new(base);
        two.put(b"y".to_vec(), b"2".to_vec()).unwrap();
        two.put(b"x".to_vec(), b"1".to_vec()).unwrap();

        assert_eq!(
            one.persist().unwrap().root_hash(),
            two.persist().unwrap().root_hash()
        );
    }

    #[test]
    fn test_scan_unions_pending_with_base() {
        let mut cache = TestCache::new(base_with(&[(b"a", b"1"), (b"b", b"2")]));
        cache.put(b"c".to_vec(), b"3".to_vec()).unwrap();
        cache.remove(&b"a".to_vec()).unwrap();

        let mut seen: Vec<Vec<u8>> = cache
            .scan(&[], 100, |_, _| true)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        seen.sort();
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_scan_comes_out_in_digest_order() {
        let mut cache = TestCache::new(base_with(&[(b"a", b"1")]));
        cache.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        let scanned = cache.scan(&[], 100, |_, _| true).unwrap();
        let digests: Vec<_> = scanned
            .iter()
            .map(|(k, _)| TestTrie::key_digest(k))
            .collect();
        let mut sorted = digests.clone();
        sorted.sort();
        assert_eq!(digests, sorted);
    }
}
