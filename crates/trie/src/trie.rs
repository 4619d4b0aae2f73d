//! The sparse Merkle trie: an authenticated map over a byte store.

use crate::nibbles::Nibbles;
use crate::node::{Node, NO_CHILDREN};
use lodestone_codec::{Codec, Reader};
use lodestone_storage::{RawKvStore, StoreError, StoreResult};
use lodestone_types::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// Root hash of the empty trie (documented sentinel constant).
///
/// Blake3 never maps a real node encoding to all-zero bytes, so the
/// sentinel cannot collide with a live root.
pub const EMPTY_ROOT: Hash = Hash::ZERO;

/// An authenticated key-value map persisted in a byte store.
///
/// Keys and values are any [`Codec`] types. A key's position is the
/// 64-nibble path of its digest; every node is stored at its own content
/// hash. The trie is an immutable value: `put`/`remove` write the new
/// nodes and return a new trie with the new root, leaving the old trie
/// (and every root ever produced) fully readable. Equal root hashes imply
/// equal maps.
pub struct SparseMerkleTrie<K, V, S> {
    store: Arc<S>,
    root: Option<Hash>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, S> Clone for SparseMerkleTrie<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            root: self.root,
            _marker: PhantomData,
        }
    }
}

impl<K, V, S> SparseMerkleTrie<K, V, S>
where
    K: Codec,
    V: Codec,
    S: RawKvStore,
{
    /// The empty trie over `store`.
    pub fn empty(store: Arc<S>) -> Self {
        Self {
            store,
            root: None,
            _marker: PhantomData,
        }
    }

    /// A reader over an existing root, e.g. one recovered from a block
    /// header after restart. [`EMPTY_ROOT`] opens the empty trie.
    pub fn open(store: Arc<S>, root: Hash) -> Self {
        Self {
            store,
            root: if root == EMPTY_ROOT { None } else { Some(root) },
            _marker: PhantomData,
        }
    }

    /// The 32-byte root commitment to the full map.
    pub fn root_hash(&self) -> Hash {
        self.root.unwrap_or(EMPTY_ROOT)
    }

    /// The underlying byte store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Digest positioning `key` in the trie.
    pub fn key_digest(key: &K) -> Hash {
        Hash::from_bytes(&key.encode())
    }

    /// Look up a key.
    pub fn get(&self, key: &K) -> StoreResult<V> {
        self.get_opt(key)?
            .ok_or_else(|| StoreError::KeyNotFound(Self::key_digest(key).to_hex()))
    }

    /// Look up a key, `None` when absent.
    pub fn get_opt(&self, key: &K) -> StoreResult<Option<V>> {
        match self.lookup(key)? {
            Some(data) => Ok(Some(Self::decode_entry(&data)?.1)),
            None => Ok(None),
        }
    }

    /// Check key presence.
    pub fn exists(&self, key: &K) -> StoreResult<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Insert or overwrite a key, returning the trie with the new root.
    pub fn put(&self, key: &K, value: &V) -> StoreResult<Self> {
        let path = Nibbles::from_digest(&Self::key_digest(key));
        let data = Self::encode_entry(key, value);
        let new_root = self.insert_at(self.root, path, data)?;
        Ok(self.with_root(Some(new_root)))
    }

    /// Remove a key, returning the trie with the new root.
    ///
    /// Fails with `KeyNotFound` when the key is absent. Old nodes are
    /// left in the store; only the returned root stops referencing them.
    pub fn remove(&self, key: &K) -> StoreResult<Self> {
        let digest = Self::key_digest(key);
        let path = Nibbles::from_digest(&digest);
        let root = self
            .root
            .ok_or_else(|| StoreError::KeyNotFound(digest.to_hex()))?;
        match self.remove_at(root, path, &digest)? {
            Some(node) => {
                let hash = self.write_node(&node)?;
                Ok(self.with_root(Some(hash)))
            }
            None => Ok(self.with_root(None)),
        }
    }

    /// Collect up to `max` entries whose key digest starts with the byte
    /// prefix, filtered by `pred`, in digest (nibble-lexicographic) order.
    pub fn scan<F>(&self, prefix: &[u8], max: usize, pred: F) -> StoreResult<Vec<(K, V)>>
    where
        F: Fn(&K, &V) -> bool,
    {
        let mut out = Vec::new();
        let Some(root) = self.root else {
            return Ok(out);
        };
        if max == 0 {
            return Ok(out);
        }
        let target = Nibbles::from_bytes(prefix);
        self.scan_node(&root, Nibbles::empty(), &target, max, &pred, &mut out)?;
        Ok(out)
    }

    /// All entries, capped at `max`, in digest order.
    pub fn entries(&self, max: usize) -> StoreResult<Vec<(K, V)>> {
        self.scan(&[], max, |_, _| true)
    }

    fn with_root(&self, root: Option<Hash>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            root,
            _marker: PhantomData,
        }
    }

    fn encode_entry(key: &K, value: &V) -> Vec<u8> {
        let mut buf = Vec::new();
        key.encode_to(&mut buf);
        value.encode_to(&mut buf);
        buf
    }

    fn decode_entry(data: &[u8]) -> StoreResult<(K, V)> {
        let mut r = Reader::new(data);
        let key = K::decode_from(&mut r)?;
        let value = V::decode_from(&mut r)?;
        r.finish()?;
        Ok((key, value))
    }

    fn read_node(&self, hash: &Hash) -> StoreResult<Node> {
        // A missing node here is store corruption: the parent (or root)
        // references a hash the store cannot resolve. Surfaced as
        // KeyNotFound on the node key; the caller decides what to do.
        let bytes = match self.store.get(hash.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(node = %hash, %err, "failed to resolve referenced trie node");
                return Err(err);
            }
        };
        match Node::decode(&bytes) {
            Ok(node) => Ok(node),
            Err(err) => {
                tracing::warn!(node = %hash, %err, "stored trie node failed to decode");
                Err(err.into())
            }
        }
    }

    fn write_node(&self, node: &Node) -> StoreResult<Hash> {
        let bytes = node.encode();
        let hash = Hash::from_bytes(&bytes);
        self.store.put(hash.as_bytes(), &bytes)?;
        Ok(hash)
    }

    /// Raw entry bytes for a key, descending by digest path.
    fn lookup(&self, key: &K) -> StoreResult<Option<Vec<u8>>> {
        let Some(mut current) = self.root else {
            return Ok(None);
        };
        let mut remaining = Nibbles::from_digest(&Self::key_digest(key));

        loop {
            match self.read_node(&current)? {
                Node::Leaf { path, data } => {
                    return Ok(if path == remaining { Some(data) } else { None });
                }
                Node::Branch {
                    path,
                    children,
                    value,
                } => {
                    if remaining == path {
                        return Ok(value);
                    }
                    if !remaining.starts_with(&path) {
                        return Ok(None);
                    }
                    match children[remaining.at(path.len()) as usize] {
                        Some(child) => {
                            remaining = remaining.slice_from(path.len() + 1);
                            current = child;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Insert `data` at `path` under the node in `slot`, writing every
    /// rewritten node and returning the new subtree root hash.
    fn insert_at(&self, slot: Option<Hash>, path: Nibbles, data: Vec<u8>) -> StoreResult<Hash> {
        let new_node = match slot {
            None => Node::leaf(path, data),
            Some(hash) => {
                let node = self.read_node(&hash)?;
                self.insert_into(node, path, data)?
            }
        };
        self.write_node(&new_node)
    }

    fn insert_into(&self, node: Node, path: Nibbles, data: Vec<u8>) -> StoreResult<Node> {
        match node {
            Node::Leaf {
                path: leaf_path,
                data: leaf_data,
            } => {
                if leaf_path == path {
                    // Same key: replace the value.
                    return Ok(Node::leaf(path, data));
                }

                // Split: branch at the longest common prefix, with the old
                // leaf and the new entry in their respective slots.
                let cp = leaf_path.common_prefix_len(&path);
                let mut children = Box::new(NO_CHILDREN);
                let mut value = None;

                if cp == leaf_path.len() {
                    value = Some(leaf_data);
                } else {
                    let child = Node::leaf(leaf_path.slice_from(cp + 1), leaf_data);
                    children[leaf_path.at(cp) as usize] = Some(self.write_node(&child)?);
                }

                if cp == path.len() {
                    value = Some(data);
                } else {
                    let child = Node::leaf(path.slice_from(cp + 1), data);
                    children[path.at(cp) as usize] = Some(self.write_node(&child)?);
                }

                Ok(Node::branch(path.slice(0, cp), children, value))
            }
            Node::Branch {
                path: branch_path,
                mut children,
                value,
            } => {
                let cp = branch_path.common_prefix_len(&path);

                if cp == branch_path.len() {
                    if path.len() == cp {
                        // Key terminates exactly at this branch.
                        return Ok(Node::branch(branch_path, children, Some(data)));
                    }
                    // Descend into the child slot for the next nibble.
                    let idx = path.at(cp) as usize;
                    let rest = path.slice_from(cp + 1);
                    let child_hash = self.insert_at(children[idx], rest, data)?;
                    children[idx] = Some(child_hash);
                    return Ok(Node::branch(branch_path, children, value));
                }

                // The branch's own path diverges from the key: split the
                // branch the same way a leaf splits.
                let lower = Node::branch(branch_path.slice_from(cp + 1), children, value);
                let mut upper_children = Box::new(NO_CHILDREN);
                upper_children[branch_path.at(cp) as usize] = Some(self.write_node(&lower)?);

                let mut upper_value = None;
                if path.len() == cp {
                    upper_value = Some(data);
                } else {
                    let leaf = Node::leaf(path.slice_from(cp + 1), data);
                    upper_children[path.at(cp) as usize] = Some(self.write_node(&leaf)?);
                }

                Ok(Node::branch(path.slice(0, cp), upper_children, upper_value))
            }
        }
    }

    /// Remove the entry at `path` under the node at `hash`.
    ///
    /// Returns the replacement subtree root as an in-memory node (not yet
    /// written) so the parent can merge paths when the subtree collapses,
    /// or `None` when the subtree becomes empty.
    fn remove_at(&self, hash: Hash, path: Nibbles, digest: &Hash) -> StoreResult<Option<Node>> {
        let not_found = || StoreError::KeyNotFound(digest.to_hex());

        match self.read_node(&hash)? {
            Node::Leaf {
                path: leaf_path, ..
            } => {
                if leaf_path == path {
                    Ok(None)
                } else {
                    Err(not_found())
                }
            }
            Node::Branch {
                path: branch_path,
                mut children,
                value,
            } => {
                if path == branch_path {
                    if value.is_none() {
                        return Err(not_found());
                    }
                    return self.collapse(branch_path, children, None);
                }
                if !path.starts_with(&branch_path) {
                    return Err(not_found());
                }

                let idx = path.at(branch_path.len()) as usize;
                let child = children[idx].ok_or_else(not_found)?;
                let rest = path.slice_from(branch_path.len() + 1);

                match self.remove_at(child, rest, digest)? {
                    Some(new_child) => {
                        children[idx] = Some(self.write_node(&new_child)?);
                        Ok(Some(Node::branch(branch_path, children, value)))
                    }
                    None => {
                        children[idx] = None;
                        self.collapse(branch_path, children, value)
                    }
                }
            }
        }
    }

    /// Restore canonical shape after a child slot was emptied: a branch
    /// with one remaining child and no value merges into that child, a
    /// branch with no children degenerates to its value leaf or vanishes.
    fn collapse(
        &self,
        path: Nibbles,
        children: Box<[Option<Hash>; 16]>,
        value: Option<Vec<u8>>,
    ) -> StoreResult<Option<Node>> {
        let (first_child, extra_child) = {
            let mut live = children
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.map(|h| (i as u8, h)));
            (live.next(), live.next())
        };
        match (first_child, extra_child, value) {
            (None, _, None) => Ok(None),
            (None, _, Some(data)) => Ok(Some(Node::leaf(path, data))),
            (Some((nibble, child_hash)), None, None) => {
                let merged = match self.read_node(&child_hash)? {
                    Node::Leaf {
                        path: child_path,
                        data,
                    } => Node::leaf(path.join(nibble, &child_path), data),
                    Node::Branch {
                        path: child_path,
                        children: child_children,
                        value: child_value,
                    } => Node::branch(
                        path.join(nibble, &child_path),
                        child_children,
                        child_value,
                    ),
                };
                Ok(Some(merged))
            }
            (_, _, value) => Ok(Some(Node::branch(path, children, value))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_node<F>(
        &self,
        hash: &Hash,
        acc: Nibbles,
        target: &Nibbles,
        max: usize,
        pred: &F,
        out: &mut Vec<(K, V)>,
    ) -> StoreResult<()>
    where
        F: Fn(&K, &V) -> bool,
    {
        if out.len() >= max {
            return Ok(());
        }

        match self.read_node(hash)? {
            Node::Leaf { path, data } => {
                let full = acc.concat(&path);
                if full.is_compatible_with(target) {
                    let (key, value) = Self::decode_entry(&data)?;
                    if pred(&key, &value) {
                        out.push((key, value));
                    }
                }
            }
            Node::Branch {
                path,
                children,
                value,
            } => {
                let full = acc.concat(&path);
                if !full.is_compatible_with(target) {
                    return Ok(());
                }

                if let Some(data) = value {
                    if full.len() >= target.len() {
                        let (key, value) = Self::decode_entry(&data)?;
                        if pred(&key, &value) {
                            out.push((key, value));
                        }
                    }
                }

                for (idx, child) in children.iter().enumerate() {
                    let Some(child) = child else { continue };
                    // Below the prefix depth only the prefix's own slot
                    // can contain matches.
                    if full.len() < target.len() && target.at(full.len()) != idx as u8 {
                        continue;
                    }
                    self.scan_node(child, full.child(idx as u8), target, max, pred, out)?;
                    if out.len() >= max {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_storage_memory::MemoryKvStore;
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};

    type TestTrie = SparseMerkleTrie<Vec<u8>, Vec<u8>, MemoryKvStore>;

    fn empty_trie() -> TestTrie {
        SparseMerkleTrie::empty(Arc::new(MemoryKvStore::new()))
    }

    fn kv(i: u32) -> (Vec<u8>, Vec<u8>) {
        (
            format!("key-{i}").into_bytes(),
            format!("value-{i}").into_bytes(),
        )
    }

    /// Walk every node reachable from the root, enforcing canonical shape.
    fn assert_canonical(trie: &TestTrie) {
        fn walk(trie: &TestTrie, hash: &Hash, depth: usize) {
            match trie.read_node(hash).unwrap() {
                Node::Leaf { path, .. } => {
                    assert_eq!(depth + path.len(), crate::nibbles::DIGEST_NIBBLES);
                }
                Node::Branch {
                    path,
                    children,
                    value,
                } => {
                    let live = children.iter().flatten().count();
                    assert!(
                        live + usize::from(value.is_some()) >= 2,
                        "non-canonical branch: {live} children, value={}",
                        value.is_some()
                    );
                    for child in children.iter().flatten() {
                        walk(trie, child, depth + path.len() + 1);
                    }
                }
            }
        }
        if let Some(root) = trie.root {
            walk(trie, &root, 0);
        }
    }

    #[test]
    fn test_empty_trie_has_sentinel_root() {
        let trie = empty_trie();
        assert_eq!(trie.root_hash(), EMPTY_ROOT);
        assert_eq!(trie.get_opt(&b"missing".to_vec()).unwrap(), None);
        assert!(matches!(
            trie.get(&b"missing".to_vec()),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_put_get_roundtrip() {
        let trie = empty_trie();
        let (k, v) = kv(0);
        let trie = trie.put(&k, &v).unwrap();
        assert_eq!(trie.get(&k).unwrap(), v);
        assert!(trie.exists(&k).unwrap());
        assert_ne!(trie.root_hash(), EMPTY_ROOT);
    }

    #[test]
    fn test_put_is_immutable() {
        let base = empty_trie();
        let (k, v) = kv(0);
        let updated = base.put(&k, &v).unwrap();
        // The old value still reads the old state.
        assert_eq!(base.get_opt(&k).unwrap(), None);
        assert_eq!(updated.get(&k).unwrap(), v);
    }

    #[test]
    fn test_overwrite_changes_root() {
        let (k, v) = kv(0);
        let trie = empty_trie().put(&k, &v).unwrap();
        let overwritten = trie.put(&k, &b"other".to_vec()).unwrap();
        assert_ne!(trie.root_hash(), overwritten.root_hash());
        assert_eq!(overwritten.get(&k).unwrap(), b"other".to_vec());

        // Re-putting the identical entry is a no-op on the root.
        let same = trie.put(&k, &v).unwrap();
        assert_eq!(trie.root_hash(), same.root_hash());
    }

    #[test]
    fn test_insert_then_remove_returns_to_sentinel() {
        let (k, v) = kv(7);
        let trie = empty_trie().put(&k, &v).unwrap();
        let trie = trie.remove(&k).unwrap();
        assert_eq!(trie.root_hash(), EMPTY_ROOT);
        assert_eq!(trie.get_opt(&k).unwrap(), None);
    }

    #[test]
    fn test_remove_missing_key_fails() {
        let (k, v) = kv(0);
        let trie = empty_trie().put(&k, &v).unwrap();
        assert!(matches!(
            trie.remove(&b"absent".to_vec()),
            Err(StoreError::KeyNotFound(_))
        ));
        // Empty trie fails too.
        assert!(matches!(
            empty_trie().remove(&k),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_root_is_order_independent() {
        let pairs: Vec<_> = (0..40).map(kv).collect();
        let mut shuffled = pairs.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(11));

        let mut a = empty_trie();
        for (k, v) in &pairs {
            a = a.put(k, v).unwrap();
        }
        let mut b = empty_trie();
        for (k, v) in &shuffled {
            b = b.put(k, v).unwrap();
        }

        assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn test_root_is_history_independent() {
        // {a, b} built directly vs. built as {a, b, c} \ {c}.
        let (ka, va) = kv(1);
        let (kb, vb) = kv(2);
        let (kc, vc) = kv(3);

        let direct = empty_trie().put(&ka, &va).unwrap().put(&kb, &vb).unwrap();
        let detour = empty_trie()
            .put(&ka, &va)
            .unwrap()
            .put(&kc, &vc)
            .unwrap()
            .put(&kb, &vb)
            .unwrap()
            .remove(&kc)
            .unwrap();

        assert_eq!(direct.root_hash(), detour.root_hash());
        assert_canonical(&detour);
    }

    #[test]
    fn test_shape_stays_canonical_under_churn() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut trie = empty_trie();
        let mut live: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

        for i in 0..120u32 {
            trie = match kv(i) {
                (k, v) if i % 3 != 2 => {
                    live.push((k.clone(), v.clone()));
                    trie.put(&k, &v).unwrap()
                }
                _ => {
                    if live.is_empty() {
                        continue;
                    }
                    let victim = live.swap_remove(rand::Rng::gen_range(&mut rng, 0..live.len()));
                    trie.remove(&victim.0).unwrap()
                }
            };
        }

        assert_canonical(&trie);
        for (k, v) in &live {
            assert_eq!(trie.get(k).unwrap(), *v);
        }
    }

    #[test]
    fn test_independent_stores_agree_on_root() {
        let pairs: Vec<_> = (0..16).map(kv).collect();
        let mut shuffled = pairs.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(3));

        let mut a = empty_trie();
        for (k, v) in &pairs {
            a = a.put(k, v).unwrap();
        }
        let mut b = empty_trie();
        for (k, v) in &shuffled {
            b = b.put(k, v).unwrap();
        }

        assert_eq!(a.root_hash(), b.root_hash());
        // Identical contents, byte-identical entry listings.
        let ea = a.entries(100).unwrap();
        let eb = b.entries(100).unwrap();
        assert_eq!(ea, eb);
    }

    #[test]
    fn test_entries_come_out_in_digest_order() {
        let mut trie = empty_trie();
        for i in 0..10 {
            let (k, v) = kv(i);
            trie = trie.put(&k, &v).unwrap();
        }
        let entries = trie.entries(100).unwrap();
        assert_eq!(entries.len(), 10);
        let digests: Vec<_> = entries
            .iter()
            .map(|(k, _)| TestTrie::key_digest(k))
            .collect();
        let mut sorted = digests.clone();
        sorted.sort();
        assert_eq!(digests, sorted);
    }

    #[test]
    fn test_scan_prefix_and_cap() {
        let mut trie = empty_trie();
        for i in 0..32 {
            let (k, v) = kv(i);
            trie = trie.put(&k, &v).unwrap();
        }

        let (probe, _) = kv(5);
        let probe_digest = TestTrie::key_digest(&probe);
        let prefix = &probe_digest.as_bytes()[..1];

        let hits = trie.scan(prefix, 100, |_, _| true).unwrap();
        assert!(hits.iter().any(|(k, _)| *k == probe));
        for (k, _) in &hits {
            assert_eq!(&TestTrie::key_digest(k).as_bytes()[..1], prefix);
        }

        let capped = trie.scan(&[], 4, |_, _| true).unwrap();
        assert_eq!(capped.len(), 4);

        let filtered = trie.scan(&[], 100, |k, _| *k == probe).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, probe);
    }

    #[test]
    fn test_missing_node_surfaces_as_error() {
        let store = Arc::new(MemoryKvStore::new());
        let mut trie: TestTrie = SparseMerkleTrie::empty(Arc::clone(&store));
        for i in 0..4 {
            let (k, v) = kv(i);
            trie = trie.put(&k, &v).unwrap();
        }

        // Delete the root node out from under the trie.
        assert!(store.corrupt_remove(trie.root_hash().as_bytes()));

        let (k, _) = kv(0);
        assert!(matches!(
            trie.get(&k),
            Err(StoreError::KeyNotFound(_))
        ));
        assert!(matches!(
            trie.entries(10),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_open_rehydrates_reader() {
        let store = Arc::new(MemoryKvStore::new());
        let mut trie: TestTrie = SparseMerkleTrie::empty(Arc::clone(&store));
        for i in 0..8 {
            let (k, v) = kv(i);
            trie = trie.put(&k, &v).unwrap();
        }
        let root = trie.root_hash();

        let reopened: TestTrie = SparseMerkleTrie::open(store, root);
        assert_eq!(reopened.root_hash(), root);
        let (k, v) = kv(3);
        assert_eq!(reopened.get(&k).unwrap(), v);
    }
}
