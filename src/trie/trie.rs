//! The mutable trie: lookup, insertion, deletion, range search, flushing
//! and structural collapse.
//!
//! A [`Trie`] owns an in-memory node tree rooted at [`Trie::root`] and reads
//! through a shared [`Store`] whenever it meets a hash placeholder. All
//! mutations rebuild the nodes along the touched path with cleared caches;
//! nodes that came from the store keep a `persisted` flag so that
//! [`Trie::flush`] can tell which parts of the tree are new. Reference
//! bookkeeping for GC mode is split across the two sides of a flush:
//! removals of persisted nodes are recorded at mutation time, additions are
//! discovered by walking the dirty tree when flushing.
use crate::{
    constant::{DATA_MPT, MAX_KEY_LENGTH, MAX_VALUE_LENGTH, NODE_KEY_LENGTH, RC_METADATA_LENGTH},
    crypto::double_sha256,
    error::{Error, Result},
    traits::SharedStore,
    trie::{
        nibbles::{common_prefix_len, from_nibbles, to_nibbles},
        node::{BranchNode, ExtensionNode, LeafNode, Node, VALUE_INDEX},
    },
    types::{KeyValue, TrieMode},
};
use alloy_primitives::B256;
use rustc_hash::FxHashMap;
use tracing::warn;

/// Store key of a node record: the MPT data prefix plus the node hash.
pub(crate) fn node_key(hash: &B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(NODE_KEY_LENGTH);
    key.push(DATA_MPT);
    key.extend_from_slice(hash.as_slice());
    key
}

/// Builds a GC-mode node record: node bytes followed by the little-endian
/// reference count and last-active height.
pub(crate) fn make_record(bytes: &[u8], refcount: u32, height: u32) -> Vec<u8> {
    let mut record = Vec::with_capacity(bytes.len() + RC_METADATA_LENGTH);
    record.extend_from_slice(bytes);
    record.extend_from_slice(&refcount.to_le_bytes());
    record.extend_from_slice(&height.to_le_bytes());
    record
}

/// Splits a GC-mode node record into node bytes, reference count and
/// last-active height.
pub(crate) fn split_record(record: &[u8]) -> Result<(&[u8], u32, u32)> {
    if record.len() < RC_METADATA_LENGTH {
        return Err(Error::Corruption("node record too short".into()));
    }
    let (bytes, meta) = record.split_at(record.len() - RC_METADATA_LENGTH);
    let refcount = u32::from_le_bytes(meta[..4].try_into().unwrap());
    let height = u32::from_le_bytes(meta[4..].try_into().unwrap());
    Ok((bytes, refcount, height))
}

/// Whether a GC-mode node record is still referenced. A zero counter marks
/// a tombstone awaiting collection.
pub fn is_active_value(record: &[u8]) -> bool {
    match split_record(record) {
        Ok((_, refcount, _)) => refcount != 0,
        Err(_) => true,
    }
}

/// Last-active height of a GC-mode node record.
pub fn last_active_height(record: &[u8]) -> u32 {
    split_record(record).map(|(_, _, h)| h).unwrap_or(u32::MAX)
}

/// A mutable Merkle Patricia Trie over a shared store.
pub struct Trie {
    pub(crate) root: Node,
    pub(crate) mode: TrieMode,
    pub(crate) store: SharedStore,
    /// Persisted nodes dropped from the tree since the last flush, by hash.
    pub(crate) dropped: FxHashMap<B256, u32>,
}

impl Trie {
    /// Creates a trie rooted at `root` — typically [`Node::Empty`] for a
    /// fresh state or a placeholder from [`Node::from_hash`] for an
    /// existing one.
    pub fn new(root: Node, mode: TrieMode, store: SharedStore) -> Self {
        Self {
            root,
            mode,
            store,
            dropped: FxHashMap::default(),
        }
    }

    /// A copy of this trie reading and flushing through `store`. The copy
    /// shares no pending bookkeeping with the original.
    pub fn clone_with_store(&self, store: SharedStore) -> Self {
        Self {
            root: self.root.clone(),
            mode: self.mode,
            store,
            dropped: FxHashMap::default(),
        }
    }

    /// Hash identifying the current state; zero for the empty trie.
    pub fn state_root(&self) -> B256 {
        self.root.hash()
    }

    /// The trie's storage behavior flags.
    pub fn mode(&self) -> TrieMode {
        self.mode
    }

    pub(crate) fn check_key(key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::InvalidArgument("key too long"));
        }
        Ok(())
    }

    /// Returns the value stored under `key`, materializing hash placeholders
    /// along the path as a side effect.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        Self::check_key(key)?;
        let path = to_nibbles(key);
        let mut root = std::mem::take(&mut self.root);
        let result = self.get_value(&mut root, &path);
        self.root = root;
        result
    }

    fn get_value(&mut self, n: &mut Node, path: &[u8]) -> Result<Vec<u8>> {
        match n {
            Node::Empty => Err(Error::NotFound),
            Node::Hash(_) => {
                self.resolve_in_place(n)?;
                self.get_value(n, path)
            }
            Node::Leaf(leaf) => {
                if path.is_empty() {
                    Ok(leaf.value.clone())
                } else {
                    Err(Error::NotFound)
                }
            }
            Node::Extension(ext) => {
                if path.starts_with(&ext.key) {
                    let klen = ext.key.len();
                    let Node::Extension(ext) = n else { unreachable!() };
                    self.get_value(&mut ext.next, &path[klen..])
                } else {
                    Err(Error::NotFound)
                }
            }
            Node::Branch(_) => {
                let Node::Branch(branch) = n else { unreachable!() };
                if path.is_empty() {
                    self.get_value(&mut branch.children[VALUE_INDEX], &[])
                } else {
                    self.get_value(&mut branch.children[path[0] as usize], &path[1..])
                }
            }
        }
    }

    /// Inserts or overwrites `key`. An empty value is equivalent to
    /// [`Trie::delete`].
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        if value.is_empty() {
            return self.delete(key);
        }
        if value.len() > MAX_VALUE_LENGTH {
            return Err(Error::InvalidArgument("value too long"));
        }
        let path = to_nibbles(key);
        let mut root = std::mem::take(&mut self.root);
        let result = self.put_into(&mut root, &path, value);
        self.root = root;
        result
    }

    /// Removes `key`, rebalancing collapsed branches on the way back up.
    /// Fails with [`Error::NotFound`] (and leaves the trie unchanged) when
    /// the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        let path = to_nibbles(key);
        let mut root = std::mem::take(&mut self.root);
        let result = self.delete_from(&mut root, &path);
        self.root = root;
        result
    }

    /// Records the upcoming removal of a persisted node or reference so the
    /// next flush can settle the store.
    pub(crate) fn note_removed(&mut self, n: &Node) {
        match n {
            Node::Empty => {}
            Node::Hash(h) => {
                *self.dropped.entry(*h).or_insert(0) += 1;
            }
            _ if n.persisted() => {
                *self.dropped.entry(n.hash()).or_insert(0) += 1;
            }
            _ => {}
        }
    }

    /// Materializes a hash placeholder from the store, in place. The
    /// replacement is content-equal, so callers may retry their match.
    pub(crate) fn resolve_in_place(&mut self, n: &mut Node) -> Result<()> {
        if let Node::Hash(h) = n {
            *n = self.resolve(*h)?;
        }
        Ok(())
    }

    /// Loads and decodes the node stored under `hash`, verifying that the
    /// record actually hashes to its key.
    pub(crate) fn resolve(&self, hash: B256) -> Result<Node> {
        let record = self.store.get(&node_key(&hash))?;
        let bytes = if self.mode.rc() {
            split_record(&record)?.0
        } else {
            &record[..]
        };
        if double_sha256(bytes) != hash {
            return Err(Error::Corruption(format!(
                "node {hash:#} does not match its storage key"
            )));
        }
        let mut node = Node::decode(bytes)?;
        node.seed_cache(bytes.to_vec(), hash);
        node.mark_persisted();
        Ok(node)
    }

    pub(crate) fn put_into(&mut self, n: &mut Node, path: &[u8], value: &[u8]) -> Result<()> {
        match n {
            Node::Empty => {
                *n = new_subtrie(path, value);
                Ok(())
            }
            Node::Hash(_) => {
                self.resolve_in_place(n)?;
                self.put_into(n, path, value)
            }
            Node::Leaf(_) => {
                self.note_removed(n);
                n.invalidate();
                if path.is_empty() {
                    let Node::Leaf(leaf) = n else { unreachable!() };
                    leaf.value = value.to_vec();
                    Ok(())
                } else {
                    // the leaf becomes a branch carrying its old value
                    let Node::Leaf(old) = std::mem::take(n) else {
                        unreachable!()
                    };
                    let mut branch = BranchNode::new();
                    branch.children[VALUE_INDEX] = Node::Leaf(LeafNode::new(old.value));
                    branch.children[path[0] as usize] = new_subtrie(&path[1..], value);
                    *n = Node::Branch(Box::new(branch));
                    Ok(())
                }
            }
            Node::Branch(_) => {
                self.note_removed(n);
                n.invalidate();
                let Node::Branch(branch) = n else { unreachable!() };
                if path.is_empty() {
                    let old = std::mem::take(&mut branch.children[VALUE_INDEX]);
                    self.note_removed(&old);
                    branch.children[VALUE_INDEX] = Node::Leaf(LeafNode::new(value.to_vec()));
                    Ok(())
                } else {
                    self.put_into(&mut branch.children[path[0] as usize], &path[1..], value)
                }
            }
            Node::Extension(ext) => {
                let lcp = common_prefix_len(&ext.key, path);
                let klen = ext.key.len();
                self.note_removed(n);
                n.invalidate();
                if lcp == klen {
                    let Node::Extension(ext) = n else { unreachable!() };
                    self.put_into(&mut ext.next, &path[lcp..], value)
                } else {
                    // split at the divergence point
                    let Node::Extension(ext) = std::mem::take(n) else {
                        unreachable!()
                    };
                    let key = ext.key;
                    let next = *ext.next;
                    let mut branch = BranchNode::new();
                    branch.children[key[lcp] as usize] = if key.len() == lcp + 1 {
                        next
                    } else {
                        Node::Extension(ExtensionNode::new(key[lcp + 1..].to_vec(), next))
                    };
                    if path.len() == lcp {
                        branch.children[VALUE_INDEX] = Node::Leaf(LeafNode::new(value.to_vec()));
                    } else {
                        branch.children[path[lcp] as usize] =
                            new_subtrie(&path[lcp + 1..], value);
                    }
                    let branch = Node::Branch(Box::new(branch));
                    *n = if lcp > 0 {
                        Node::Extension(ExtensionNode::new(key[..lcp].to_vec(), branch))
                    } else {
                        branch
                    };
                    Ok(())
                }
            }
        }
    }

    fn delete_from(&mut self, n: &mut Node, path: &[u8]) -> Result<()> {
        match n {
            Node::Empty => Err(Error::NotFound),
            Node::Hash(_) => {
                self.resolve_in_place(n)?;
                self.delete_from(n, path)
            }
            Node::Leaf(_) => {
                if path.is_empty() {
                    self.note_removed(n);
                    *n = Node::Empty;
                    Ok(())
                } else {
                    Err(Error::NotFound)
                }
            }
            Node::Extension(ext) => {
                if !path.starts_with(&ext.key) {
                    return Err(Error::NotFound);
                }
                let klen = ext.key.len();
                {
                    let Node::Extension(ext) = n else { unreachable!() };
                    self.delete_from(&mut ext.next, &path[klen..])?;
                }
                // the child changed: this node's old form is gone
                self.note_removed(n);
                n.invalidate();
                self.normalize_extension(n);
                Ok(())
            }
            Node::Branch(_) => {
                if path.is_empty() {
                    let has_value = {
                        let Node::Branch(branch) = &*n else { unreachable!() };
                        !branch.children[VALUE_INDEX].is_empty()
                    };
                    if !has_value {
                        return Err(Error::NotFound);
                    }
                    self.note_removed(n);
                    n.invalidate();
                    let Node::Branch(branch) = n else { unreachable!() };
                    let old = std::mem::take(&mut branch.children[VALUE_INDEX]);
                    self.note_removed(&old);
                } else {
                    {
                        let Node::Branch(branch) = n else { unreachable!() };
                        self.delete_from(&mut branch.children[path[0] as usize], &path[1..])?;
                    }
                    self.note_removed(n);
                    n.invalidate();
                }
                self.strip_branch(n)
            }
        }
    }

    /// Restores branch invariants after a deletion: a branch with only its
    /// value left becomes that leaf; a branch with a single child collapses
    /// into an extension, merging with a child extension if there is one.
    pub(crate) fn strip_branch(&mut self, n: &mut Node) -> Result<()> {
        let Node::Branch(branch) = n else {
            return Ok(());
        };
        let (count, last) = branch.child_census();
        let has_value = !branch.children[VALUE_INDEX].is_empty();
        match (count, has_value) {
            (0, false) => *n = Node::Empty,
            (0, true) => {
                self.resolve_in_place(&mut branch.children[VALUE_INDEX])?;
                let value_child = std::mem::take(&mut branch.children[VALUE_INDEX]);
                if !matches!(value_child, Node::Leaf(_)) {
                    return Err(Error::Corruption(
                        "branch value slot does not hold a leaf".into(),
                    ));
                }
                *n = value_child;
            }
            (1, false) => {
                self.resolve_in_place(&mut branch.children[last])?;
                let child = std::mem::take(&mut branch.children[last]);
                match child {
                    Node::Extension(_) => {
                        // the child's key grows by the branch nibble
                        self.note_removed(&child);
                        let Node::Extension(inner) = child else {
                            unreachable!()
                        };
                        let mut key = Vec::with_capacity(1 + inner.key.len());
                        key.push(last as u8);
                        key.extend_from_slice(&inner.key);
                        *n = Node::Extension(ExtensionNode::new(key, *inner.next));
                    }
                    other => {
                        *n = Node::Extension(ExtensionNode::new(vec![last as u8], other));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Restores extension invariants after its child changed: an emptied
    /// child erases the extension, a chained extension is merged.
    pub(crate) fn normalize_extension(&mut self, n: &mut Node) {
        let (child_empty, child_is_ext) = match n {
            Node::Extension(ext) => (
                ext.next.is_empty(),
                matches!(ext.next.as_ref(), Node::Extension(_)),
            ),
            _ => return,
        };
        if child_empty {
            *n = Node::Empty;
        } else if child_is_ext {
            let Node::Extension(ext) = n else { unreachable!() };
            self.note_removed(&ext.next);
            let Node::Extension(inner) = std::mem::take(ext.next.as_mut()) else {
                unreachable!()
            };
            ext.key.extend_from_slice(&inner.key);
            *ext.next = *inner.next;
        }
    }

    /// Yields up to `max` key/value pairs whose key starts with `prefix`, in
    /// ascending nibble order. With `start = None` the key equal to `prefix`
    /// is included; with `start = Some(s)` only keys strictly greater than
    /// `prefix || s` are returned.
    pub fn find(
        &mut self,
        prefix: &[u8],
        start: Option<&[u8]>,
        max: usize,
    ) -> Result<Vec<KeyValue>> {
        if max == 0 {
            return Err(Error::InvalidArgument("max must be at least 1"));
        }
        if prefix.len() + start.map_or(0, <[u8]>::len) > MAX_KEY_LENGTH {
            return Err(Error::InvalidArgument("key too long"));
        }
        let to_match = to_nibbles(prefix);
        let start_nibbles = start.map(|s| to_nibbles(s));
        let mut out = Vec::new();
        let mut acc = Vec::new();
        let mut root = std::mem::take(&mut self.root);
        let result = self.find_walk(
            &mut root,
            &to_match,
            &mut acc,
            start_nibbles.as_deref(),
            prefix,
            max,
            &mut out,
        );
        self.root = root;
        result.map(|_| out)
    }

    /// Whether the suffix subtree rooted at `acc` can hold keys beyond the
    /// `start` bound.
    fn may_contain_greater(acc: &[u8], start: Option<&[u8]>) -> bool {
        match start {
            None => true,
            Some(s) => acc > s || s.starts_with(acc),
        }
    }

    fn included(acc: &[u8], start: Option<&[u8]>) -> bool {
        match start {
            None => true,
            Some(s) => acc > s,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn find_walk(
        &mut self,
        n: &mut Node,
        to_match: &[u8],
        acc: &mut Vec<u8>,
        start: Option<&[u8]>,
        prefix: &[u8],
        max: usize,
        out: &mut Vec<KeyValue>,
    ) -> Result<bool> {
        match n {
            Node::Empty => Ok(true),
            Node::Hash(_) => {
                self.resolve_in_place(n)?;
                self.find_walk(n, to_match, acc, start, prefix, max, out)
            }
            Node::Leaf(leaf) => {
                if !to_match.is_empty() {
                    return Ok(true);
                }
                if Self::included(acc, start) {
                    let mut key = prefix.to_vec();
                    key.extend_from_slice(&from_nibbles(acc));
                    out.push(KeyValue {
                        key,
                        value: leaf.value.clone(),
                    });
                    if out.len() >= max {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Node::Extension(ext) => {
                let klen = ext.key.len();
                let overlap = klen.min(to_match.len());
                if ext.key[..overlap] != to_match[..overlap] {
                    return Ok(true);
                }
                if klen <= to_match.len() {
                    let Node::Extension(ext) = n else { unreachable!() };
                    return self.find_walk(
                        &mut ext.next,
                        &to_match[klen..],
                        acc,
                        start,
                        prefix,
                        max,
                        out,
                    );
                }
                // the extension runs past the prefix: its tail joins the
                // accumulated suffix
                let tail = ext.key[to_match.len()..].to_vec();
                acc.extend_from_slice(&tail);
                let keep_going = if Self::may_contain_greater(acc, start) {
                    let Node::Extension(ext) = n else { unreachable!() };
                    self.find_walk(&mut ext.next, &[], acc, start, prefix, max, out)?
                } else {
                    true
                };
                acc.truncate(acc.len() - tail.len());
                Ok(keep_going)
            }
            Node::Branch(_) => {
                let Node::Branch(branch) = n else { unreachable!() };
                if let Some((&nib, rest)) = to_match.split_first() {
                    return self.find_walk(
                        &mut branch.children[nib as usize],
                        rest,
                        acc,
                        start,
                        prefix,
                        max,
                        out,
                    );
                }
                // the value slot is the shortest key in this subtree
                if !self.find_walk(
                    &mut branch.children[VALUE_INDEX],
                    &[],
                    acc,
                    start,
                    prefix,
                    max,
                    out,
                )? {
                    return Ok(false);
                }
                for i in 0..VALUE_INDEX {
                    acc.push(i as u8);
                    let keep_going = if Self::may_contain_greater(acc, start) {
                        let Node::Branch(branch) = n else { unreachable!() };
                        self.find_walk(
                            &mut branch.children[i],
                            &[],
                            acc,
                            start,
                            prefix,
                            max,
                            out,
                        )?
                    } else {
                        true
                    };
                    acc.pop();
                    if !keep_going {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Persists every node created since the last flush, settles reference
    /// counts for height `index`, and shrinks the in-memory tree back to a
    /// hash placeholder.
    pub fn flush(&mut self, index: u32) -> Result<()> {
        let mut added: FxHashMap<B256, (u32, Vec<u8>)> = FxHashMap::default();
        collect_dirty(&self.root, &mut added);

        let mut batch = self.store.batch();
        if self.mode.rc() {
            let mut deltas: FxHashMap<B256, (i64, Option<Vec<u8>>)> = FxHashMap::default();
            for (hash, (count, bytes)) in added {
                deltas.insert(hash, (count as i64, Some(bytes)));
            }
            for (hash, count) in self.dropped.drain() {
                deltas
                    .entry(hash)
                    .and_modify(|d| d.0 -= count as i64)
                    .or_insert((-(count as i64), None));
            }
            for (hash, (delta, bytes)) in deltas {
                if delta == 0 {
                    continue;
                }
                let key = node_key(&hash);
                match self.store.get(&key) {
                    Ok(record) => {
                        let (node_bytes, refcount, _) = split_record(&record)?;
                        let updated = refcount as i64 + delta;
                        if updated < 0 {
                            warn!(node = %hash, refcount, delta, "node reference count underflow");
                        }
                        let updated = updated.max(0) as u32;
                        if updated == 0 && !self.mode.gc() {
                            // keep-latest: gone for good once unreferenced
                            batch.delete(key);
                        } else {
                            batch.put(key, make_record(node_bytes, updated, index));
                        }
                    }
                    Err(Error::NotFound) => {
                        if delta > 0 {
                            let bytes = bytes.expect("newly added node carries its bytes");
                            batch.put(key, make_record(&bytes, delta as u32, index));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        } else {
            for (hash, (_, bytes)) in added {
                batch.put(node_key(&hash), bytes);
            }
            self.dropped.clear();
        }
        self.store.write_batch(batch)?;

        // every surviving node is now in the store; shrink to the root
        // reference
        self.root = Node::from_hash(self.root.hash());
        Ok(())
    }

    /// Replaces every node at exactly `depth` levels below the root (and
    /// everything beneath) with its hash placeholder, shrinking memory.
    /// Only flushed nodes may be collapsed.
    pub fn collapse(&mut self, depth: usize) {
        collapse_rec(&mut self.root, depth);
    }
}

fn new_subtrie(path: &[u8], value: &[u8]) -> Node {
    let leaf = Node::Leaf(LeafNode::new(value.to_vec()));
    if path.is_empty() {
        leaf
    } else {
        Node::Extension(ExtensionNode::new(path.to_vec(), leaf))
    }
}

/// Accumulates serializations of all not-yet-persisted nodes, counted per
/// hash so structural sharing inside one version is settled correctly.
fn collect_dirty(n: &Node, out: &mut FxHashMap<B256, (u32, Vec<u8>)>) {
    if !n.is_concrete() || n.persisted() {
        return;
    }
    match n {
        Node::Branch(branch) => {
            for child in &branch.children {
                collect_dirty(child, out);
            }
        }
        Node::Extension(ext) => collect_dirty(&ext.next, out),
        _ => {}
    }
    let entry = out
        .entry(n.hash())
        .or_insert_with(|| (0, n.bytes()));
    entry.0 += 1;
}

fn collapse_rec(n: &mut Node, depth: usize) {
    if depth == 0 {
        if n.is_concrete() {
            debug_assert!(n.persisted(), "collapsing an unflushed node");
            *n = Node::from_hash(n.hash());
        }
        return;
    }
    match n {
        Node::Branch(branch) => {
            for child in branch.children.iter_mut() {
                collapse_rec(child, depth - 1);
            }
        }
        Node::Extension(ext) => collapse_rec(&mut ext.next, depth - 1),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::MemStore;
    use std::sync::Arc;

    pub(crate) fn new_test_trie(mode: TrieMode) -> Trie {
        Trie::new(Node::Empty, mode, Arc::new(MemStore::new()))
    }

    /// Tests single-key round trips: put/get, overwrite, delete.
    #[test]
    fn test_put_get_delete_roundtrip() {
        let mut trie = new_test_trie(TrieMode::ALL);
        assert_eq!(trie.get(b"absent"), Err(Error::NotFound));

        trie.put(b"key", b"value").unwrap();
        assert_eq!(trie.get(b"key").unwrap(), b"value");

        trie.put(b"key", b"other").unwrap();
        assert_eq!(trie.get(b"key").unwrap(), b"other");

        trie.delete(b"key").unwrap();
        assert_eq!(trie.get(b"key"), Err(Error::NotFound));
        assert_eq!(trie.delete(b"key"), Err(Error::NotFound));
        assert_eq!(trie.state_root(), B256::ZERO);
    }

    /// Tests that an empty value acts as deletion and that the size bounds
    /// are enforced.
    #[test]
    fn test_put_bounds_and_empty_value() {
        let mut trie = new_test_trie(TrieMode::ALL);
        trie.put(b"k", b"v").unwrap();
        trie.put(b"k", b"").unwrap();
        assert_eq!(trie.get(b"k"), Err(Error::NotFound));

        let long_key = vec![0u8; MAX_KEY_LENGTH + 1];
        assert!(matches!(
            trie.put(&long_key, b"v"),
            Err(Error::InvalidArgument(_))
        ));
        let long_value = vec![0u8; MAX_VALUE_LENGTH + 1];
        assert!(matches!(
            trie.put(b"k", &long_value),
            Err(Error::InvalidArgument(_))
        ));
    }

    /// Tests the two-entry shape: keys 0x1231/0x1232 must produce an
    /// extension over nibbles 1,2,3 into a branch with two leaves.
    #[test]
    fn test_two_entry_structure() {
        let mut trie = new_test_trie(TrieMode::ALL);
        trie.put(&[0x12, 0x31], b"value1").unwrap();
        trie.put(&[0x12, 0x32], b"value2").unwrap();

        let Node::Extension(ext) = &trie.root else {
            panic!("expected extension at the root");
        };
        assert_eq!(ext.key, vec![0x1, 0x2, 0x3]);
        let Node::Branch(branch) = ext.next.as_ref() else {
            panic!("expected branch under the extension");
        };
        assert!(matches!(branch.children[1], Node::Leaf(_)));
        assert!(matches!(branch.children[2], Node::Leaf(_)));
        assert!(branch.children[VALUE_INDEX].is_empty());

        assert_eq!(trie.get(&[0x12, 0x31]).unwrap(), b"value1");
        assert_eq!(trie.get(&[0x12, 0x32]).unwrap(), b"value2");
    }

    /// Tests that one key being a prefix of another lands the short key's
    /// value in a branch value slot, retrievable and deletable.
    #[test]
    fn test_prefix_keys() {
        let mut trie = new_test_trie(TrieMode::ALL);
        trie.put(b"ab", b"short").unwrap();
        trie.put(b"abcd", b"long").unwrap();
        assert_eq!(trie.get(b"ab").unwrap(), b"short");
        assert_eq!(trie.get(b"abcd").unwrap(), b"long");

        trie.delete(b"ab").unwrap();
        assert_eq!(trie.get(b"ab"), Err(Error::NotFound));
        assert_eq!(trie.get(b"abcd").unwrap(), b"long");
    }

    /// Tests canonical form: permuted insertion orders and detours through
    /// deleted keys converge to the same root hash.
    #[test]
    fn test_canonical_form() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (vec![0x12, 0x31], b"a".to_vec()),
            (vec![0x12, 0x32], b"b".to_vec()),
            (vec![0x45, 0x67], b"c".to_vec()),
            (vec![0x45], b"d".to_vec()),
            (vec![0xff, 0x00, 0x11], b"e".to_vec()),
        ];

        let mut forward = new_test_trie(TrieMode::ALL);
        for (k, v) in &entries {
            forward.put(k, v).unwrap();
        }

        let mut backward = new_test_trie(TrieMode::ALL);
        for (k, v) in entries.iter().rev() {
            backward.put(k, v).unwrap();
        }
        assert_eq!(forward.state_root(), backward.state_root());

        // a detour through an extra key, later removed, changes nothing
        let mut detour = new_test_trie(TrieMode::ALL);
        detour.put(&[0x12, 0x33], b"temp").unwrap();
        for (k, v) in &entries {
            detour.put(k, v).unwrap();
        }
        detour.delete(&[0x12, 0x33]).unwrap();
        assert_eq!(forward.state_root(), detour.state_root());
    }

    /// Tests deletion rebalancing down to extension merges: removing one of
    /// two diverging keys must re-merge the split extension.
    #[test]
    fn test_delete_rebalances() {
        let mut trie = new_test_trie(TrieMode::ALL);
        trie.put(&[0x12, 0x31], b"a").unwrap();
        let single_root = trie.state_root();

        trie.put(&[0x12, 0x32], b"b").unwrap();
        trie.delete(&[0x12, 0x32]).unwrap();
        assert_eq!(trie.state_root(), single_root);
        // the shape collapses back to a single extension over the full path
        let Node::Extension(ext) = &trie.root else {
            panic!("expected extension at the root");
        };
        assert_eq!(ext.key, vec![0x1, 0x2, 0x3, 0x1]);
    }

    /// Tests find ordering, prefix filtering, the start bound and the max
    /// cap.
    #[test]
    fn test_find() {
        let mut trie = new_test_trie(TrieMode::ALL);
        trie.put(b"ab", b"0").unwrap();
        trie.put(b"abc", b"1").unwrap();
        trie.put(b"abd", b"2").unwrap();
        trie.put(b"abe", b"3").unwrap();
        trie.put(b"b", b"4").unwrap();

        assert!(matches!(
            trie.find(b"ab", None, 0),
            Err(Error::InvalidArgument(_))
        ));

        // inclusive without a start key, in nibble order
        let all = trie.find(b"ab", None, 10).unwrap();
        let keys: Vec<&[u8]> = all.iter().map(|kv| kv.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"ab"[..], b"abc", b"abd", b"abe"]);

        // an empty start key excludes the exact-prefix entry
        let after_empty = trie.find(b"ab", Some(b""), 10).unwrap();
        assert_eq!(after_empty.len(), 3);
        assert_eq!(after_empty[0].key, b"abc");

        // resume after a previous page
        let after_c = trie.find(b"ab", Some(b"c"), 10).unwrap();
        let keys: Vec<&[u8]> = after_c.iter().map(|kv| kv.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"abd"[..], b"abe"]);

        // max caps the page
        let page = trie.find(b"ab", None, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].key, b"abc");

        // unknown prefix yields nothing
        assert!(trie.find(b"zz", None, 5).unwrap().is_empty());
    }

    /// Tests flush + read-through: after flushing, the tree shrinks to a
    /// hash placeholder and lookups re-materialize nodes from the store.
    #[test]
    fn test_flush_and_read_through() {
        let store: SharedStore = Arc::new(MemStore::new());
        let mut trie = Trie::new(Node::Empty, TrieMode::ALL, store.clone());
        trie.put(&[0x12, 0x31], b"value1").unwrap();
        trie.put(&[0x12, 0x32], b"value2").unwrap();
        let root = trie.state_root();

        trie.flush(7).unwrap();
        assert!(matches!(trie.root, Node::Hash(_)));
        assert_eq!(trie.state_root(), root);

        assert_eq!(trie.get(&[0x12, 0x31]).unwrap(), b"value1");
        // the path is materialized again now
        assert!(trie.root.is_concrete());

        // a fresh trie anchored at the root hash reads the same state
        let mut reader = Trie::new(Node::from_hash(root), TrieMode::ALL, store);
        assert_eq!(reader.get(&[0x12, 0x32]).unwrap(), b"value2");
        assert_eq!(reader.get(&[0x12, 0x33]), Err(Error::NotFound));
    }

    /// Tests collapse transparency: root hash and lookups are unaffected.
    #[test]
    fn test_collapse_preserves_observations() {
        let store: SharedStore = Arc::new(MemStore::new());
        let mut trie = Trie::new(Node::Empty, TrieMode::ALL, store);
        for i in 0u8..16 {
            trie.put(&[i, i], &[i + 1]).unwrap();
        }
        let root = trie.state_root();
        trie.flush(1).unwrap();
        // materialize everything back
        for i in 0u8..16 {
            assert_eq!(trie.get(&[i, i]).unwrap(), &[i + 1]);
        }

        trie.collapse(1);
        assert_eq!(trie.state_root(), root);
        for i in 0u8..16 {
            assert_eq!(trie.get(&[i, i]).unwrap(), &[i + 1]);
        }
    }

    /// Tests GC-mode reference counting across flushes: new nodes start at
    /// one reference, removed nodes become height-stamped tombstones, and
    /// re-inserting resurrects the record.
    #[test]
    fn test_gc_refcounts_and_tombstones() {
        let store: SharedStore = Arc::new(MemStore::new());
        let mut trie = Trie::new(Node::Empty, TrieMode::GC, store.clone());
        trie.put(b"k", b"v").unwrap();
        let leaf_hash = trie.root.hash();
        trie.flush(1).unwrap();

        let record = store.get(&node_key(&leaf_hash)).unwrap();
        let (_, refcount, height) = split_record(&record).unwrap();
        assert_eq!(refcount, 1);
        assert_eq!(height, 1);
        assert!(is_active_value(&record));

        trie.delete(b"k").unwrap();
        trie.flush(5).unwrap();
        let record = store.get(&node_key(&leaf_hash)).unwrap();
        assert!(!is_active_value(&record));
        assert_eq!(last_active_height(&record), 5);

        // resurrect the same content
        trie.put(b"k", b"v").unwrap();
        trie.flush(9).unwrap();
        let record = store.get(&node_key(&leaf_hash)).unwrap();
        let (_, refcount, height) = split_record(&record).unwrap();
        assert_eq!((refcount, height), (1, 9));
    }

    /// Tests LATEST mode: nodes dropped by an update disappear from the
    /// store at the next flush, so the old root becomes unresolvable.
    #[test]
    fn test_latest_mode_prunes_history() {
        let store: SharedStore = Arc::new(MemStore::new());
        let mut trie = Trie::new(Node::Empty, TrieMode::LATEST, store.clone());
        trie.put(b"k", b"v1").unwrap();
        trie.flush(1).unwrap();
        let old_root = trie.state_root();

        trie.put(b"k", b"v2").unwrap();
        trie.flush(2).unwrap();
        let new_root = trie.state_root();

        let mut old = Trie::new(Node::from_hash(old_root), TrieMode::LATEST, store.clone());
        assert_eq!(old.get(b"k"), Err(Error::NotFound));
        let mut new = Trie::new(Node::from_hash(new_root), TrieMode::LATEST, store);
        assert_eq!(new.get(b"k").unwrap(), b"v2");
    }

    /// Tests that a record referenced by two keys survives the removal of
    /// one of them in keep-latest mode.
    #[test]
    fn test_latest_mode_keeps_shared_nodes() {
        let store: SharedStore = Arc::new(MemStore::new());
        let mut trie = Trie::new(Node::Empty, TrieMode::LATEST, store.clone());
        // two keys with identical leaf content share a single node record
        trie.put(&[0x11], b"same").unwrap();
        trie.put(&[0x22], b"same").unwrap();
        trie.flush(1).unwrap();

        trie.delete(&[0x11]).unwrap();
        trie.flush(2).unwrap();
        let root = trie.state_root();

        let mut reader = Trie::new(Node::from_hash(root), TrieMode::LATEST, store);
        assert_eq!(reader.get(&[0x22]).unwrap(), b"same");
    }

    /// Tests that a corrupted node record is rejected on resolution.
    #[test]
    fn test_resolve_detects_corruption() {
        let store: SharedStore = Arc::new(MemStore::new());
        let mut trie = Trie::new(Node::Empty, TrieMode::ALL, store.clone());
        trie.put(b"k", b"v").unwrap();
        let root = trie.state_root();
        trie.flush(1).unwrap();

        // tamper with the stored record
        store
            .put(&node_key(&root), Node::Leaf(LeafNode::new(b"evil".to_vec())).bytes().as_slice())
            .unwrap();
        let mut reader = Trie::new(Node::from_hash(root), TrieMode::ALL, store);
        assert!(matches!(reader.get(b"k"), Err(Error::Corruption(_))));
    }
}
