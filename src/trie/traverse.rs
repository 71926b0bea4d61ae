//! Depth-first traversal and subtree restore.
//!
//! Traversal materializes hash placeholders as it walks, so a caller can
//! pull a whole subtree into memory (or ship it over the wire) by visiting
//! it. Restore is the other direction of state sync: a serialized node
//! delivered by a peer replaces the placeholder that expected it, after a
//! hash check, and is persisted immediately so later descents can find it.
use crate::{
    error::{Error, Result},
    trie::{
        node::{Node, VALUE_INDEX},
        trie::{make_record, node_key, split_record, Trie},
    },
};
use tracing::debug;

impl Trie {
    /// Walks the trie depth-first in pre-order, calling `f` with each
    /// node's canonical serialization. Before each visit `stop` is
    /// consulted; returning `true` halts the walk without error, leaving
    /// everything visited so far materialized. Empty children are skipped.
    pub fn traverse<F, S>(&mut self, f: &mut F, stop: &mut S) -> Result<()>
    where
        F: FnMut(&[u8]),
        S: FnMut(&[u8]) -> bool,
    {
        let mut root = std::mem::take(&mut self.root);
        let result = self.traverse_rec(&mut root, f, stop);
        self.root = root;
        match result {
            Err(Error::Stop) => Ok(()),
            other => other,
        }
    }

    fn traverse_rec<F, S>(&mut self, n: &mut Node, f: &mut F, stop: &mut S) -> Result<()>
    where
        F: FnMut(&[u8]),
        S: FnMut(&[u8]) -> bool,
    {
        match n {
            Node::Empty => Ok(()),
            Node::Hash(_) => {
                self.resolve_in_place(n)?;
                self.traverse_rec(n, f, stop)
            }
            _ => {
                let bytes = n.bytes();
                if stop(&bytes) {
                    return Err(Error::Stop);
                }
                f(&bytes);
                match n {
                    Node::Extension(ext) => self.traverse_rec(&mut ext.next, f, stop),
                    Node::Branch(branch) => {
                        for child in branch.children.iter_mut() {
                            self.traverse_rec(child, f, stop)?;
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Replaces the hash placeholder at `path` (in nibbles) with `node`,
    /// verifying that the placeholder expected exactly this node, and
    /// persists it so subsequent descents can resolve it.
    ///
    /// Fails with [`Error::BadPath`] when the path cannot be walked,
    /// [`Error::NotMissing`] when it ends on a materialized node or an
    /// empty slot, and [`Error::HashMismatch`] when the delivered node does
    /// not hash to the awaited value. The trie is unchanged on failure.
    pub fn restore_hash_node(&mut self, path: &[u8], node: Node) -> Result<()> {
        if !node.is_concrete() {
            return Err(Error::InvalidArgument(
                "only materialized nodes can be restored",
            ));
        }
        let mut root = std::mem::take(&mut self.root);
        let result = self.restore_walk(&mut root, path, node);
        self.root = root;
        result
    }

    fn restore_walk(&mut self, n: &mut Node, path: &[u8], node: Node) -> Result<()> {
        match n {
            Node::Hash(expected) if path.is_empty() => {
                if *expected != node.hash() {
                    return Err(Error::HashMismatch);
                }
                self.persist_restored(&node)?;
                debug!(hash = %node.hash(), "restored trie node");
                let mut node = node;
                node.mark_persisted();
                *n = node;
                Ok(())
            }
            Node::Branch(branch) => {
                // an exhausted path addresses the branch's value child
                if let Some((&nib, rest)) = path.split_first() {
                    if nib as usize >= VALUE_INDEX {
                        return Err(Error::BadPath);
                    }
                    self.restore_walk(&mut branch.children[nib as usize], rest, node)
                } else {
                    self.restore_walk(&mut branch.children[VALUE_INDEX], &[], node)
                }
            }
            Node::Extension(ext) => {
                if !path.starts_with(&ext.key) {
                    return Err(Error::BadPath);
                }
                let klen = ext.key.len();
                self.restore_walk(&mut ext.next, &path[klen..], node)
            }
            _ if path.is_empty() => Err(Error::NotMissing),
            // leaves, empty slots and still-unrestored parents cannot be
            // descended through
            _ => Err(Error::BadPath),
        }
    }

    /// Writes a restored node to the store. In reference-counted modes an
    /// existing live record is left untouched; tombstoned or absent records
    /// are written back with a single reference.
    fn persist_restored(&self, node: &Node) -> Result<()> {
        let key = node_key(&node.hash());
        let bytes = node.bytes();
        if !self.mode.rc() {
            return self.store.put(&key, &bytes);
        }
        match self.store.get(&key) {
            Ok(record) => {
                let (_, refcount, _) = split_record(&record)?;
                if refcount == 0 {
                    self.store.put(&key, &make_record(&bytes, 1, 0))?;
                }
                Ok(())
            }
            Err(Error::NotFound) => self.store.put(&key, &make_record(&bytes, 1, 0)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mem_store::MemStore,
        trie::{
            node::{children_paths, LeafNode},
            proof::tests::new_proof_trie,
        },
        types::TrieMode,
    };
    use alloy_primitives::B256;
    use rustc_hash::FxHashMap;
    use std::sync::Arc;

    /// Size of a node on the wire: its bytes plus the varint-style length
    /// prefix a payload would carry.
    fn wire_size(node: &[u8]) -> usize {
        let var_size = match node.len() {
            0..=0xfc => 1,
            0xfd..=0xffff => 3,
            _ => 5,
        };
        node.len() + var_size
    }

    /// Tests an unrestricted traversal: every reachable node is visited
    /// once and the root hash is untouched.
    #[test]
    fn test_traverse_full() {
        let (mut trie, _) = new_proof_trie(false);
        let expected_root = trie.state_root();

        let mut nodes = Vec::new();
        trie.traverse(&mut |node: &[u8]| nodes.push(node.to_vec()), &mut |_: &[u8]| false)
            .unwrap();
        // root branch, two stored subtrees (ext+leaf, ext+leaf) and the
        // inserted extension, branch and two leaves
        assert_eq!(nodes.len(), 9);
        assert_eq!(trie.state_root(), expected_root);
    }

    /// Tests a byte-budget stop condition: the emitted nodes consume
    /// exactly the budget minus what is left over, and the trie root is
    /// unchanged by the halt.
    #[test]
    fn test_traverse_size_cap() {
        let (mut trie, _) = new_proof_trie(false);
        let expected_root = trie.state_root();

        const MAX_SIZE: usize = 300;
        let remaining = std::cell::Cell::new(MAX_SIZE);
        let mut nodes = Vec::new();
        {
            let mut visit = |node: &[u8]| {
                nodes.push(node.to_vec());
                remaining.set(remaining.get() - wire_size(node));
            };
            let mut stop = |node: &[u8]| wire_size(node) > remaining.get();
            trie.traverse(&mut visit, &mut stop).unwrap();
        }

        let consumed: usize = nodes.iter().map(|n| wire_size(n)).sum();
        assert!(!nodes.is_empty());
        assert_eq!(consumed + remaining.get(), MAX_SIZE);
        assert_eq!(trie.state_root(), expected_root);
    }

    /// Tests that a traversal over a root with unresolvable children
    /// surfaces the store failure.
    #[test]
    fn test_traverse_missing_node() {
        let (mut trie, _) = new_proof_trie(true);
        let result = trie.traverse(&mut |_: &[u8]| {}, &mut |_: &[u8]| false);
        assert_eq!(result, Err(Error::NotFound));
    }

    /// Tests the full restore round trip: traverse a trie into blobs, feed
    /// them in order into a fresh hash-rooted trie via the children-paths
    /// worklist, and end with an empty worklist and the same root.
    #[test]
    fn test_restore_roundtrip() {
        let (mut source, _) = new_proof_trie(false);
        let root = source.state_root();

        let mut blobs = Vec::new();
        source
            .traverse(&mut |node: &[u8]| blobs.push(node.to_vec()), &mut |_: &[u8]| false)
            .unwrap();

        let mut target = Trie::new(
            Node::from_hash(root),
            TrieMode::ALL,
            Arc::new(MemStore::new()),
        );
        let mut worklist: FxHashMap<B256, Vec<u8>> = FxHashMap::default();
        worklist.insert(root, Vec::new());

        for blob in &blobs {
            let node = Node::decode(blob).unwrap();
            let path = worklist
                .remove(&node.hash())
                .expect("every delivered node must be awaited");
            for (hash, child_path) in children_paths(&path, &node) {
                worklist.insert(hash, child_path);
            }
            target.restore_hash_node(&path, node).unwrap();
        }

        assert!(worklist.is_empty());
        assert_eq!(target.state_root(), root);

        // the restored trie answers the same lookups, via its own store
        let mut reemitted = Vec::new();
        target
            .traverse(&mut |node: &[u8]| reemitted.push(node.to_vec()), &mut |_: &[u8]| false)
            .unwrap();
        assert_eq!(reemitted.len(), blobs.len());
        assert_eq!(target.get(&[0x45, 0x67]).unwrap(), b"somevalue");
    }

    /// Tests every restore precondition failure; the trie must be left
    /// unchanged by each.
    #[test]
    fn test_restore_preconditions() {
        let (mut source, _) = new_proof_trie(false);
        let root = source.state_root();
        let mut blobs = Vec::new();
        source
            .traverse(&mut |node: &[u8]| blobs.push(node.to_vec()), &mut |_: &[u8]| false)
            .unwrap();
        let root_node = Node::decode(&blobs[0]).unwrap();

        let mut target = Trie::new(
            Node::from_hash(root),
            TrieMode::ALL,
            Arc::new(MemStore::new()),
        );

        // wrong node for the awaited hash
        let impostor = Node::Leaf(LeafNode::new(b"impostor".to_vec()));
        assert_eq!(
            target.restore_hash_node(&[], impostor.clone()),
            Err(Error::HashMismatch)
        );
        // a path that cannot be walked yet: the root is still a placeholder
        assert_eq!(
            target.restore_hash_node(&[1], impostor.clone()),
            Err(Error::BadPath)
        );
        // placeholders cannot be "restored" by another placeholder
        assert_eq!(
            target.restore_hash_node(&[], Node::from_hash(root)),
            Err(Error::InvalidArgument(
                "only materialized nodes can be restored"
            ))
        );

        target.restore_hash_node(&[], root_node.clone()).unwrap();
        // restoring the same node again: nothing is missing anymore
        assert_eq!(
            target.restore_hash_node(&[], root_node),
            Err(Error::NotMissing)
        );
        assert_eq!(target.state_root(), root);
    }
}
