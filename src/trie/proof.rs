//! Inclusion proofs: building the node list authenticating a key and
//! replaying it against a bare root hash.
use crate::{
    crypto::double_sha256,
    error::{Error, Result},
    mem_store::MemStore,
    traits::Store,
    trie::{
        nibbles::to_nibbles,
        node::{Node, VALUE_INDEX},
        trie::{node_key, Trie},
    },
    types::TrieMode,
};
use alloy_primitives::B256;
use std::sync::Arc;

impl Trie {
    /// Builds a proof that `key` belongs to this trie: the canonical
    /// serializations of every node on the path from the root to the leaf,
    /// in that order. Fails with [`Error::NotFound`] when the key is absent
    /// or part of the path cannot be resolved from the store.
    pub fn get_proof(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Self::check_key(key)?;
        let path = to_nibbles(key);
        let mut proof = Vec::new();
        let mut root = std::mem::take(&mut self.root);
        let result = self.proof_walk(&mut root, &path, &mut proof);
        self.root = root;
        result.map(|_| proof)
    }

    fn proof_walk(
        &mut self,
        n: &mut Node,
        path: &[u8],
        proof: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        match n {
            Node::Empty => Err(Error::NotFound),
            Node::Hash(_) => {
                self.resolve_in_place(n)?;
                self.proof_walk(n, path, proof)
            }
            Node::Leaf(_) => {
                if path.is_empty() {
                    proof.push(n.bytes());
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
                proof.push(n.bytes());
                let Node::Extension(ext) = n else { unreachable!() };
                self.proof_walk(&mut ext.next, &path[klen..], proof)
            }
            Node::Branch(_) => {
                proof.push(n.bytes());
                let Node::Branch(branch) = n else { unreachable!() };
                if let Some((&nib, rest)) = path.split_first() {
                    self.proof_walk(&mut branch.children[nib as usize], rest, proof)
                } else {
                    self.proof_walk(&mut branch.children[VALUE_INDEX], &[], proof)
                }
            }
        }
    }
}

/// Verifies that `proof` authenticates `key` under the trie identified by
/// `root_hash`, returning the proven value on success.
///
/// The proof entries are indexed by their hash in a throwaway store and the
/// lookup is replayed over them; extra entries are ignored, missing ones
/// make the verification fail. The function is pure: it touches no
/// persistent state.
pub fn verify_proof(root_hash: B256, key: &[u8], proof: &[Vec<u8>]) -> Option<Vec<u8>> {
    let store = MemStore::new();
    for node in proof {
        let hash = double_sha256(node);
        store
            .put(&node_key(&hash), node)
            .expect("memory store writes cannot fail");
    }
    let mut trie = Trie::new(Node::from_hash(root_hash), TrieMode::ALL, Arc::new(store));
    trie.get(key).ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        traits::SharedStore,
        trie::node::{BranchNode, ExtensionNode, LeafNode},
    };

    /// Builds the reference proof trie: two inserted keys under an
    /// extension plus two hand-linked subtrees, one of which is only
    /// resolvable through the store (and optionally missing from it).
    ///
    /// Key layout: 0x1231 -> "value1", 0x1232 -> "value2",
    /// 0x4567 -> "somevalue" (behind a stored hash child),
    /// 0x55 -> "invalid" (left out of the store when `missing`).
    pub(crate) fn new_proof_trie(missing: bool) -> (Trie, SharedStore) {
        let store: SharedStore = Arc::new(MemStore::new());

        let leaf = Node::Leaf(LeafNode::new(b"somevalue".to_vec()));
        let ext = Node::Extension(ExtensionNode::new(vec![5, 6, 7], leaf.clone()));
        let hidden_leaf = Node::Leaf(LeafNode::new(b"invalid".to_vec()));
        let ext2 = Node::Extension(ExtensionNode::new(
            vec![5],
            Node::from_hash(hidden_leaf.hash()),
        ));

        let mut branch = BranchNode::new();
        branch.children[4] = Node::from_hash(ext.hash());
        branch.children[5] = ext2;

        let mut trie = Trie::new(
            Node::Branch(Box::new(branch)),
            TrieMode::ALL,
            store.clone(),
        );
        trie.put(&[0x12, 0x31], b"value1").unwrap();
        trie.put(&[0x12, 0x32], b"value2").unwrap();

        store.put(&node_key(&leaf.hash()), &leaf.bytes()).unwrap();
        store.put(&node_key(&ext.hash()), &ext.bytes()).unwrap();
        if !missing {
            store
                .put(&node_key(&hidden_leaf.hash()), &hidden_leaf.bytes())
                .unwrap();
        }
        (trie, store)
    }

    /// Tests proof construction: a present key yields the root-to-leaf
    /// node list, absent keys and unresolvable paths fail.
    #[test]
    fn test_get_proof() {
        let (mut trie, _) = new_proof_trie(true);

        // 0x12 stops mid-extension
        assert_eq!(trie.get_proof(&[0x12]), Err(Error::NotFound));

        let proof = trie.get_proof(&[0x12, 0x31]).unwrap();
        // branch, extension, branch, leaf
        assert_eq!(proof.len(), 4);

        // the subtree behind nibble 5 is not in the store
        assert_eq!(trie.get_proof(&[0x55]), Err(Error::NotFound));
    }

    /// Tests proof soundness and non-forgery on an in-memory path.
    #[test]
    fn test_verify_proof() {
        let (mut trie, _) = new_proof_trie(true);
        let root = trie.state_root();

        let proof = trie.get_proof(&[0x12, 0x32]).unwrap();
        assert_eq!(
            verify_proof(root, &[0x12, 0x32], &proof),
            Some(b"value2".to_vec())
        );
        // the sibling key is not authenticated by this proof
        assert_eq!(verify_proof(root, &[0x12, 0x31], &proof), None);
        // nor does a wrong root accept it
        assert_eq!(verify_proof(B256::repeat_byte(1), &[0x12, 0x32], &proof), None);
    }

    /// Tests proving through a hash child: the path must be materialized
    /// from the store and still verify.
    #[test]
    fn test_proof_through_stored_subtree() {
        let (mut trie, _) = new_proof_trie(true);
        let root = trie.state_root();

        let key = [0x45, 0x67];
        let proof = trie.get_proof(&key).unwrap();
        // branch, extension, leaf
        assert_eq!(proof.len(), 3);
        assert_eq!(verify_proof(root, &key, &proof), Some(b"somevalue".to_vec()));
    }

    /// Tests that a missing stored node fails only the proofs that need it.
    #[test]
    fn test_missing_node_is_isolated() {
        let (mut trie, _) = new_proof_trie(true);
        assert_eq!(trie.get_proof(&[0x55]), Err(Error::NotFound));
        // unrelated proofs still work
        assert!(trie.get_proof(&[0x45, 0x67]).is_ok());

        let (mut complete, _) = new_proof_trie(false);
        let root = complete.state_root();
        let proof = complete.get_proof(&[0x55]).unwrap();
        assert_eq!(verify_proof(root, &[0x55], &proof), Some(b"invalid".to_vec()));
    }

    /// Tests a proof for a key stored in a branch value slot.
    #[test]
    fn test_proof_for_branch_value() {
        let store: SharedStore = Arc::new(MemStore::new());
        let mut trie = Trie::new(Node::Empty, TrieMode::ALL, store);
        trie.put(b"ab", b"short").unwrap();
        trie.put(b"abcd", b"long").unwrap();
        let root = trie.state_root();

        let proof = trie.get_proof(b"ab").unwrap();
        assert_eq!(verify_proof(root, b"ab", &proof), Some(b"short".to_vec()));
        assert_eq!(verify_proof(root, b"abcd", &proof), None);
    }
}
