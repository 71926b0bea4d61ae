//! Batched trie mutation.
//!
//! A [`Batch`] is the ordered set of key mutations produced by executing one
//! block. [`Trie::put_batch`] applies it with a single grouped descent per
//! shared prefix, so ancestors common to many operations are rebuilt once
//! instead of once per operation. The observable result is identical to
//! applying the operations one by one in key order.
use crate::{
    constant::{MAX_KEY_LENGTH, MAX_VALUE_LENGTH},
    error::{Error, Result},
    trie::{
        nibbles::{common_prefix_len, to_nibbles},
        node::{BranchNode, ExtensionNode, LeafNode, Node, VALUE_INDEX},
        trie::Trie,
    },
};
use derive_more::Deref;

/// A sorted, key-unique collection of puts and tombstones.
#[derive(Clone, Debug, Default, Deref)]
pub struct Batch {
    /// Entries ordered by key; `None` values are deletions.
    #[deref]
    kv: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mutation for `key`. A `None` or empty value is a deletion.
    /// Adding a key twice keeps the latest operation.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::BadBatch("key too long"));
        }
        let value = match value {
            Some(v) if v.is_empty() => None,
            Some(v) if v.len() > MAX_VALUE_LENGTH => {
                return Err(Error::BadBatch("value too long"))
            }
            other => other,
        };
        let value = value.map(<[u8]>::to_vec);
        match self.kv.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => self.kv[i].1 = value,
            Err(i) => self.kv.insert(i, (key.to_vec(), value)),
        }
        Ok(())
    }
}

/// A batch entry translated to nibble space: the full nibble path and the
/// optional new value.
type Entry = (Vec<u8>, Option<Vec<u8>>);

impl Trie {
    /// Applies a batch, returning the number of operations that changed the
    /// trie (deletions of absent keys are no-ops). Equivalent to sequential
    /// application; on a store error the trie may hold a partially applied
    /// batch, exactly like an interrupted sequence of puts.
    pub fn put_batch(&mut self, batch: Batch) -> Result<usize> {
        if batch.is_empty() {
            return Err(Error::BadBatch("empty batch"));
        }
        let entries: Vec<Entry> = batch
            .kv
            .into_iter()
            .map(|(key, value)| (to_nibbles(&key), value))
            .collect();
        let mut root = std::mem::take(&mut self.root);
        let result = self.put_batch_into(&mut root, &entries, 0);
        self.root = root;
        result.map(|(applied, _)| applied)
    }

    /// Applies `entries` (suffixes starting at `depth`) to the subtree at
    /// `n`. Returns the number of applied operations and whether the
    /// subtree changed.
    fn put_batch_into(
        &mut self,
        n: &mut Node,
        entries: &[Entry],
        depth: usize,
    ) -> Result<(usize, bool)> {
        if entries.is_empty() {
            return Ok((0, false));
        }
        match n {
            Node::Empty => {
                let puts: Vec<&Entry> =
                    entries.iter().filter(|(_, v)| v.is_some()).collect();
                if puts.is_empty() {
                    return Ok((0, false));
                }
                let applied = puts.len();
                *n = subtrie_from_many(&puts, depth);
                Ok((applied, true))
            }
            Node::Hash(_) => {
                self.resolve_in_place(n)?;
                self.put_batch_into(n, entries, depth)
            }
            Node::Leaf(_) => {
                let (exact, rest): (Vec<&Entry>, Vec<&Entry>) =
                    entries.iter().partition(|(path, _)| path.len() == depth);
                if rest.is_empty() {
                    // a single operation addressed at this leaf
                    let (_, op) = exact[0];
                    self.note_removed(n);
                    match op {
                        Some(value) => {
                            n.invalidate();
                            let Node::Leaf(leaf) = n else { unreachable!() };
                            leaf.value = value.clone();
                        }
                        None => *n = Node::Empty,
                    }
                    return Ok((1, true));
                }
                // longer keys arrive below: the leaf becomes a branch value
                self.note_removed(n);
                let Node::Leaf(old) = std::mem::take(n) else {
                    unreachable!()
                };
                let mut branch = BranchNode::new();
                branch.children[VALUE_INDEX] = Node::Leaf(LeafNode::new(old.value));
                *n = Node::Branch(Box::new(branch));
                let (applied, _) = self.put_batch_into(n, entries, depth)?;
                Ok((applied, true))
            }
            Node::Branch(_) => {
                self.note_removed(n);
                n.invalidate();
                let mut applied = 0;
                let mut changed = false;
                {
                    let Node::Branch(branch) = n else { unreachable!() };
                    let mut i = 0;
                    // value-slot operation first: the shortest key sorts first
                    if entries[0].0.len() == depth {
                        let (_, op) = &entries[0];
                        let old = std::mem::take(&mut branch.children[VALUE_INDEX]);
                        match op {
                            Some(value) => {
                                self.note_removed(&old);
                                branch.children[VALUE_INDEX] =
                                    Node::Leaf(LeafNode::new(value.clone()));
                                applied += 1;
                                changed = true;
                            }
                            None if !old.is_empty() => {
                                self.note_removed(&old);
                                applied += 1;
                                changed = true;
                            }
                            None => {}
                        }
                        i = 1;
                    }
                    while i < entries.len() {
                        let nib = entries[i].0[depth];
                        let mut j = i + 1;
                        while j < entries.len() && entries[j].0[depth] == nib {
                            j += 1;
                        }
                        let (a, c) = self.put_batch_into(
                            &mut branch.children[nib as usize],
                            &entries[i..j],
                            depth + 1,
                        )?;
                        applied += a;
                        changed |= c;
                        i = j;
                    }
                }
                self.strip_branch(n)?;
                Ok((applied, changed))
            }
            Node::Extension(_) => {
                let key = {
                    let Node::Extension(ext) = &*n else { unreachable!() };
                    ext.key.clone()
                };
                let descends = |(path, _): &&Entry| path[depth..].starts_with(&key);
                // operations diverging from the prefix can only create new
                // keys; divergent deletions are no-ops and fall away
                let divergent_puts: Vec<&Entry> = entries
                    .iter()
                    .filter(|e| !descends(e) && e.1.is_some())
                    .collect();
                if divergent_puts.is_empty() {
                    let descending: Vec<Entry> = entries
                        .iter()
                        .filter(|e| descends(e))
                        .cloned()
                        .collect();
                    if descending.is_empty() {
                        return Ok((0, false));
                    }
                    self.note_removed(n);
                    n.invalidate();
                    let (applied, changed) = {
                        let Node::Extension(ext) = n else { unreachable!() };
                        self.put_batch_into(&mut ext.next, &descending, depth + key.len())?
                    };
                    self.normalize_extension(n);
                    return Ok((applied, changed));
                }
                // a divergent put forces a split at the shortest shared
                // prefix, after which everything continues below the branch
                let split = divergent_puts
                    .iter()
                    .map(|(path, _)| common_prefix_len(&key, &path[depth..]))
                    .min()
                    .expect("divergent puts are non-empty");
                self.note_removed(n);
                n.invalidate();
                let Node::Extension(ext) = std::mem::take(n) else {
                    unreachable!()
                };
                let next = *ext.next;
                let mut branch = BranchNode::new();
                branch.children[key[split] as usize] = if key.len() == split + 1 {
                    next
                } else {
                    Node::Extension(ExtensionNode::new(key[split + 1..].to_vec(), next))
                };
                let mut subtree = Node::Branch(Box::new(branch));
                let keep: Vec<Entry> = entries
                    .iter()
                    .filter(|e| descends(e) || e.1.is_some())
                    .cloned()
                    .collect();
                let (applied, _) = self.put_batch_into(&mut subtree, &keep, depth + split)?;
                *n = if split > 0 {
                    let mut wrapped =
                        Node::Extension(ExtensionNode::new(key[..split].to_vec(), subtree));
                    self.normalize_extension(&mut wrapped);
                    wrapped
                } else {
                    subtree
                };
                Ok((applied, true))
            }
        }
    }
}

/// Builds a fresh subtree holding all the put entries, whose nibble suffixes
/// start at `depth`. Entries are sorted and key-distinct.
fn subtrie_from_many(puts: &[&Entry], depth: usize) -> Node {
    debug_assert!(!puts.is_empty());
    if puts.len() == 1 {
        let (path, value) = puts[0];
        let value = value.as_ref().expect("only puts reach subtree building");
        let leaf = Node::Leaf(LeafNode::new(value.clone()));
        return if path.len() == depth {
            leaf
        } else {
            Node::Extension(ExtensionNode::new(path[depth..].to_vec(), leaf))
        };
    }
    // the longest prefix shared by all suffixes is the lcp of the sorted
    // extremes
    let first = &puts[0].0[depth..];
    let last = &puts[puts.len() - 1].0[depth..];
    let lcp = common_prefix_len(first, last);
    if lcp > 0 {
        let inner = subtrie_from_many(puts, depth + lcp);
        return Node::Extension(ExtensionNode::new(
            puts[0].0[depth..depth + lcp].to_vec(),
            inner,
        ));
    }
    let mut branch = BranchNode::new();
    let mut i = 0;
    if puts[0].0.len() == depth {
        let value = puts[0].1.as_ref().expect("put entry");
        branch.children[VALUE_INDEX] = Node::Leaf(LeafNode::new(value.clone()));
        i = 1;
    }
    while i < puts.len() {
        let nib = puts[i].0[depth];
        let mut j = i + 1;
        while j < puts.len() && puts[j].0[depth] == nib {
            j += 1;
        }
        branch.children[nib as usize] = subtrie_from_many(&puts[i..j], depth + 1);
        i = j;
    }
    Node::Branch(Box::new(branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem_store::MemStore, types::TrieMode};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::Arc;

    fn new_trie() -> Trie {
        Trie::new(Node::Empty, TrieMode::ALL, Arc::new(MemStore::new()))
    }

    /// Tests batch ordering and dedup: later adds win, keys stay sorted.
    #[test]
    fn test_batch_accumulation() {
        let mut batch = Batch::new();
        batch.add(b"b", Some(b"2")).unwrap();
        batch.add(b"a", Some(b"1")).unwrap();
        batch.add(b"b", Some(b"3")).unwrap();
        batch.add(b"c", Some(b"")).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].0, b"a");
        assert_eq!(batch[1], (b"b".to_vec(), Some(b"3".to_vec())));
        // the empty value turned into a tombstone
        assert_eq!(batch[2], (b"c".to_vec(), None));

        assert!(matches!(
            batch.add(&vec![0u8; MAX_KEY_LENGTH + 1], Some(b"v")),
            Err(Error::BadBatch(_))
        ));
    }

    /// Tests that a batch over an empty trie equals sequential insertion,
    /// with the count reflecting applied operations only.
    #[test]
    fn test_batch_on_empty_trie() {
        let mut batch = Batch::new();
        batch.add(&[0x12, 0x31], Some(b"a")).unwrap();
        batch.add(&[0x12, 0x32], Some(b"b")).unwrap();
        batch.add(&[0x45, 0x67], Some(b"c")).unwrap();
        batch.add(&[0x99], None).unwrap(); // absent key: no-op

        let mut batched = new_trie();
        assert_eq!(batched.put_batch(batch).unwrap(), 3);

        let mut sequential = new_trie();
        sequential.put(&[0x12, 0x31], b"a").unwrap();
        sequential.put(&[0x12, 0x32], b"b").unwrap();
        sequential.put(&[0x45, 0x67], b"c").unwrap();
        assert_eq!(batched.state_root(), sequential.state_root());
        assert_eq!(batched.get(&[0x12, 0x32]).unwrap(), b"b");
    }

    /// Tests mixed puts and deletes against a populated trie, including
    /// value-slot operations and extension splits.
    #[test]
    fn test_batch_mixed_operations() {
        let mut trie = new_trie();
        trie.put(b"ab", b"short").unwrap();
        trie.put(b"abcd", b"long").unwrap();
        trie.put(b"abce", b"other").unwrap();

        let mut batch = Batch::new();
        batch.add(b"ab", None).unwrap(); // delete the branch value
        batch.add(b"abcd", Some(b"updated")).unwrap();
        batch.add(b"ax", Some(b"split")).unwrap(); // forces an extension split
        batch.add(b"zz", None).unwrap(); // absent: no-op
        assert_eq!(trie.put_batch(batch).unwrap(), 3);

        let mut expected = new_trie();
        expected.put(b"abcd", b"updated").unwrap();
        expected.put(b"abce", b"other").unwrap();
        expected.put(b"ax", b"split").unwrap();
        assert_eq!(trie.state_root(), expected.state_root());
        assert_eq!(trie.get(b"ab"), Err(Error::NotFound));
    }

    /// Tests that deleting every key through a batch empties the trie.
    #[test]
    fn test_batch_delete_all() {
        let mut trie = new_trie();
        trie.put(b"k1", b"a").unwrap();
        trie.put(b"k2", b"b").unwrap();

        let mut batch = Batch::new();
        batch.add(b"k1", None).unwrap();
        batch.add(b"k2", None).unwrap();
        assert_eq!(trie.put_batch(batch).unwrap(), 2);
        assert_eq!(trie.state_root(), alloy_primitives::B256::ZERO);

        assert!(matches!(
            trie.put_batch(Batch::new()),
            Err(Error::BadBatch(_))
        ));
    }

    /// Tests batch/sequential equivalence over a randomized corpus of a
    /// thousand distinct keys.
    #[test]
    fn test_batch_matches_sequential_random() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut keys = std::collections::BTreeSet::new();
        while keys.len() < 1000 {
            keys.insert(rng.gen::<[u8; 16]>());
        }
        let entries: Vec<([u8; 16], [u8; 32])> =
            keys.into_iter().map(|k| (k, rng.gen())).collect();

        let mut sequential = new_trie();
        for (k, v) in &entries {
            sequential.put(k, v).unwrap();
        }

        let mut batch = Batch::new();
        for (k, v) in &entries {
            batch.add(k, Some(v)).unwrap();
        }
        let mut batched = new_trie();
        assert_eq!(batched.put_batch(batch).unwrap(), entries.len());
        assert_eq!(batched.state_root(), sequential.state_root());
    }
}
