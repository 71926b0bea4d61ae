//! State-sync support: the pool of still-unknown node hashes and the wire
//! payload carrying serialized nodes.
//!
//! The pool is the sync driver's worklist. After a node is restored, the
//! driver removes its hash and registers the expected paths of the node's
//! hash children (see [`crate::trie::children_paths`]); the pool itself is
//! policy-free, request ordering and retries live in the driver.
use crate::{
    constant::MAX_BATCH_SIZE,
    error::{Error, Result},
};
use alloy_primitives::B256;
use bytes::Buf;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::RwLock;

/// What the pool knows about an unknown node: the nibble path the trie
/// expects it at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Item {
    pub path: Vec<u8>,
}

/// Thread-safe table of unknown MPT node hashes and their expected paths.
#[derive(Debug, Default)]
pub struct Pool {
    items: RwLock<FxHashMap<B256, Item>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `hash` is awaited.
    pub fn contains(&self, hash: &B256) -> bool {
        self.items
            .read()
            .expect("pool lock poisoned")
            .contains_key(hash)
    }

    /// The expected path for `hash`, if awaited.
    pub fn try_get(&self, hash: &B256) -> Option<Item> {
        self.items
            .read()
            .expect("pool lock poisoned")
            .get(hash)
            .cloned()
    }

    /// Registers an unknown node.
    pub fn add(&self, hash: B256, item: Item) {
        self.items
            .write()
            .expect("pool lock poisoned")
            .insert(hash, item);
    }

    /// Drops an entry, typically after a successful restore.
    pub fn remove(&self, hash: &B256) {
        self.items.write().expect("pool lock poisoned").remove(hash);
    }

    /// Atomically removes and then adds entries in one critical section.
    pub fn update(&self, remove: &FxHashSet<B256>, add: FxHashMap<B256, Item>) {
        let mut items = self.items.write().expect("pool lock poisoned");
        for hash in remove {
            items.remove(hash);
        }
        for (hash, item) in add {
            items.insert(hash, item);
        }
    }

    /// Number of awaited nodes.
    pub fn count(&self) -> usize {
        self.items.read().expect("pool lock poisoned").len()
    }

    /// Empties the pool, e.g. when the sync driver restarts from a new
    /// state root.
    pub fn clear(&self) {
        self.items.write().expect("pool lock poisoned").clear();
    }
}

/// Wire payload with a batch of serialized MPT nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MptData {
    pub nodes: Vec<Vec<u8>>,
}

impl MptData {
    /// Deterministic wire encoding: a count followed by length-prefixed
    /// node serializations, all little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for node in &self.nodes {
            out.extend_from_slice(&(node.len() as u32).to_le_bytes());
            out.extend_from_slice(node);
        }
        out
    }

    /// Decodes a payload, requiring at least one node and at most
    /// [`MAX_BATCH_SIZE`] of them.
    pub fn decode(data: &[u8]) -> Result<MptData> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(Error::BadBatch("truncated node payload"));
        }
        let count = buf.get_u32_le() as usize;
        if count == 0 {
            return Err(Error::BadBatch("empty node payload"));
        }
        if count > MAX_BATCH_SIZE {
            return Err(Error::BadBatch("node payload too large"));
        }
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(Error::BadBatch("truncated node payload"));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(Error::BadBatch("truncated node payload"));
            }
            nodes.push(buf.copy_to_bytes(len).to_vec());
        }
        if buf.has_remaining() {
            return Err(Error::BadBatch("trailing bytes in node payload"));
        }
        Ok(MptData { nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    /// Tests the basic pool operations and counting.
    #[test]
    fn test_pool_operations() {
        let pool = Pool::new();
        assert_eq!(pool.count(), 0);
        assert!(!pool.contains(&hash(1)));

        pool.add(hash(1), Item { path: vec![1, 2] });
        pool.add(hash(2), Item { path: vec![] });
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.try_get(&hash(1)).unwrap().path, vec![1, 2]);
        assert!(pool.try_get(&hash(9)).is_none());

        pool.remove(&hash(1));
        assert!(!pool.contains(&hash(1)));
        assert_eq!(pool.count(), 1);

        pool.clear();
        assert_eq!(pool.count(), 0);
    }

    /// Tests the atomic update: removals happen before additions, so an
    /// entry in both sets ends up present.
    #[test]
    fn test_pool_update_removes_then_adds() {
        let pool = Pool::new();
        pool.add(hash(1), Item { path: vec![1] });
        pool.add(hash(2), Item { path: vec![2] });

        let remove: FxHashSet<B256> = [hash(1), hash(3)].into_iter().collect();
        let add: FxHashMap<B256, Item> = [
            (hash(3), Item { path: vec![3] }),
            (hash(4), Item { path: vec![4] }),
        ]
        .into_iter()
        .collect();
        pool.update(&remove, add);

        assert!(!pool.contains(&hash(1)));
        assert!(pool.contains(&hash(2)));
        assert_eq!(pool.try_get(&hash(3)).unwrap().path, vec![3]);
        assert!(pool.contains(&hash(4)));
        assert_eq!(pool.count(), 3);
    }

    /// Tests payload codec bounds: round trip, emptiness, size cap and
    /// truncation.
    #[test]
    fn test_mpt_data_codec() {
        let payload = MptData {
            nodes: vec![vec![1, 2, 3], vec![], vec![9; 40]],
        };
        let bytes = payload.to_bytes();
        assert_eq!(MptData::decode(&bytes).unwrap(), payload);

        assert!(matches!(
            MptData::decode(&MptData::default().to_bytes()),
            Err(Error::BadBatch("empty node payload"))
        ));

        let oversized = MptData {
            nodes: vec![vec![0]; MAX_BATCH_SIZE + 1],
        };
        assert!(matches!(
            MptData::decode(&oversized.to_bytes()),
            Err(Error::BadBatch("node payload too large"))
        ));

        assert!(MptData::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(MptData::decode(&[]).is_err());
    }
}
