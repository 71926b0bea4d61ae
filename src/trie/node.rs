//! The trie node model: four node kinds plus the empty marker, their
//! canonical binary codec and the lazy hash cache.
//!
//! A node's identity is the double-SHA-256 of its canonical serialization.
//! Branch and extension nodes embed their children as *references* (the
//! child's hash behind the hash tag, or the empty marker), so any node
//! serializes to a bounded, self-describing byte string regardless of how
//! much of the subtree is materialized in memory.
use crate::{
    constant::{MAX_KEY_LENGTH, MAX_VALUE_LENGTH},
    crypto::double_sha256,
    error::{Error, Result},
};
use alloy_primitives::B256;
use bytes::Buf;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;

/// Variant tag of a serialized branch node.
pub const TAG_BRANCH: u8 = 0x00;
/// Variant tag of a serialized extension node.
pub const TAG_EXTENSION: u8 = 0x01;
/// Variant tag of a serialized leaf node.
pub const TAG_LEAF: u8 = 0x02;
/// Variant tag of a hash reference.
pub const TAG_HASH: u8 = 0x03;
/// Variant tag of the empty marker.
pub const TAG_EMPTY: u8 = 0x04;

/// Child slots of a branch: sixteen nibble slots plus the value slot.
pub const CHILD_COUNT: usize = 17;
/// Index of the branch slot holding the value for keys ending at the branch.
pub const VALUE_INDEX: usize = 16;

/// Lazily computed serialization and hash of a node, plus the flag telling
/// whether the node's current bytes are known to live in the store.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeCache {
    bytes: OnceCell<Vec<u8>>,
    hash: OnceCell<B256>,
    persisted: bool,
}

/// Terminal node holding a value; the key path is fully consumed here.
#[derive(Clone, Debug)]
pub struct LeafNode {
    pub value: Vec<u8>,
    pub(crate) cache: NodeCache,
}

impl LeafNode {
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            cache: NodeCache::default(),
        }
    }
}

/// A shared nibble prefix (never empty) followed by exactly one child.
#[derive(Clone, Debug)]
pub struct ExtensionNode {
    /// Nibble prefix, length >= 1.
    pub key: Vec<u8>,
    pub next: Box<Node>,
    pub(crate) cache: NodeCache,
}

impl ExtensionNode {
    pub fn new(key: Vec<u8>, next: Node) -> Self {
        debug_assert!(!key.is_empty(), "extension key must not be empty");
        Self {
            key,
            next: Box::new(next),
            cache: NodeCache::default(),
        }
    }
}

/// Sixteen nibble-indexed children plus the value slot.
#[derive(Clone, Debug)]
pub struct BranchNode {
    pub children: [Node; CHILD_COUNT],
    pub(crate) cache: NodeCache,
}

impl BranchNode {
    pub fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| Node::Empty),
            cache: NodeCache::default(),
        }
    }

    /// Number of non-empty nibble children (the value slot not counted) and
    /// the index of the last one seen.
    pub(crate) fn child_census(&self) -> (usize, usize) {
        let mut count = 0;
        let mut last = 0;
        for (i, child) in self.children.iter().take(VALUE_INDEX).enumerate() {
            if !child.is_empty() {
                count += 1;
                last = i;
            }
        }
        (count, last)
    }
}

impl Default for BranchNode {
    fn default() -> Self {
        Self::new()
    }
}

/// A trie node. `Hash` stands in for a node not currently in memory and is
/// materialized from the store on demand; `Empty` marks an absent subtree.
#[derive(Clone, Debug, Default)]
pub enum Node {
    #[default]
    Empty,
    Hash(B256),
    Leaf(LeafNode),
    Extension(ExtensionNode),
    Branch(Box<BranchNode>),
}

impl Node {
    /// Wraps a hash into a placeholder; the zero hash is the empty subtree.
    pub fn from_hash(hash: B256) -> Node {
        if hash == B256::ZERO {
            Node::Empty
        } else {
            Node::Hash(hash)
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    /// Whether this is a materialized leaf, extension or branch.
    pub fn is_concrete(&self) -> bool {
        matches!(self, Node::Leaf(_) | Node::Extension(_) | Node::Branch(_))
    }

    fn cache(&self) -> Option<&NodeCache> {
        match self {
            Node::Leaf(n) => Some(&n.cache),
            Node::Extension(n) => Some(&n.cache),
            Node::Branch(n) => Some(&n.cache),
            _ => None,
        }
    }

    fn cache_mut(&mut self) -> Option<&mut NodeCache> {
        match self {
            Node::Leaf(n) => Some(&mut n.cache),
            Node::Extension(n) => Some(&mut n.cache),
            Node::Branch(n) => Some(&mut n.cache),
            _ => None,
        }
    }

    /// Canonical serialization of a concrete node, cached on first use.
    fn serialized(&self) -> &[u8] {
        let cache = self.cache().expect("only concrete nodes are serialized");
        cache.bytes.get_or_init(|| {
            let mut out = Vec::new();
            self.encode_into(&mut out);
            out
        })
    }

    /// The node hash: double SHA-256 of the canonical serialization. Hash
    /// placeholders return their stored hash, the empty node hashes to zero.
    pub fn hash(&self) -> B256 {
        match self {
            Node::Empty => B256::ZERO,
            Node::Hash(h) => *h,
            _ => {
                let cache = self.cache().expect("concrete node");
                *cache.hash.get_or_init(|| double_sha256(self.serialized()))
            }
        }
    }

    /// An owned copy of the canonical serialization.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Node::Empty => vec![TAG_EMPTY],
            Node::Hash(h) => {
                let mut out = Vec::with_capacity(1 + 32);
                out.push(TAG_HASH);
                out.extend_from_slice(h.as_slice());
                out
            }
            _ => self.serialized().to_vec(),
        }
    }

    /// Whether the node's current bytes are known to be in the store.
    /// References (`Hash`, `Empty`) are trivially persisted.
    pub(crate) fn persisted(&self) -> bool {
        match self.cache() {
            Some(cache) => cache.persisted,
            None => true,
        }
    }

    pub(crate) fn mark_persisted(&mut self) {
        if let Some(cache) = self.cache_mut() {
            cache.persisted = true;
        }
    }

    /// Pre-fills the serialization cache of a freshly decoded node. Keeping
    /// the stored form around lets later removals refer to the node's old
    /// identity even after its children were rebuilt.
    pub(crate) fn seed_cache(&mut self, bytes: Vec<u8>, hash: B256) {
        if let Some(cache) = self.cache_mut() {
            let _ = cache.bytes.set(bytes);
            let _ = cache.hash.set(hash);
        }
    }

    /// Drops the cached serialization after a structural change.
    pub(crate) fn invalidate(&mut self) {
        if let Some(cache) = self.cache_mut() {
            *cache = NodeCache::default();
        }
    }

    /// Writes the canonical serialization into `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Node::Empty => out.push(TAG_EMPTY),
            Node::Hash(h) => {
                out.push(TAG_HASH);
                out.extend_from_slice(h.as_slice());
            }
            Node::Leaf(n) => {
                out.push(TAG_LEAF);
                out.extend_from_slice(&(n.value.len() as u32).to_le_bytes());
                out.extend_from_slice(&n.value);
            }
            Node::Extension(n) => {
                out.push(TAG_EXTENSION);
                out.extend_from_slice(&(n.key.len() as u16).to_le_bytes());
                out.extend_from_slice(&pack_nibbles(&n.key));
                encode_ref(&n.next, out);
            }
            Node::Branch(n) => {
                out.push(TAG_BRANCH);
                for child in &n.children {
                    encode_ref(child, out);
                }
            }
        }
    }

    /// Decodes a node from its exact canonical serialization. Trailing
    /// bytes are corruption.
    pub fn decode(data: &[u8]) -> Result<Node> {
        let mut buf = data;
        let node = decode_node(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::Corruption("trailing bytes after node".into()));
        }
        Ok(node)
    }
}

/// Writes the reference form of a child: its hash behind the hash tag, or
/// the empty marker.
fn encode_ref(child: &Node, out: &mut Vec<u8>) {
    if child.is_empty() {
        out.push(TAG_EMPTY);
    } else {
        out.push(TAG_HASH);
        out.extend_from_slice(child.hash().as_slice());
    }
}

/// Packs nibbles two per byte, high nibble first; an odd path leaves the
/// final low nibble zero (the nibble count carries the parity).
fn pack_nibbles(path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len().div_ceil(2));
    for pair in path.chunks(2) {
        let lo = if pair.len() == 2 { pair[1] } else { 0 };
        out.push((pair[0] << 4) | lo);
    }
    out
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(Error::Corruption("unexpected end of node data".into()))
    } else {
        Ok(())
    }
}

fn decode_node(buf: &mut &[u8]) -> Result<Node> {
    need(buf, 1)?;
    match buf.get_u8() {
        TAG_EMPTY => Ok(Node::Empty),
        TAG_HASH => {
            need(buf, 32)?;
            let mut hash = [0u8; 32];
            buf.copy_to_slice(&mut hash);
            Ok(Node::from_hash(B256::from(hash)))
        }
        TAG_LEAF => {
            need(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            if len > MAX_VALUE_LENGTH {
                return Err(Error::Corruption("leaf value too long".into()));
            }
            need(buf, len)?;
            Ok(Node::Leaf(LeafNode::new(buf.copy_to_bytes(len).to_vec())))
        }
        TAG_EXTENSION => {
            need(buf, 2)?;
            let count = buf.get_u16_le() as usize;
            if count == 0 {
                return Err(Error::Corruption("extension with empty key".into()));
            }
            if count > MAX_KEY_LENGTH * 2 {
                return Err(Error::Corruption("extension key too long".into()));
            }
            let packed_len = count.div_ceil(2);
            need(buf, packed_len)?;
            let packed = buf.copy_to_bytes(packed_len);
            if count % 2 == 1 && packed[packed_len - 1] & 0x0f != 0 {
                return Err(Error::Corruption("non-canonical odd nibble padding".into()));
            }
            let mut key = Vec::with_capacity(count);
            for i in 0..count {
                let byte = packed[i / 2];
                key.push(if i % 2 == 0 { byte >> 4 } else { byte & 0x0f });
            }
            let next = decode_node(buf)?;
            if !matches!(next, Node::Hash(_)) {
                return Err(Error::Corruption(
                    "extension child must be a hash reference".into(),
                ));
            }
            Ok(Node::Extension(ExtensionNode::new(key, next)))
        }
        TAG_BRANCH => {
            let mut branch = BranchNode::new();
            for child in branch.children.iter_mut() {
                let decoded = decode_node(buf)?;
                if decoded.is_concrete() {
                    return Err(Error::Corruption(
                        "branch child must be a reference".into(),
                    ));
                }
                *child = decoded;
            }
            Ok(Node::Branch(Box::new(branch)))
        }
        tag => Err(Error::Corruption(format!("unknown node tag {tag:#04x}"))),
    }
}

/// Maps each hash-referenced child of `node` to the nibble path it is
/// expected at, given the node's own path. The state-sync driver feeds this
/// into its pool of unknown nodes after every restore.
pub fn children_paths(parent_path: &[u8], node: &Node) -> FxHashMap<B256, Vec<u8>> {
    let mut out = FxHashMap::default();
    match node {
        Node::Branch(b) => {
            for (i, child) in b.children.iter().enumerate() {
                if let Node::Hash(h) = child {
                    let mut path = parent_path.to_vec();
                    // The value child sits at the branch's own path.
                    if i < VALUE_INDEX {
                        path.push(i as u8);
                    }
                    out.insert(*h, path);
                }
            }
        }
        Node::Extension(e) => {
            if let Node::Hash(h) = e.next.as_ref() {
                let mut path = parent_path.to_vec();
                path.extend_from_slice(&e.key);
                out.insert(*h, path);
            }
        }
        _ => {}
    }
    out
}
