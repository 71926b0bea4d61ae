//! The Merkle Patricia Trie: node model, tree algorithms, proofs,
//! traversal and restore.
pub mod batch;
pub mod nibbles;
pub mod node;
pub mod proof;
pub mod traverse;
pub mod trie;

pub use batch::Batch;
pub use node::{children_paths, BranchNode, ExtensionNode, LeafNode, Node};
pub use proof::verify_proof;
pub use trie::{is_active_value, last_active_height, Trie};
