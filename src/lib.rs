#![doc = include_str!("../README.md")]

pub mod constant;
pub mod crypto;
pub mod error;
pub mod mem_store;
pub mod stateroot;
pub mod sync;
pub mod traits;
pub mod trie;
pub mod types;

pub use error::{Error, Result};
pub use mem_store::{MemCachedStore, MemStore};
pub use stateroot::{GcStats, Module, StateRoot, VerifierFn, Witness};
pub use traits::{SeekRange, SharedStore, Store, WriteBatch};
pub use trie::{children_paths, verify_proof, Batch, Node, Trie};
pub use types::{KeyValue, B256, TrieMode};
