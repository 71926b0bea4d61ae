//! The contract the backing key/value engine must satisfy.
//!
//! The trie and the state-root module never talk to a database directly;
//! everything goes through [`Store`], an ordered byte store with batched
//! writes and prefix iteration. [`crate::mem_store::MemStore`] is the
//! in-memory reference implementation; production deployments plug in a
//! database-backed one instead.
use crate::error::Result;
use std::{collections::BTreeMap, sync::Arc};

/// A prefix range over store keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeekRange {
    /// Every visited key starts with this prefix.
    pub prefix: Vec<u8>,
}

impl SeekRange {
    /// Range over all keys starting with `prefix`.
    pub fn with_prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

/// Accumulator for an atomic group of writes.
///
/// Later operations on the same key override earlier ones; a `None` entry
/// is a deletion. The batch is applied with [`Store::write_batch`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteBatch {
    /// Schedules a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.insert(key.into(), Some(value.into()));
    }

    /// Schedules a deletion.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.insert(key.into(), None);
    }

    /// Number of scheduled operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, yielding its operations in key order.
    pub fn into_ops(self) -> impl Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> {
        self.ops.into_iter()
    }
}

/// Ordered key/value store contract.
///
/// Implementations must be safe for concurrent readers alongside batched
/// writers; all methods take `&self`.
pub trait Store: Send + Sync {
    /// Returns the value stored under `key`, or
    /// [`crate::Error::NotFound`].
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removes `key`. Removing an absent key is a no-op.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Creates an empty write-batch accumulator.
    fn batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    /// Atomically applies a batch of writes.
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Invokes `f` for every record in the range, in ascending key order.
    /// Iteration stops early when `f` returns `false`.
    fn seek(&self, range: &SeekRange, f: &mut dyn FnMut(&[u8], &[u8]) -> bool);

    /// As [`Store::seek`], but records for which `keep` returns `false` are
    /// deleted in the same pass. Returns the number of deleted records.
    fn seek_gc(
        &self,
        range: &SeekRange,
        keep: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize>;
}

/// Shared handle to a store, cloneable across tries and module views.
pub type SharedStore = Arc<dyn Store>;
