//! In-memory storage backends.
//!
//! [`MemStore`] is a plain `BTreeMap`-backed [`Store`] used by tests, tools
//! and as the reference implementation of the storage contract.
//! [`MemCachedStore`] layers a write buffer over any shared base store:
//! reads fall through to the base, writes stay in the overlay until
//! [`MemCachedStore::persist`] pushes them down in one batch. The state-root
//! module uses such views to scope a single block's mutations before commit.
//!
//! All operations are thread-safe through [`RwLock`] interior mutability.
use crate::{
    error::{Error, Result},
    traits::{SeekRange, SharedStore, Store, WriteBatch},
};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::RwLock,
};

/// Returns the half-open key range covering every key with `prefix`.
fn prefix_bounds(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(prefix.to_vec());
    // The smallest key greater than every prefixed key: the prefix with its
    // last non-0xff byte incremented. An all-0xff prefix is unbounded above.
    let mut end = prefix.to_vec();
    while let Some(last) = end.last() {
        if *last == 0xff {
            end.pop();
        } else {
            *end.last_mut().unwrap() += 1;
            return (start, Bound::Excluded(end));
        }
    }
    (start, Bound::Unbounded)
}

/// Simple in-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.map.read().expect("store lock poisoned").len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.map
            .read()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map
            .write()
            .expect("store lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().expect("store lock poisoned").remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write().expect("store lock poisoned");
        for (key, value) in batch.into_ops() {
            match value {
                Some(v) => map.insert(key, v),
                None => map.remove(&key),
            };
        }
        Ok(())
    }

    fn seek(&self, range: &SeekRange, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        // Snapshot the range so the callback can freely call back into the
        // store without holding the lock.
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = {
            let map = self.map.read().expect("store lock poisoned");
            map.range(prefix_bounds(&range.prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (k, v) in pairs {
            if !f(&k, &v) {
                break;
            }
        }
    }

    fn seek_gc(
        &self,
        range: &SeekRange,
        keep: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = {
            let map = self.map.read().expect("store lock poisoned");
            map.range(prefix_bounds(&range.prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let doomed: Vec<Vec<u8>> = pairs
            .into_iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k)
            .collect();
        let removed = doomed.len();
        let mut map = self.map.write().expect("store lock poisoned");
        for k in doomed {
            map.remove(&k);
        }
        Ok(removed)
    }
}

/// A layered store view buffering writes over a shared base.
///
/// Reads consult the overlay first (a buffered deletion shadows the base),
/// then fall through. Writes never touch the base until [`persist`] is
/// called, which pushes the whole overlay down as one atomic batch.
///
/// [`persist`]: MemCachedStore::persist
pub struct MemCachedStore {
    base: SharedStore,
    overlay: RwLock<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl std::fmt::Debug for MemCachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCachedStore")
            .field("overlay", &self.overlay)
            .finish()
    }
}

impl MemCachedStore {
    /// Creates an empty view over `base`.
    pub fn new(base: SharedStore) -> Self {
        Self {
            base,
            overlay: RwLock::new(BTreeMap::new()),
        }
    }

    /// Pushes all buffered operations into the base store as one batch and
    /// clears the overlay. Returns the number of operations persisted.
    pub fn persist(&self) -> Result<usize> {
        let ops = std::mem::take(&mut *self.overlay.write().expect("store lock poisoned"));
        let count = ops.len();
        let mut batch = self.base.batch();
        for (key, value) in ops {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        self.base.write_batch(batch)?;
        Ok(count)
    }
}

impl Store for MemCachedStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self
            .overlay
            .read()
            .expect("store lock poisoned")
            .get(key)
        {
            Some(Some(v)) => Ok(v.clone()),
            Some(None) => Err(Error::NotFound),
            None => self.base.get(key),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.overlay
            .write()
            .expect("store lock poisoned")
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.overlay
            .write()
            .expect("store lock poisoned")
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut overlay = self.overlay.write().expect("store lock poisoned");
        for (key, value) in batch.into_ops() {
            overlay.insert(key, value);
        }
        Ok(())
    }

    fn seek(&self, range: &SeekRange, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        for (k, v) in self.merged_range(range) {
            if !f(&k, &v) {
                break;
            }
        }
    }

    fn seek_gc(
        &self,
        range: &SeekRange,
        keep: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let doomed: Vec<Vec<u8>> = self
            .merged_range(range)
            .into_iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k)
            .collect();
        let removed = doomed.len();
        let mut overlay = self.overlay.write().expect("store lock poisoned");
        for k in doomed {
            overlay.insert(k, None);
        }
        Ok(removed)
    }
}

impl MemCachedStore {
    /// Collects the overlay-over-base merged view of a prefix range.
    fn merged_range(&self, range: &SeekRange) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        self.base.seek(range, &mut |k, v| {
            merged.insert(k.to_vec(), Some(v.to_vec()));
            true
        });
        {
            let overlay = self.overlay.read().expect("store lock poisoned");
            for (k, v) in overlay.range(prefix_bounds(&range.prefix)) {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }
}
