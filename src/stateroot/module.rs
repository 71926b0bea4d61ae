//! Local processing of state roots: per-height records, the live trie,
//! witness verification, garbage collection and state-sync entry points.
use crate::{
    constant::{
        DATA_MPT, MAX_VERIFICATION_GAS, NODE_KEY_LENGTH, PREFIX_GC, PREFIX_STATE_ROOT,
        PREFIX_VALIDATED,
    },
    crypto::{hash160, multisig_script},
    error::{Error, Result},
    mem_store::MemCachedStore,
    stateroot::{StateRoot, ValidatorsCallback, VerifierFn, Witness},
    traits::{SeekRange, SharedStore, Store},
    trie::{
        batch::Batch,
        is_active_value, last_active_height,
        node::Node,
        trie::Trie,
    },
    types::{KeyValue, PublicKeyBytes, TrieMode},
};
use alloy_primitives::B256;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

fn state_root_key(height: u32) -> Vec<u8> {
    let mut key = vec![DATA_MPT, PREFIX_STATE_ROOT];
    key.extend_from_slice(&height.to_be_bytes());
    key
}

const VALIDATED_KEY: [u8; 2] = [DATA_MPT, PREFIX_VALIDATED];
const GC_FLAG_KEY: [u8; 2] = [DATA_MPT, PREFIX_GC];

/// Outcome of a garbage-collection sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Tombstones deleted by the sweep.
    pub removed: usize,
    /// Node records still alive after the sweep.
    pub stored: usize,
    /// Wall-clock duration of the sweep.
    pub elapsed: Duration,
}

/// The live local state: the mutable trie plus the root and height it
/// stands at. Swapped as one unit so readers never observe a torn triple.
struct LocalState {
    trie: Trie,
    root: B256,
    height: u32,
}

/// Entry of the validator key cache.
struct KeyCache {
    height: u32,
    keys: Vec<PublicKeyBytes>,
    script_hash: [u8; 20],
    #[allow(dead_code)]
    script: Vec<u8>,
}

/// The state-root module: tracks the locally computed trie per height,
/// persists and verifies state-root records, and serves reads over any
/// historical root.
pub struct Module {
    store: SharedStore,
    mode: TrieMode,
    /// Whether the chain embeds state roots in block headers, making every
    /// locally computed root implicitly validated.
    sr_in_header: bool,
    verifier: VerifierFn,

    local: RwLock<LocalState>,
    local_height: AtomicU32,
    validated_height: AtomicU32,

    keys: RwLock<Vec<KeyCache>>,
    validators_cb: RwLock<Option<ValidatorsCallback>>,
}

impl Module {
    /// Creates an uninitialized module; call [`Module::init`] before use.
    pub fn new(
        mode: TrieMode,
        state_root_in_header: bool,
        verifier: VerifierFn,
        store: SharedStore,
    ) -> Self {
        let trie = Trie::new(Node::Empty, mode, store.clone());
        Self {
            store,
            mode,
            sr_in_header: state_root_in_header,
            verifier,
            local: RwLock::new(LocalState {
                trie,
                root: B256::ZERO,
                height: 0,
            }),
            local_height: AtomicU32::new(0),
            validated_height: AtomicU32::new(0),
            keys: RwLock::new(Vec::new()),
            validators_cb: RwLock::new(None),
        }
    }

    /// Initializes the module at `height`: checks the persisted
    /// reference-count flag against the requested mode, loads the validated
    /// height marker and anchors the live trie at the stored root.
    pub fn init(&self, height: u32) -> Result<()> {
        match self.store.get(&GC_FLAG_KEY) {
            Ok(flag) => {
                if (flag.first().copied().unwrap_or(0) != 0) != self.mode.rc() {
                    return Err(Error::ModeMismatch);
                }
            }
            Err(Error::NotFound) => {
                self.store.put(&GC_FLAG_KEY, &[self.mode.rc() as u8])?;
            }
            Err(e) => return Err(e),
        }

        match self.store.get(&VALIDATED_KEY) {
            Ok(data) if data.len() >= 4 => {
                self.validated_height
                    .store(u32::from_le_bytes(data[..4].try_into().unwrap()), Ordering::SeqCst);
            }
            Ok(_) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let mut local = self.local.write().expect("module lock poisoned");
        if height == 0 {
            local.trie = Trie::new(Node::Empty, self.mode, self.store.clone());
            local.root = B256::ZERO;
            local.height = 0;
        } else {
            let sr = self.get_state_root(height)?;
            local.trie = Trie::new(Node::from_hash(sr.root), self.mode, self.store.clone());
            local.root = sr.root;
            local.height = sr.index;
        }
        self.local_height.store(local.height, Ordering::SeqCst);
        Ok(())
    }

    /// Hash of the most recent locally computed state root.
    pub fn current_local_state_root(&self) -> B256 {
        self.local.read().expect("module lock poisoned").root
    }

    /// Height of the most recent locally computed state root.
    pub fn current_local_height(&self) -> u32 {
        self.local_height.load(Ordering::SeqCst)
    }

    /// Highest height with a consensus-validated state root.
    pub fn current_validated_height(&self) -> u32 {
        self.validated_height.load(Ordering::SeqCst)
    }

    fn put_state_root(&self, store: &dyn Store, sr: &StateRoot) -> Result<()> {
        store.put(&state_root_key(sr.index), &sr.to_bytes())
    }

    /// Loads the persisted state root for `height`.
    pub fn get_state_root(&self, height: u32) -> Result<StateRoot> {
        let data = self.store.get(&state_root_key(height))?;
        StateRoot::decode(&data)
    }

    /// An ephemeral read-through trie anchored at `root`. The mode is kept
    /// as-is so GC-mode node records parse correctly; reference counts stay
    /// untouched because read tries are never flushed, and any writes land
    /// in a throwaway cache layer.
    fn read_trie(&self, root: B256) -> Trie {
        Trie::new(
            Node::from_hash(root),
            self.mode,
            Arc::new(MemCachedStore::new(self.store.clone())),
        )
    }

    /// Value under `key` in the state identified by `root`.
    pub fn get_state(&self, root: B256, key: &[u8]) -> Result<Vec<u8>> {
        self.read_trie(root).get(key)
    }

    /// Key/value pairs under `prefix` in the state identified by `root`,
    /// starting after `prefix || start`, capped at `max`.
    pub fn find_states(
        &self,
        root: B256,
        prefix: &[u8],
        start: Option<&[u8]>,
        max: usize,
    ) -> Result<Vec<KeyValue>> {
        self.read_trie(root).find(prefix, start, max)
    }

    /// Proof of `key` belonging to the state identified by `root`.
    pub fn get_state_proof(&self, root: B256, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.read_trie(root).get_proof(key)
    }

    /// Applies a block's batch against a scratch copy of the live trie,
    /// flushes it at `index` and records the resulting state root in
    /// `cache`. The module itself is not advanced; pair with
    /// [`Module::update_current_local`] once the block commits.
    pub fn add_batch(
        &self,
        index: u32,
        batch: Batch,
        cache: SharedStore,
    ) -> Result<(Trie, StateRoot)> {
        let mut trie = {
            let local = self.local.read().expect("module lock poisoned");
            local.trie.clone_with_store(cache.clone())
        };
        trie.put_batch(batch)?;
        trie.flush(index)?;
        let sr = StateRoot {
            index,
            root: trie.state_root(),
            witness: vec![],
        };
        self.put_state_root(cache.as_ref(), &sr)?;
        Ok((trie, sr))
    }

    /// Promotes the result of [`Module::add_batch`]: installs the trie and
    /// advances the local height atomically. When state roots travel in
    /// block headers the validated height advances too.
    pub fn update_current_local(&self, trie: Trie, sr: &StateRoot) {
        let mut local = self.local.write().expect("module lock poisoned");
        local.trie = trie;
        local.root = sr.root;
        local.height = sr.index;
        self.local_height.store(sr.index, Ordering::SeqCst);
        if self.sr_in_header {
            self.validated_height.store(sr.index, Ordering::SeqCst);
        }
    }

    /// Checks a foreign state root: its predecessor must be known, it must
    /// carry exactly one witness, and the witness must satisfy the
    /// validator multisig for its height within the gas allowance. Never
    /// mutates state.
    pub fn verify_state_root(&self, sr: &StateRoot) -> Result<()> {
        let prev_index = sr
            .index
            .checked_sub(1)
            .ok_or_else(|| Error::BadWitness("state root has no predecessor".into()))?;
        if self.get_state_root(prev_index).is_err() {
            return Err(Error::BadWitness("unknown previous state root".into()));
        }
        if sr.witness.len() != 1 {
            return Err(Error::BadWitness(format!(
                "expected exactly one witness, got {}",
                sr.witness.len()
            )));
        }
        self.verify_witness(sr, &sr.witness[0])
    }

    fn verify_witness(&self, sr: &StateRoot, witness: &Witness) -> Result<()> {
        let script_hash = self
            .key_cache_for(sr.index)
            .ok_or_else(|| Error::BadWitness("no validators known for height".into()))?;
        let gas_used = (self.verifier)(
            &script_hash,
            &sr.signed_payload(),
            witness,
            MAX_VERIFICATION_GAS,
        )
        .map_err(|e| Error::BadWitness(format!("verifier refused: {e}")))?;
        if gas_used > MAX_VERIFICATION_GAS {
            return Err(Error::BadWitness("verification gas exceeded".into()));
        }
        Ok(())
    }

    /// Ingests a consensus-validated state root: verifies its witness,
    /// persists it and advances the validated height. Roots at or below
    /// the current validated height are ignored.
    pub fn add_state_root(&self, sr: &StateRoot) -> Result<()> {
        self.verify_state_root(sr)?;
        let validated = self.validated_height.load(Ordering::SeqCst);
        if validated != 0 && sr.index <= validated {
            return Ok(());
        }
        self.put_state_root(self.store.as_ref(), sr)?;
        self.store.put(&VALIDATED_KEY, &sr.index.to_le_bytes())?;
        self.validated_height.store(sr.index, Ordering::SeqCst);
        debug!(index = sr.index, root = %sr.root, "validated state root");
        Ok(())
    }

    /// Bootstraps from a trusted state root without having its nodes yet:
    /// persists the record, advances both heights and installs a bare
    /// hash-rooted trie for state sync to fill in.
    pub fn jump_to_state(&self, sr: &StateRoot) -> Result<()> {
        self.put_state_root(self.store.as_ref(), sr)?;
        self.store.put(&VALIDATED_KEY, &sr.index.to_le_bytes())?;
        self.validated_height.store(sr.index, Ordering::SeqCst);

        let mut local = self.local.write().expect("module lock poisoned");
        local.trie = Trie::new(Node::from_hash(sr.root), self.mode, self.store.clone());
        local.root = sr.root;
        local.height = sr.index;
        self.local_height.store(sr.index, Ordering::SeqCst);
        info!(index = sr.index, root = %sr.root, "jumped to state");
        Ok(())
    }

    /// Walks the state identified by `root` depth-first, handing each
    /// serialized node to `f` until `stop` asks to halt.
    pub fn traverse<F, S>(&self, root: B256, f: &mut F, stop: &mut S) -> Result<()>
    where
        F: FnMut(&[u8]),
        S: FnMut(&[u8]) -> bool,
    {
        self.read_trie(root).traverse(f, stop)
    }

    /// Restores a delivered node into the live trie at `path` (nibbles) and
    /// persists it eagerly so subsequent descents can resolve it.
    pub fn restore_mpt_node(&self, path: &[u8], node: Node) -> Result<()> {
        let mut local = self.local.write().expect("module lock poisoned");
        local.trie.restore_hash_node(path, node)
    }

    /// Shrinks the live trie, replacing everything at `depth` and below
    /// with hash placeholders.
    pub fn collapse(&self, depth: usize) {
        let mut local = self.local.write().expect("module lock poisoned");
        local.trie.collapse(depth);
    }

    /// Sweeps tombstoned node records whose last-active height is at or
    /// below `horizon`. Requires GC mode.
    pub fn gc(&self, horizon: u32) -> Result<GcStats> {
        if !self.mode.gc() {
            return Err(Error::InvalidArgument(
                "garbage collection requires GC mode",
            ));
        }
        info!(horizon, "starting MPT garbage collection");
        let start = Instant::now();
        let mut stored = 0usize;
        let result = self.store.seek_gc(
            &SeekRange::with_prefix(vec![DATA_MPT]),
            &mut |key, value| {
                if key.len() != NODE_KEY_LENGTH {
                    return true;
                }
                if is_active_value(value) || last_active_height(value) > horizon {
                    stored += 1;
                    return true;
                }
                false
            },
        );
        let elapsed = start.elapsed();
        match result {
            Ok(removed) => {
                info!(removed, stored, ?elapsed, "finished MPT garbage collection");
                Ok(GcStats {
                    removed,
                    stored,
                    elapsed,
                })
            }
            Err(e) => {
                error!(?elapsed, %e, "failed to flush MPT GC changeset");
                Err(e)
            }
        }
    }

    /// Wipes all MPT data ahead of state sync. Only legal at genesis; the
    /// mode flag and the genesis state root (if any) are written back.
    pub fn clean_storage(&self) -> Result<()> {
        let height = self.local_height.load(Ordering::SeqCst);
        if height != 0 {
            return Err(Error::NotAtGenesis(height));
        }
        let mut batch = self.store.batch();
        self.store
            .seek(&SeekRange::with_prefix(vec![DATA_MPT]), &mut |key, _| {
                batch.delete(key.to_vec());
                true
            });
        self.store.write_batch(batch)?;
        self.store.put(&GC_FLAG_KEY, &[self.mode.rc() as u8])?;

        let root = self.current_local_state_root();
        if root != B256::ZERO {
            self.put_state_root(
                self.store.as_ref(),
                &StateRoot {
                    index: height,
                    root,
                    witness: vec![],
                },
            )?;
        }
        Ok(())
    }

    /// Registers the validator set effective from `height` and fires the
    /// update callback.
    pub fn update_state_validators(
        &self,
        height: u32,
        keys: Vec<PublicKeyBytes>,
    ) -> Result<()> {
        let script = multisig_script(&keys)?;
        let script_hash = hash160(&script);
        {
            let mut cache = self.keys.write().expect("module lock poisoned");
            let entry = KeyCache {
                height,
                keys: keys.clone(),
                script_hash,
                script,
            };
            match cache.binary_search_by_key(&height, |e| e.height) {
                Ok(i) => cache[i] = entry,
                Err(i) => cache.insert(i, entry),
            }
        }
        if let Some(cb) = self
            .validators_cb
            .read()
            .expect("module lock poisoned")
            .as_ref()
        {
            cb(height, &keys);
        }
        Ok(())
    }

    /// The validator keys effective at `height`, if any are cached.
    pub fn get_state_validators(&self, height: u32) -> Vec<PublicKeyBytes> {
        let cache = self.keys.read().expect("module lock poisoned");
        cache
            .iter()
            .rev()
            .find(|e| e.height <= height)
            .map(|e| e.keys.clone())
            .unwrap_or_default()
    }

    /// Installs the callback fired on validator-set updates.
    pub fn set_update_validators_callback(&self, cb: ValidatorsCallback) {
        *self.validators_cb.write().expect("module lock poisoned") = Some(cb);
    }

    /// Script hash of the validator set effective at `index`.
    fn key_cache_for(&self, index: u32) -> Option<[u8; 20]> {
        let cache = self.keys.read().expect("module lock poisoned");
        cache
            .iter()
            .rev()
            .find(|e| e.height <= index)
            .map(|e| e.script_hash)
    }
}
