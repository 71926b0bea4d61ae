//! This module defines the constants that shape the on-disk key layout and
//! the hard size bounds of the trie.
use crate::types::GasAmount;

/// First byte of every key the module owns in the backing store.
pub const DATA_MPT: u8 = 0x03;
/// Second byte of a persisted state-root record key, followed by the
/// big-endian block height.
pub const PREFIX_STATE_ROOT: u8 = 0x01;
/// Second byte of the key holding the latest validated height
/// (little-endian `u32`).
pub const PREFIX_VALIDATED: u8 = 0x02;
/// Second byte of the key holding the reference-count mode flag.
pub const PREFIX_GC: u8 = 0x04;

/// Total length of a node record key: [`DATA_MPT`] plus the 32-byte node
/// hash. Auxiliary records under the same prefix are always shorter, which
/// is what range scans use to tell the two kinds apart.
pub const NODE_KEY_LENGTH: usize = 33;

/// Length of the reference-count metadata suffix appended to node records
/// when the trie runs in GC mode: a `u32` counter and a `u32`
/// last-active height, both little-endian.
pub const RC_METADATA_LENGTH: usize = 8;

/// Maximum accepted key length, in bytes. A key twice this long in nibbles
/// still fits comfortably in the extension-node counter.
pub const MAX_KEY_LENGTH: usize = 1024;
/// Maximum accepted value length, in bytes.
pub const MAX_VALUE_LENGTH: usize = 65_535;

/// Maximum number of serialized nodes a single state-sync payload may carry.
pub const MAX_BATCH_SIZE: usize = 128;

/// Gas allowance handed to the witness verifier for a single state root.
pub const MAX_VERIFICATION_GAS: GasAmount = 2_0000_0000;
