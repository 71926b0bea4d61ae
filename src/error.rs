//! Crate-wide error type.
use thiserror::Error;

/// Error type shared by the trie, the store layer and the state-root module.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Key absent, node missing from the store or historical root unknown.
    #[error("item not found")]
    NotFound,
    /// Stored bytes failed to decode, or a fetched node does not hash to the
    /// key it was stored under.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// A restore path cannot be walked through the in-memory trie.
    #[error("restore path does not lead through the trie")]
    BadPath,
    /// The restore path ends on a node that is already materialized.
    #[error("node at restore path is not missing")]
    NotMissing,
    /// The delivered node does not hash to the placeholder it should fill.
    #[error("restored node hash does not match the placeholder")]
    HashMismatch,
    /// The on-disk reference-count flag disagrees with the requested mode.
    #[error("on-disk reference-count flag disagrees with requested trie mode")]
    ModeMismatch,
    /// `clean_storage` was invoked while the local height is non-zero.
    #[error("storage can only be cleaned at genesis, local height is {0}")]
    NotAtGenesis(u32),
    /// Wrong witness count, verifier refusal or insufficient gas.
    #[error("bad witness: {0}")]
    BadWitness(String),
    /// Batch or payload too large, empty or malformed.
    #[error("bad batch: {0}")]
    BadBatch(&'static str),
    /// A caller-supplied argument is out of the supported range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Internal sentinel signalling a halted traversal. Filtered out at the
    /// public API boundary and never returned to callers.
    #[error("stop condition met")]
    Stop,
}

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;
