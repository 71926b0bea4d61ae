//! Per-height state roots and the module tracking them.
//!
//! A [`StateRoot`] records the trie hash computed at one block height,
//! optionally authenticated by a validator [`Witness`]. Records are
//! persisted with a deterministic little-endian codec under the key layout
//! of [`crate::constant`].
use crate::{
    error::{Error, Result},
    types::GasAmount,
};
use alloy_primitives::B256;
use bytes::Buf;
use serde::{Deserialize, Serialize};

pub mod module;
pub use module::{GcStats, Module};

/// Scripts authenticating a state root: the invocation script carries the
/// signatures, the verification script the multisig contract they satisfy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub invocation: Vec<u8>,
    pub verification: Vec<u8>,
}

/// The trie root computed at block `index`, plus any validator witness that
/// authenticates it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRoot {
    pub index: u32,
    pub root: B256,
    pub witness: Vec<Witness>,
}

/// Witness verification callback: checks `witness` against the account
/// identified by a 20-byte script hash over the signed `message`, within
/// `gas_limit`. Returns the gas actually consumed.
pub type VerifierFn =
    Box<dyn Fn(&[u8; 20], &[u8], &Witness, GasAmount) -> Result<GasAmount> + Send + Sync>;

/// Callback fired when the validator set for a height is updated.
pub type ValidatorsCallback = Box<dyn Fn(u32, &[Vec<u8>]) + Send + Sync>;

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(Error::Corruption("unexpected end of state root data".into()))
    } else {
        Ok(())
    }
}

impl StateRoot {
    /// The payload validators sign: everything but the witness itself.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(self.root.as_slice());
        out
    }

    /// Deterministic serialization used for persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signed_payload();
        out.push(self.witness.len() as u8);
        for witness in &self.witness {
            out.extend_from_slice(&(witness.invocation.len() as u32).to_le_bytes());
            out.extend_from_slice(&witness.invocation);
            out.extend_from_slice(&(witness.verification.len() as u32).to_le_bytes());
            out.extend_from_slice(&witness.verification);
        }
        out
    }

    /// Decodes a persisted record, rejecting malformed or trailing bytes.
    pub fn decode(data: &[u8]) -> Result<StateRoot> {
        let mut buf = data;
        need(&buf, 4 + 32 + 1)?;
        let index = buf.get_u32_le();
        let mut root = [0u8; 32];
        buf.copy_to_slice(&mut root);
        let count = buf.get_u8() as usize;
        let mut witness = Vec::with_capacity(count);
        for _ in 0..count {
            need(&buf, 4)?;
            let ilen = buf.get_u32_le() as usize;
            need(&buf, ilen)?;
            let invocation = buf.copy_to_bytes(ilen).to_vec();
            need(&buf, 4)?;
            let vlen = buf.get_u32_le() as usize;
            need(&buf, vlen)?;
            let verification = buf.copy_to_bytes(vlen).to_vec();
            witness.push(Witness {
                invocation,
                verification,
            });
        }
        if buf.has_remaining() {
            return Err(Error::Corruption("trailing bytes after state root".into()));
        }
        Ok(StateRoot {
            index,
            root: B256::from(root),
            witness,
        })
    }
}
