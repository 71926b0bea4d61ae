//! Cryptographic primitives used by the trie and the witness machinery:
//! node hashing, script hashing and ECDSA verification over the two curves
//! validators are allowed to sign with.
use crate::{
    error::{Error, Result},
    types::PublicKeyBytes,
};
use alloy_primitives::B256;
use k256::ecdsa::signature::Verifier;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> B256 {
    B256::from_slice(&Sha256::digest(data))
}

/// Double SHA-256 of `data`. This is the node-identity hash of the trie.
pub fn double_sha256(data: &[u8]) -> B256 {
    sha256(sha256(data).as_slice())
}

/// RIPEMD-160 of `data`.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

/// RIPEMD-160 over SHA-256, the standard script-hash construction.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(sha256(data).as_slice())
}

/// Elliptic curves supported for witness signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Curve {
    /// NIST P-256.
    Secp256r1,
    /// The Bitcoin/Ethereum curve.
    Secp256k1,
}

/// Verifies a raw 64-byte ECDSA signature over `message` (hashed with
/// SHA-256 internally) against a compressed SEC1 public key.
///
/// Any malformed input simply fails verification.
pub fn verify_ecdsa(curve: Curve, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match curve {
        Curve::Secp256r1 => {
            let Ok(key) = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key) else {
                return false;
            };
            let Ok(sig) = p256::ecdsa::Signature::from_slice(signature) else {
                return false;
            };
            key.verify(message, &sig).is_ok()
        }
        Curve::Secp256k1 => {
            let Ok(key) = k256::ecdsa::VerifyingKey::from_sec1_bytes(public_key) else {
                return false;
            };
            let Ok(sig) = k256::ecdsa::Signature::from_slice(signature) else {
                return false;
            };
            key.verify(message, &sig).is_ok()
        }
    }
}

const OP_PUSHBYTES33: u8 = 0x21;
// Small-integer opcodes: OP_PUSH_BASE + n pushes n for 1..=16.
const OP_PUSH_BASE: u8 = 0x50;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Number of signatures an `n`-validator multisig requires.
#[inline]
pub const fn multisig_threshold(n: usize) -> usize {
    2 * n / 3 + 1
}

/// Builds the canonical multisig verification script for a validator set.
///
/// Keys are sorted so the script (and therefore its hash) depends only on
/// the set, not on the order the consensus layer delivered it in. The
/// threshold is the byzantine majority of the set.
pub fn multisig_script(keys: &[PublicKeyBytes]) -> Result<Vec<u8>> {
    if keys.is_empty() || keys.len() > 16 {
        return Err(Error::InvalidArgument(
            "multisig key count must be between 1 and 16",
        ));
    }
    let mut sorted: Vec<&PublicKeyBytes> = keys.iter().collect();
    sorted.sort();

    let m = multisig_threshold(keys.len());
    let mut script = Vec::with_capacity(3 + keys.len() * 34);
    script.push(OP_PUSH_BASE + m as u8);
    for key in sorted {
        if key.len() != 33 {
            return Err(Error::InvalidArgument(
                "validator keys must be 33-byte compressed points",
            ));
        }
        script.push(OP_PUSHBYTES33);
        script.extend_from_slice(key);
    }
    script.push(OP_PUSH_BASE + keys.len() as u8);
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}
