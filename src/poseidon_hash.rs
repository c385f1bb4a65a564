// Native Poseidon over the BN254 scalar field
// circom parameters (t = inputs + 1, alpha = 5, R_F = 8), the same
// instantiation the membership circuit and the on-chain verifier use

use ark_bn254::Fr;
use light_poseidon::{Poseidon, PoseidonError, PoseidonHasher};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("poseidon hash failed: {0}")]
pub struct HashError(#[from] PoseidonError);

/// Reusable hasher holding the round constants for 2-input Poseidon
///
/// Building the parameters is the expensive part of a hash, so tree
/// construction creates one `Hasher` and reuses it for every node.
pub struct Hasher {
    pair: Poseidon<Fr>,
}

impl Hasher {
    pub fn new() -> Result<Self, HashError> {
        Ok(Self {
            pair: Poseidon::<Fr>::new_circom(2)?,
        })
    }

    /// Hash two field elements for Merkle tree internal nodes
    ///
    /// Non-commutative: hash(a, b) != hash(b, a), which is what binds a
    /// sibling to its side of the path.
    pub fn hash_pair(&mut self, left: Fr, right: Fr) -> Result<Fr, HashError> {
        Ok(self.pair.hash(&[left, right])?)
    }
}

/// One-off pair hash; prefer a shared [`Hasher`] inside loops
pub fn hash_pair(left: Fr, right: Fr) -> Result<Fr, HashError> {
    Hasher::new()?.hash_pair(left, right)
}
