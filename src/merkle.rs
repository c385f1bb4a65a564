// Membership Merkle tree (lean incremental construction)
// Leaves are identity commitments in on-chain insertion order. A node with
// no right sibling is carried up unchanged, so depth tracks the member count
// instead of being fixed in advance and the root matches the contract's tree
// for any group size.

use alloy_primitives::U256;
use ark_bn254::Fr;
use thiserror::Error;

use crate::poseidon_hash::{HashError, Hasher};
use crate::utils::{field_to_u256, u256_to_field, FieldError};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("member {index} is zero, which is not a valid commitment")]
    ZeroLeaf { index: usize },

    #[error("member {index} is malformed: {source}")]
    MalformedLeaf {
        index: usize,
        #[source]
        source: FieldError,
    },

    #[error("leaf index {index} out of range for tree of {size} members")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("invalid Merkle path: {siblings} siblings for depth {depth}")]
    InvalidPath { siblings: usize, depth: usize },

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Membership path handed to the prover
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub root: U256,
    pub leaf: U256,
    /// Position of the leaf among the members
    pub leaf_index: usize,
    /// Path bits for the levels that have a sibling, LSB = lowest level.
    /// Bit set means the running node is the right child.
    pub path_index: u64,
    pub siblings: Vec<U256>,
}

/// In-memory lean incremental Merkle tree
pub struct MembershipTree {
    hasher: Hasher,
    // levels[0] = leaves, levels[depth] = [root]
    levels: Vec<Vec<Fr>>,
}

impl MembershipTree {
    pub fn new() -> Result<Self, TreeError> {
        Ok(Self {
            hasher: Hasher::new()?,
            levels: vec![Vec::new()],
        })
    }

    /// Build a tree by inserting `members` in the given order
    ///
    /// The order is significant: the same set inserted in another order has
    /// a different root.
    pub fn from_members(members: &[U256]) -> Result<Self, TreeError> {
        let mut tree = Self::new()?;
        for (index, member) in members.iter().enumerate() {
            let leaf = validate_leaf(index, *member)?;
            tree.insert_field(leaf)?;
        }
        Ok(tree)
    }

    /// Append a commitment
    pub fn insert(&mut self, member: U256) -> Result<(), TreeError> {
        let leaf = validate_leaf(self.size(), member)?;
        self.insert_field(leaf)
    }

    fn insert_field(&mut self, leaf: Fr) -> Result<(), TreeError> {
        let mut index = self.levels[0].len();
        self.levels[0].push(leaf);

        let mut node = leaf;
        let mut level = 0;
        while self.levels[level].len() > 1 {
            let parent = if index & 1 == 1 {
                self.hasher.hash_pair(self.levels[level][index - 1], node)?
            } else {
                node
            };

            index >>= 1;
            level += 1;
            if self.levels.len() == level {
                self.levels.push(Vec::new());
            }
            if index < self.levels[level].len() {
                self.levels[level][index] = parent;
            } else {
                self.levels[level].push(parent);
            }
            node = parent;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Levels above the leaves; 0 for a single member
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Root of the current tree, `None` while empty
    pub fn root(&self) -> Option<U256> {
        self.levels
            .last()
            .and_then(|top| top.first())
            .map(|root| field_to_u256(*root))
    }

    /// First position of `member`, scanning in insertion order
    pub fn index_of(&self, member: U256) -> Option<usize> {
        let leaf = u256_to_field(member).ok()?;
        self.levels[0].iter().position(|l| *l == leaf)
    }

    pub fn contains(&self, member: U256) -> bool {
        self.index_of(member).is_some()
    }

    /// Membership path for the leaf at `leaf_index`
    pub fn proof(&self, leaf_index: usize) -> Result<MerkleProof, TreeError> {
        let size = self.size();
        if leaf_index >= size {
            return Err(TreeError::IndexOutOfRange {
                index: leaf_index,
                size,
            });
        }

        let mut siblings = Vec::new();
        let mut path_index = 0u64;
        let mut index = leaf_index;

        for level in 0..self.depth() {
            let is_right = index & 1 == 1;
            let sibling_index = if is_right { index - 1 } else { index + 1 };

            if let Some(sibling) = self.levels[level].get(sibling_index) {
                if is_right {
                    path_index |= 1 << siblings.len();
                }
                siblings.push(field_to_u256(*sibling));
            }
            index >>= 1;
        }

        Ok(MerkleProof {
            // Non-empty, checked above
            root: self.root().unwrap_or_default(),
            leaf: field_to_u256(self.levels[0][leaf_index]),
            leaf_index,
            path_index,
            siblings,
        })
    }
}

/// Validate a commitment before it becomes a leaf
///
/// Zero is reserved and values outside the field cannot be hashed without
/// reduction, which would silently change the member.
fn validate_leaf(index: usize, member: U256) -> Result<Fr, TreeError> {
    if member.is_zero() {
        return Err(TreeError::ZeroLeaf { index });
    }
    u256_to_field(member).map_err(|source| TreeError::MalformedLeaf { index, source })
}

/// Validate Merkle path inputs before recomputing a root
pub fn validate_merkle_inputs(path_len: usize, tree_depth: usize) -> Result<(), TreeError> {
    if path_len > tree_depth {
        return Err(TreeError::InvalidPath {
            siblings: path_len,
            depth: tree_depth,
        });
    }
    Ok(())
}

/// Recompute the root from a membership path and compare it to `proof.root`
pub fn verify_merkle_proof(proof: &MerkleProof, tree_depth: usize) -> Result<bool, TreeError> {
    validate_merkle_inputs(proof.siblings.len(), tree_depth)?;

    let mut hasher = Hasher::new()?;
    let mut node = validate_leaf(proof.leaf_index, proof.leaf)?;

    for (level, sibling) in proof.siblings.iter().enumerate() {
        let sibling = u256_to_field(*sibling).map_err(|source| TreeError::MalformedLeaf {
            index: proof.leaf_index,
            source,
        })?;
        node = if (proof.path_index >> level) & 1 == 1 {
            hasher.hash_pair(sibling, node)?
        } else {
            hasher.hash_pair(node, sibling)?
        };
    }

    Ok(field_to_u256(node) == proof.root)
}
