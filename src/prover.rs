// Membership + vote proof generation
// The proving system itself is a black box behind `ProvingBackend`; this
// module owns everything around it: tree construction, scope randomness,
// normalizing the backend's output and checking it is bound to our tree.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::U256;
use ark_bn254::Fr;
use async_trait::async_trait;
use log::{debug, info};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::identity::Identity;
use crate::merkle::MembershipTree;

/// Number of Groth16 proof words the verifier expects
pub const PROOF_POINTS: usize = 8;

/// Bits of per-vote randomness packed below the proposal id in the scope
pub const VOTE_NONCE_BITS: usize = 128;

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("invalid proof input: {0}")]
    InvalidInput(String),

    #[error("identity {commitment} is not a member of this proposal's group, join it first")]
    NotAMember { commitment: U256 },

    #[error("prover failed: {0}")]
    ProverFailure(String),

    #[error("secure randomness unavailable: {0}")]
    EnvironmentError(String),
}

/// Everything the vote transaction needs besides proposal and option ids
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundle {
    pub merkle_tree_depth: u64,
    pub merkle_tree_root: U256,
    pub nullifier: U256,
    /// The chosen option, in the clear
    pub message: U256,
    pub scope: U256,
    pub points: [U256; PROOF_POINTS],
}

impl ProofBundle {
    /// Cheap structural check before spending gas on a submission
    ///
    /// This is not verification; the contract verifies the proof itself.
    pub fn sanity_check(&self) -> bool {
        self.merkle_tree_depth > 0 && !self.merkle_tree_root.is_zero() && !self.nullifier.is_zero()
    }
}

/// Inputs handed to the proving backend
pub struct ProverInput {
    pub secret: Fr,
    pub commitment: U256,
    pub leaf_index: usize,
    /// Path bits for the levels that have a sibling (see [`crate::merkle::MerkleProof`])
    pub path_index: u64,
    pub siblings: Vec<U256>,
    pub root: U256,
    /// Circuit depth: path length, at least 1
    pub depth: u64,
    pub message: U256,
    pub scope: U256,
}

impl fmt::Debug for ProverInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProverInput")
            .field("commitment", &self.commitment)
            .field("leaf_index", &self.leaf_index)
            .field("depth", &self.depth)
            .field("root", &self.root)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Tree depth as reported by a prover
///
/// Provers disagree on how to encode it: a JSON number, a decimal or hex
/// string, `{"value": ..}` or an ethers-style `{"_hex": ..}`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DepthValue {
    Number(u64),
    Float(f64),
    Text(String),
    Hex {
        #[serde(rename = "_hex")]
        hex: String,
    },
    Wrapped {
        value: Box<DepthValue>,
    },
}

impl DepthValue {
    pub fn normalize(&self) -> Result<u64, ProofError> {
        let unparsable = || ProofError::ProverFailure(format!("unparsable merkleTreeDepth {:?}", self));

        match self {
            DepthValue::Number(n) => Ok(*n),
            DepthValue::Float(f) => {
                if f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64 {
                    Ok(*f as u64)
                } else {
                    Err(unparsable())
                }
            }
            DepthValue::Text(s) | DepthValue::Hex { hex: s } => {
                parse_u64(s).ok_or_else(unparsable)
            }
            DepthValue::Wrapped { value } => value.normalize(),
        }
    }
}

fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Backend output before normalization
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProof {
    pub merkle_tree_depth: DepthValue,
    #[serde(with = "wide")]
    pub merkle_tree_root: U256,
    #[serde(with = "wide")]
    pub nullifier: U256,
    #[serde(with = "wide::list")]
    pub points: Vec<U256>,
}

/// Narrow interface to the zero-knowledge prover
#[async_trait]
pub trait ProvingBackend: Send + Sync {
    async fn prove(&self, input: &ProverInput) -> Result<RawProof, ProofError>;
}

type BackendInit<B> = Box<dyn Fn() -> Result<B, ProofError> + Send + Sync>;

/// Initializes a backend on first use and shares it afterwards
///
/// A failed initialization is not cached; the next proof tries again.
pub struct LazyProver<B> {
    init: BackendInit<B>,
    backend: OnceCell<B>,
}

impl<B: ProvingBackend> LazyProver<B> {
    pub fn new(init: impl Fn() -> Result<B, ProofError> + Send + Sync + 'static) -> Self {
        Self {
            init: Box::new(init),
            backend: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.initialized()
    }
}

#[async_trait]
impl<B: ProvingBackend> ProvingBackend for LazyProver<B> {
    async fn prove(&self, input: &ProverInput) -> Result<RawProof, ProofError> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                debug!("initializing proving backend");
                (self.init)()
            })
            .await?;
        backend.prove(input).await
    }
}

/// Parameters of one proof
pub struct ProofRequest<'a> {
    pub identity: &'a Identity,
    /// Commitments in on-chain insertion order
    pub group_members: &'a [U256],
    pub proposal_id: u64,
    pub option_id: u64,
}

/// Pack the proposal id above a 128-bit vote nonce
pub fn build_scope(proposal_id: u64, nonce: u128) -> U256 {
    (U256::from(proposal_id) << VOTE_NONCE_BITS) | U256::from(nonce)
}

/// Proposal id carried in the high bits of a scope
pub fn scope_proposal_id(scope: U256) -> U256 {
    scope >> VOTE_NONCE_BITS
}

fn random_vote_nonce() -> Result<u128, ProofError> {
    let mut bytes = [0u8; VOTE_NONCE_BITS / 8];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| ProofError::EnvironmentError(e.to_string()))?;
    Ok(u128::from_be_bytes(bytes))
}

pub struct ProofGenerator {
    backend: Arc<dyn ProvingBackend>,
}

impl ProofGenerator {
    pub fn new(backend: Arc<dyn ProvingBackend>) -> Self {
        Self { backend }
    }

    /// Generate a vote proof
    ///
    /// # Arguments
    /// * `request` - Identity, the full member list in fetched order, and the vote
    ///
    /// # Returns
    /// A bundle whose root is the root of `group_members` and whose message is
    /// the option id.
    ///
    /// # Security
    /// Every call draws a fresh scope, so two proofs by one identity on one
    /// proposal carry unrelated nullifiers. Only voter/vote linkage is hidden;
    /// the option travels in the clear.
    pub async fn generate_proof(&self, request: ProofRequest<'_>) -> Result<ProofBundle, ProofError> {
        let ProofRequest {
            identity,
            group_members,
            proposal_id,
            option_id,
        } = request;

        if group_members.is_empty() {
            return Err(ProofError::InvalidInput(
                "group has no members, at least one must join first".to_string(),
            ));
        }

        let commitment = identity.commitment();
        if !group_members.contains(&commitment) {
            return Err(ProofError::NotAMember { commitment });
        }

        let tree = MembershipTree::from_members(group_members)
            .map_err(|e| ProofError::InvalidInput(e.to_string()))?;
        let leaf_index = tree
            .index_of(commitment)
            .ok_or(ProofError::NotAMember { commitment })?;
        let path = tree
            .proof(leaf_index)
            .map_err(|e| ProofError::InvalidInput(e.to_string()))?;

        let scope = build_scope(proposal_id, random_vote_nonce()?);
        let depth = path.siblings.len().max(1) as u64;
        let message = U256::from(option_id);

        debug!(
            "proving membership: {} members, depth {}, leaf {}",
            tree.size(),
            depth,
            leaf_index
        );

        let input = ProverInput {
            secret: identity.secret_scalar(),
            commitment,
            leaf_index,
            path_index: path.path_index,
            siblings: path.siblings,
            root: path.root,
            depth,
            message,
            scope,
        };
        let raw = self.backend.prove(&input).await?;

        let reported_depth = raw.merkle_tree_depth.normalize()?;
        if reported_depth != depth {
            return Err(ProofError::ProverFailure(format!(
                "prover reported depth {}, expected {}",
                reported_depth, depth
            )));
        }

        let point_count = raw.points.len();
        let points: [U256; PROOF_POINTS] = raw.points.try_into().map_err(|_| {
            ProofError::ProverFailure(format!(
                "expected {} proof points, got {}",
                PROOF_POINTS, point_count
            ))
        })?;

        if raw.merkle_tree_root != input.root {
            return Err(ProofError::ProverFailure(format!(
                "proof root {} does not match group root {}",
                raw.merkle_tree_root, input.root
            )));
        }

        info!(
            "generated proof for proposal {} (root {}, depth {})",
            proposal_id, input.root, depth
        );

        Ok(ProofBundle {
            merkle_tree_depth: depth,
            merkle_tree_root: input.root,
            nullifier: raw.nullifier,
            message,
            scope,
            points,
        })
    }
}

/// Serde helpers for prover JSON: wide integers as decimal strings
///
/// Deserialization also accepts 0x-hex strings and plain JSON numbers.
pub mod wide {
    use std::str::FromStr;

    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    fn from_repr<E: serde::de::Error>(repr: Repr) -> Result<U256, E> {
        match repr {
            Repr::Number(n) => Ok(U256::from(n)),
            Repr::Text(s) => U256::from_str(s.trim()).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        from_repr(Repr::deserialize(deserializer)?)
    }

    pub mod list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(values: &[U256], serializer: S) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(values.len()))?;
            for value in values {
                seq.serialize_element(&value.to_string())?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<U256>, D::Error> {
            Vec::<Repr>::deserialize(deserializer)?
                .into_iter()
                .map(from_repr)
                .collect()
        }
    }
}
