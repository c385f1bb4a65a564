// zkvote client - anonymous proposal voting with Semaphore-style membership proofs
// Identity, on-chain group sync, proof generation and the join/vote pipeline.
// The vote option is public; what stays hidden is which member cast it.

pub mod utils; // uint256 <-> BN254 scalar conversions
pub mod poseidon_hash; // circom-compatible Poseidon
pub mod merkle; // lean incremental membership tree
pub mod storage;
pub mod identity;
pub mod prover; // proof generation around a black-box backend
pub mod external_prover;
pub mod chain;
pub mod rpc; // JSON-RPC VotingContract
pub mod members;
pub mod flow; // voting state machine
pub mod config;

pub use chain::{ChainClient, ChainError, VotingContract};
pub use config::Config;
pub use flow::{FlowMode, FlowState, StartParams, VotingErrorKind, VotingFlow, VotingStep};
pub use identity::{Identity, IdentityStore};
pub use members::GroupMembersFetcher;
pub use prover::{ProofBundle, ProofGenerator, ProvingBackend};
