//! Typed boundary to the voting contract
//!
//! [`VotingContract`] is the raw contract surface (one method per ABI entry
//! plus the few node queries the client needs). [`ChainClient`] layers the
//! client policy on top: fixed gas ceilings for writes and bounded receipt
//! waits. Reads and writes are never retried here; a failure comes back
//! as a tagged [`ChainError`] for the caller to classify.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::prover::{ProofBundle, PROOF_POINTS};

pub type TxHash = B256;

/// Gas ceiling for `joinProposal` (Merkle insertion)
pub const JOIN_GAS_LIMIT: u64 = 500_000;

/// Gas ceiling for `vote` (on-chain proof verification)
pub const VOTE_GAS_LIMIT: u64 = 800_000;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("request rejected by the user: {0}")]
    UserRejected(String),

    #[error("insufficient funds for gas: {0}")]
    InsufficientFunds(String),

    #[error("out of gas: {0}")]
    OutOfGas(String),

    #[error("execution reverted: {reason}")]
    Reverted { reason: String },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode chain response: {0}")]
    Decode(String),

    #[error("no signing key configured for transactions")]
    NoSigner,

    #[error("transaction {tx_hash} not mined after {waited_secs}s")]
    ReceiptTimeout { tx_hash: TxHash, waited_secs: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalInfo {
    pub id: u64,
    pub title: String,
    pub group_id: U256,
    pub option_count: u64,
    /// Unix seconds
    pub created_at: u64,
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOption {
    pub id: u64,
    pub name: String,
    pub vote_count: U256,
}

/// One decoded `MemberJoined` event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberJoinedLog {
    pub block_number: u64,
    pub log_index: u64,
    pub proposal_id: U256,
    pub group_id: U256,
    pub commitment: U256,
    pub member: Address,
}

/// Arguments of the contract's `vote` call
///
/// Every proof word stays a `U256` all the way to the ABI encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteSubmission {
    pub proposal_id: u64,
    pub option_id: u64,
    pub merkle_tree_depth: U256,
    pub merkle_tree_root: U256,
    pub nullifier: U256,
    pub message: U256,
    pub scope: U256,
    pub points: [U256; PROOF_POINTS],
}

impl VoteSubmission {
    pub fn new(proposal_id: u64, option_id: u64, proof: &ProofBundle) -> Self {
        Self {
            proposal_id,
            option_id,
            merkle_tree_depth: U256::from(proof.merkle_tree_depth),
            merkle_tree_root: proof.merkle_tree_root,
            nullifier: proof.nullifier,
            message: proof.message,
            scope: proof.scope,
            points: proof.points,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Reverted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub status: TxStatus,
    pub gas_used: u64,
}

/// Raw contract and node surface
#[async_trait]
pub trait VotingContract: Send + Sync {
    async fn proposal_info(&self, proposal_id: u64) -> Result<ProposalInfo, ChainError>;

    async fn options(&self, proposal_id: u64) -> Result<Vec<VoteOption>, ChainError>;

    /// Submit `joinProposal`; returns once the node accepted the transaction
    async fn join_proposal(
        &self,
        proposal_id: u64,
        commitment: U256,
        gas_limit: u64,
    ) -> Result<TxHash, ChainError>;

    /// Submit `vote`; returns once the node accepted the transaction
    async fn vote(&self, vote: &VoteSubmission, gas_limit: u64) -> Result<TxHash, ChainError>;

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError>;

    /// Wait until `tx_hash` is mined, whatever its status
    ///
    /// Defaults to [`poll_receipt`].
    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        polling: ReceiptPolling,
    ) -> Result<TxReceipt, ChainError> {
        poll_receipt(self, tx_hash, polling).await
    }

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// `MemberJoined` events for `proposal_id` in the inclusive block range
    async fn member_joined_logs(
        &self,
        proposal_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<MemberJoinedLog>, ChainError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasLimits {
    pub join: u64,
    pub vote: u64,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            join: JOIN_GAS_LIMIT,
            vote: VOTE_GAS_LIMIT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiptPolling {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Voting contract client
///
/// Cheap to clone; clones share the underlying contract connection.
#[derive(Clone)]
pub struct ChainClient {
    contract: Arc<dyn VotingContract>,
    gas: GasLimits,
    polling: ReceiptPolling,
}

impl ChainClient {
    pub fn new(contract: Arc<dyn VotingContract>) -> Self {
        Self {
            contract,
            gas: GasLimits::default(),
            polling: ReceiptPolling::default(),
        }
    }

    pub fn with_gas_limits(mut self, gas: GasLimits) -> Self {
        self.gas = gas;
        self
    }

    pub fn with_receipt_polling(mut self, polling: ReceiptPolling) -> Self {
        self.polling = polling;
        self
    }

    pub fn contract(&self) -> &Arc<dyn VotingContract> {
        &self.contract
    }

    pub async fn fetch_proposal(&self, proposal_id: u64) -> Result<ProposalInfo, ChainError> {
        self.contract.proposal_info(proposal_id).await
    }

    pub async fn fetch_options(&self, proposal_id: u64) -> Result<Vec<VoteOption>, ChainError> {
        self.contract.options(proposal_id).await
    }

    /// Register `commitment` in the proposal's group
    ///
    /// Does not wait for the transaction to be mined.
    pub async fn join_proposal(&self, proposal_id: u64, commitment: U256) -> Result<TxHash, ChainError> {
        let tx_hash = self
            .contract
            .join_proposal(proposal_id, commitment, self.gas.join)
            .await?;
        info!("join transaction {} submitted for proposal {}", tx_hash, proposal_id);
        Ok(tx_hash)
    }

    /// Submit a vote carrying `proof`
    ///
    /// Does not wait for the transaction to be mined.
    pub async fn submit_vote(
        &self,
        proposal_id: u64,
        option_id: u64,
        proof: &ProofBundle,
    ) -> Result<TxHash, ChainError> {
        let submission = VoteSubmission::new(proposal_id, option_id, proof);
        let tx_hash = self.contract.vote(&submission, self.gas.vote).await?;
        info!("vote transaction {} submitted for proposal {}", tx_hash, proposal_id);
        Ok(tx_hash)
    }

    /// Wait until `tx_hash` is mined
    ///
    /// A mined but reverted transaction is an error.
    pub async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError> {
        let receipt = self.contract.wait_for_receipt(tx_hash, self.polling).await?;
        match receipt.status {
            TxStatus::Success => Ok(receipt),
            TxStatus::Reverted => Err(ChainError::Reverted {
                reason: format!(
                    "transaction {} reverted in block {}",
                    tx_hash, receipt.block_number
                ),
            }),
        }
    }
}

/// Poll [`VotingContract::transaction_receipt`] until a receipt shows up
///
/// Query errors are logged and polling continues until the timeout.
pub async fn poll_receipt<C: VotingContract + ?Sized>(
    contract: &C,
    tx_hash: TxHash,
    polling: ReceiptPolling,
) -> Result<TxReceipt, ChainError> {
    let started = Instant::now();

    loop {
        match contract.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => return Ok(receipt),
            Ok(None) => debug!("transaction {} still pending", tx_hash),
            Err(e) => warn!("receipt query for {} failed: {}", tx_hash, e),
        }

        if started.elapsed() >= polling.timeout {
            return Err(ChainError::ReceiptTimeout {
                tx_hash,
                waited_secs: polling.timeout.as_secs(),
            });
        }
        sleep(polling.interval).await;
    }
}
