// Ethereum JSON-RPC implementation of `VotingContract` on the alloy provider
// Reads go through eth_call; writes are signed locally by the configured key
// and sent raw; member history comes from eth_getLogs filtered on the
// indexed proposal id.

use std::future::IntoFuture;
use std::time::Duration;

use alloy::network::{EthereumWallet, ReceiptResponse as _, TransactionBuilder};
use alloy::providers::{
    DynProvider, PendingTransactionBuilder, PendingTransactionError, Provider, ProviderBuilder,
    WatchTxError,
};
use alloy::rpc::types::{Filter, Log, TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{TransportError, TransportResult};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::timeout;

use crate::chain::{
    ChainError, MemberJoinedLog, ProposalInfo, ReceiptPolling, TxHash, TxReceipt, TxStatus,
    VoteOption, VoteSubmission, VotingContract,
};

/// Per-request transport timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// EIP-1193 "user rejected request"
const USER_REJECTED_CODE: i64 = 4001;

pub mod abi {
    alloy_sol_types::sol! {
        struct VoteOption {
            uint256 id;
            string name;
            uint256 voteCount;
        }

        function getProposalInfo(uint256 proposalId)
            external
            view
            returns (
                uint256 id,
                string title,
                uint256 groupId,
                uint256 optionCount,
                uint256 createdAt,
                bool isActive
            );

        function getOptions(uint256 proposalId) external view returns (VoteOption[] options);

        function joinProposal(uint256 proposalId, uint256 identityCommitment) external;

        function vote(
            uint256 proposalId,
            uint256 optionId,
            uint256 merkleTreeDepth,
            uint256 merkleTreeRoot,
            uint256 nullifier,
            uint256 message,
            uint256 scope,
            uint256[8] points
        ) external;

        event MemberJoined(
            uint256 indexed proposalId,
            uint256 indexed groupId,
            uint256 identityCommitment,
            address indexed member
        );
    }
}

pub struct RpcContract {
    provider: DynProvider,
    contract: Address,
    sender: Option<Address>,
}

impl RpcContract {
    /// # Arguments
    /// * `url` - JSON-RPC endpoint
    /// * `contract` - Voting contract address
    /// * `signer` - Key that signs join/vote transactions; reads work without one
    pub fn connect(
        url: &str,
        contract: Address,
        signer: Option<PrivateKeySigner>,
    ) -> Result<Self, ChainError> {
        let endpoint: reqwest::Url = url
            .parse()
            .map_err(|e| ChainError::Transport(format!("invalid rpc url {}: {}", url, e)))?;

        let sender = signer.as_ref().map(PrivateKeySigner::address);
        let provider = match signer {
            Some(signer) => ProviderBuilder::new()
                .wallet(EthereumWallet::from(signer))
                .connect_http(endpoint)
                .erased(),
            None => ProviderBuilder::new().connect_http(endpoint).erased(),
        };

        match sender {
            Some(address) => info!("transactions will be signed by {}", address),
            None => debug!("no signing key, read-only contract client"),
        }

        Ok(Self {
            provider,
            contract,
            sender,
        })
    }

    /// Address that signs transactions, if a key is configured
    pub fn sender(&self) -> Option<Address> {
        self.sender
    }

    async fn call<C: SolCall + Send>(&self, call: C) -> Result<C::Return, ChainError> {
        let request = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(call.abi_encode());
        let output: Bytes = bounded(C::SIGNATURE, self.provider.call(request)).await?;

        C::abi_decode_returns(&output)
            .map_err(|e| ChainError::Decode(format!("{}: {}", C::SIGNATURE, e)))
    }

    async fn send<C: SolCall + Send>(&self, call: C, gas_limit: u64) -> Result<TxHash, ChainError> {
        if self.sender.is_none() {
            return Err(ChainError::NoSigner);
        }
        let request = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(call.abi_encode())
            .with_gas_limit(gas_limit);

        let pending = bounded(C::SIGNATURE, self.provider.send_transaction(request)).await?;
        Ok(*pending.tx_hash())
    }

    fn member_filter(&self, proposal_id: u64, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(self.contract)
            .event_signature(abi::MemberJoined::SIGNATURE_HASH)
            .topic1(B256::from(U256::from(proposal_id)))
            .from_block(from_block)
            .to_block(to_block)
    }
}

/// Await one provider request under [`REQUEST_TIMEOUT`]
async fn bounded<F, T>(what: &str, request: F) -> Result<T, ChainError>
where
    F: IntoFuture<Output = TransportResult<T>>,
{
    debug!("rpc {}", what);
    match timeout(REQUEST_TIMEOUT, request).await {
        Ok(result) => result.map_err(classify_transport_error),
        Err(_) => Err(ChainError::Transport(format!(
            "{} timed out after {}s",
            what,
            REQUEST_TIMEOUT.as_secs()
        ))),
    }
}

#[async_trait]
impl VotingContract for RpcContract {
    async fn proposal_info(&self, proposal_id: u64) -> Result<ProposalInfo, ChainError> {
        let info = self
            .call(abi::getProposalInfoCall {
                proposalId: U256::from(proposal_id),
            })
            .await?;

        Ok(ProposalInfo {
            id: to_u64(info.id, "proposal id")?,
            title: info.title,
            group_id: info.groupId,
            option_count: to_u64(info.optionCount, "option count")?,
            created_at: to_u64(info.createdAt, "creation time")?,
            is_active: info.isActive,
        })
    }

    async fn options(&self, proposal_id: u64) -> Result<Vec<VoteOption>, ChainError> {
        let options = self
            .call(abi::getOptionsCall {
                proposalId: U256::from(proposal_id),
            })
            .await?;

        options
            .into_iter()
            .map(|option| {
                Ok(VoteOption {
                    id: to_u64(option.id, "option id")?,
                    name: option.name,
                    vote_count: option.voteCount,
                })
            })
            .collect()
    }

    async fn join_proposal(
        &self,
        proposal_id: u64,
        commitment: U256,
        gas_limit: u64,
    ) -> Result<TxHash, ChainError> {
        self.send(
            abi::joinProposalCall {
                proposalId: U256::from(proposal_id),
                identityCommitment: commitment,
            },
            gas_limit,
        )
        .await
    }

    async fn vote(&self, vote: &VoteSubmission, gas_limit: u64) -> Result<TxHash, ChainError> {
        self.send(
            abi::voteCall {
                proposalId: U256::from(vote.proposal_id),
                optionId: U256::from(vote.option_id),
                merkleTreeDepth: vote.merkle_tree_depth,
                merkleTreeRoot: vote.merkle_tree_root,
                nullifier: vote.nullifier,
                message: vote.message,
                scope: vote.scope,
                points: vote.points,
            },
            gas_limit,
        )
        .await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        let receipt = bounded(
            "eth_getTransactionReceipt",
            self.provider.get_transaction_receipt(tx_hash),
        )
        .await?;
        Ok(receipt.as_ref().map(to_receipt))
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        polling: ReceiptPolling,
    ) -> Result<TxReceipt, ChainError> {
        let receipt = PendingTransactionBuilder::new(self.provider.root().clone(), tx_hash)
            .with_timeout(Some(polling.timeout))
            .get_receipt()
            .await
            .map_err(|e| match e {
                PendingTransactionError::TxWatcher(WatchTxError::Timeout) => {
                    ChainError::ReceiptTimeout {
                        tx_hash,
                        waited_secs: polling.timeout.as_secs(),
                    }
                }
                PendingTransactionError::TransportError(e) => classify_transport_error(e),
                other => ChainError::Transport(other.to_string()),
            })?;
        Ok(to_receipt(&receipt))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        bounded("eth_blockNumber", self.provider.get_block_number()).await
    }

    async fn member_joined_logs(
        &self,
        proposal_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<MemberJoinedLog>, ChainError> {
        let filter = self.member_filter(proposal_id, from_block, to_block);
        let logs = bounded("eth_getLogs", self.provider.get_logs(&filter)).await?;

        let mut decoded = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed {
                continue;
            }
            match decode_member_joined(&log)? {
                Some(event) => decoded.push(event),
                None => warn!("skipping MemberJoined log without a block position"),
            }
        }
        Ok(decoded)
    }
}

fn to_receipt(receipt: &TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number.unwrap_or_default(),
        status: if receipt.status() {
            TxStatus::Success
        } else {
            TxStatus::Reverted
        },
        gas_used: receipt.gas_used,
    }
}

fn decode_member_joined(log: &Log) -> Result<Option<MemberJoinedLog>, ChainError> {
    let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index) else {
        return Ok(None);
    };

    let event = abi::MemberJoined::decode_log_data(&log.inner.data)
        .map_err(|e| ChainError::Decode(format!("MemberJoined log: {}", e)))?;

    Ok(Some(MemberJoinedLog {
        block_number,
        log_index,
        proposal_id: event.proposalId,
        group_id: event.groupId,
        commitment: event.identityCommitment,
        member: event.member,
    }))
}

fn to_u64(value: U256, what: &str) -> Result<u64, ChainError> {
    u64::try_from(value).map_err(|_| ChainError::Decode(format!("{} {} does not fit in u64", what, value)))
}

/// Tag a provider error
pub fn classify_transport_error(error: TransportError) -> ChainError {
    match error {
        TransportError::ErrorResp(payload) => {
            classify_rpc_error(payload.code, &payload.message, payload.as_revert_data())
        }
        TransportError::NullResp | TransportError::DeserError { .. } => {
            ChainError::Decode(error.to_string())
        }
        other => ChainError::Transport(other.to_string()),
    }
}

/// Tag a JSON-RPC error by its code and the node's wording
///
/// Nodes and wallets agree on little beyond code 4001, so the remaining tags
/// come from the message text.
pub fn classify_rpc_error(code: i64, message: &str, revert_data: Option<Bytes>) -> ChainError {
    if code == USER_REJECTED_CODE {
        return ChainError::UserRejected(message.to_string());
    }

    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") {
        ChainError::InsufficientFunds(message.to_string())
    } else if lower.contains("out of gas")
        || lower.contains("intrinsic gas too low")
        || lower.contains("gas required exceeds")
    {
        ChainError::OutOfGas(message.to_string())
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        let reason = revert_data
            .and_then(|bytes| alloy_sol_types::decode_revert_reason(&bytes))
            .unwrap_or_else(|| message.to_string());
        ChainError::Reverted { reason }
    } else {
        ChainError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}
