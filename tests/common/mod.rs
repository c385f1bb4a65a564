// Shared test doubles: an in-memory voting contract and a native mock prover
// Both record which flow step was current when they were called, so tests
// can check that the flow announces a step before doing its work.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;

use zkvote_client::chain::{
    ChainClient, ChainError, MemberJoinedLog, ProposalInfo, TxHash, TxReceipt, TxStatus,
    VoteOption, VoteSubmission, VotingContract,
};
use zkvote_client::flow::{FlowState, VotingFlow, VotingStep};
use zkvote_client::identity::{commitment_of_secret, Identity};
use zkvote_client::members::{FetcherConfig, GroupMembersFetcher};
use zkvote_client::poseidon_hash::hash_pair;
use zkvote_client::prover::{
    DepthValue, ProofError, ProofGenerator, ProverInput, ProvingBackend, RawProof, PROOF_POINTS,
};
use zkvote_client::utils::{field_to_u256, u256_to_field};

pub const PROPOSAL_ID: u64 = 1;
pub const DEPLOYMENT_BLOCK: u64 = 100;

pub fn identity(seed: u8) -> Identity {
    Identity::from_private_key(&[seed; 32]).unwrap()
}

/// Call log entry: method name and the flow step current at call time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub method: &'static str,
    pub step: Option<VotingStep>,
}

#[derive(Default)]
struct Observer(Mutex<Option<watch::Receiver<FlowState>>>);

impl Observer {
    fn attach(&self, receiver: watch::Receiver<FlowState>) {
        *self.0.lock().unwrap() = Some(receiver);
    }

    fn step(&self) -> Option<VotingStep> {
        self.0
            .lock()
            .unwrap()
            .as_ref()
            .map(|rx| rx.borrow().current_step)
    }
}

pub struct MockContract {
    pub proposal: Mutex<ProposalInfo>,
    pub options: Mutex<Vec<VoteOption>>,
    pub logs: Mutex<Vec<MemberJoinedLog>>,
    pub head: AtomicU64,
    /// Joins show up as MemberJoined logs right away
    pub join_mines_immediately: bool,
    /// Errors returned by upcoming log queries, front first
    pub log_failures: Mutex<VecDeque<ChainError>>,
    pub join_error: Mutex<Option<ChainError>>,
    pub vote_error: Mutex<Option<ChainError>>,
    pub vote_delay: Duration,
    /// Outcome of mined transactions; `None` keeps every receipt pending
    pub receipt_status: Option<TxStatus>,
    pub receipt_queries: AtomicUsize,
    pub calls: Mutex<Vec<Call>>,
    pub windows: Mutex<Vec<(u64, u64)>>,
    pub votes: Mutex<Vec<VoteSubmission>>,
    tx_counter: AtomicU64,
    observer: Observer,
}

impl MockContract {
    pub fn new() -> Self {
        Self {
            proposal: Mutex::new(ProposalInfo {
                id: PROPOSAL_ID,
                title: "Adopt the new charter".to_string(),
                group_id: U256::from(10u64),
                option_count: 3,
                created_at: 1_700_000_000,
                is_active: true,
            }),
            options: Mutex::new(
                (0..3)
                    .map(|id| VoteOption {
                        id,
                        name: format!("option {}", id),
                        vote_count: U256::ZERO,
                    })
                    .collect(),
            ),
            logs: Mutex::new(Vec::new()),
            head: AtomicU64::new(DEPLOYMENT_BLOCK + 10),
            join_mines_immediately: true,
            log_failures: Mutex::new(VecDeque::new()),
            join_error: Mutex::new(None),
            vote_error: Mutex::new(None),
            vote_delay: Duration::ZERO,
            receipt_status: Some(TxStatus::Success),
            receipt_queries: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
            votes: Mutex::new(Vec::new()),
            tx_counter: AtomicU64::new(0),
            observer: Observer::default(),
        }
    }

    pub fn with_members(self, members: &[U256]) -> Self {
        for (i, member) in members.iter().enumerate() {
            self.add_member(PROPOSAL_ID, *member, DEPLOYMENT_BLOCK + i as u64, 0);
        }
        self
    }

    pub fn add_member(&self, proposal_id: u64, commitment: U256, block_number: u64, log_index: u64) {
        self.logs.lock().unwrap().push(MemberJoinedLog {
            block_number,
            log_index,
            proposal_id: U256::from(proposal_id),
            group_id: U256::from(10u64),
            commitment,
            member: Address::repeat_byte(0x42),
        });
        self.head.fetch_max(block_number, Ordering::SeqCst);
    }

    pub fn observe(&self, receiver: watch::Receiver<FlowState>) {
        self.observer.attach(receiver);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn method_calls(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }

    fn record(&self, method: &'static str) {
        let step = self.observer.step();
        self.calls.lock().unwrap().push(Call { method, step });
    }

    fn next_tx(&self) -> TxHash {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        B256::from(U256::from(n))
    }
}

#[async_trait]
impl VotingContract for MockContract {
    async fn proposal_info(&self, _proposal_id: u64) -> Result<ProposalInfo, ChainError> {
        self.record("proposal_info");
        Ok(self.proposal.lock().unwrap().clone())
    }

    async fn options(&self, _proposal_id: u64) -> Result<Vec<VoteOption>, ChainError> {
        self.record("options");
        Ok(self.options.lock().unwrap().clone())
    }

    async fn join_proposal(
        &self,
        proposal_id: u64,
        commitment: U256,
        _gas_limit: u64,
    ) -> Result<TxHash, ChainError> {
        self.record("join_proposal");
        if let Some(error) = self.join_error.lock().unwrap().take() {
            return Err(error);
        }
        if self.join_mines_immediately {
            let block = self.head.load(Ordering::SeqCst) + 1;
            self.add_member(proposal_id, commitment, block, 0);
        }
        Ok(self.next_tx())
    }

    async fn vote(&self, vote: &VoteSubmission, _gas_limit: u64) -> Result<TxHash, ChainError> {
        self.record("vote");
        if !self.vote_delay.is_zero() {
            sleep(self.vote_delay).await;
        }
        if let Some(error) = self.vote_error.lock().unwrap().take() {
            return Err(error);
        }
        self.votes.lock().unwrap().push(vote.clone());
        Ok(self.next_tx())
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        self.receipt_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.receipt_status.map(|status| TxReceipt {
            tx_hash,
            block_number: self.head.load(Ordering::SeqCst),
            status,
            gas_used: 100_000,
        }))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.record("block_number");
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn member_joined_logs(
        &self,
        proposal_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<MemberJoinedLog>, ChainError> {
        self.record("member_joined_logs");
        self.windows.lock().unwrap().push((from_block, to_block));
        if let Some(error) = self.log_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let wanted = U256::from(proposal_id);
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.proposal_id == wanted)
            .filter(|log| (from_block..=to_block).contains(&log.block_number))
            .cloned()
            .collect())
    }
}

/// Prover that checks the leaf and computes the nullifier natively, like the
/// membership circuit, and fakes the points
pub struct MockProver {
    pub delay: Duration,
    pub tamper_root: bool,
    pub point_count: usize,
    pub depth: fn(u64) -> DepthValue,
    pub calls: AtomicUsize,
    pub steps: Mutex<Vec<Option<VotingStep>>>,
    observer: Observer,
}

impl MockProver {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            tamper_root: false,
            point_count: PROOF_POINTS,
            depth: DepthValue::Number,
            calls: AtomicUsize::new(0),
            steps: Mutex::new(Vec::new()),
            observer: Observer::default(),
        }
    }

    pub fn observe(&self, receiver: watch::Receiver<FlowState>) {
        self.observer.attach(receiver);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvingBackend for MockProver {
    async fn prove(&self, input: &ProverInput) -> Result<RawProof, ProofError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.steps.lock().unwrap().push(self.observer.step());
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let leaf = commitment_of_secret(input.secret).map_err(|e| ProofError::ProverFailure(e.to_string()))?;
        if leaf != input.commitment {
            return Err(ProofError::ProverFailure(format!(
                "secret opens leaf {}, not commitment {}",
                leaf, input.commitment
            )));
        }

        let scope = u256_to_field(input.scope).map_err(|e| ProofError::ProverFailure(e.to_string()))?;
        let nullifier =
            hash_pair(scope, input.secret).map_err(|e| ProofError::ProverFailure(e.to_string()))?;
        let root = if self.tamper_root {
            input.root + U256::from(1u64)
        } else {
            input.root
        };

        Ok(RawProof {
            merkle_tree_depth: (self.depth)(input.depth),
            merkle_tree_root: root,
            nullifier: field_to_u256(nullifier),
            points: (1..=self.point_count as u64).map(U256::from).collect(),
        })
    }
}

pub fn fetcher_config() -> FetcherConfig {
    FetcherConfig {
        deployment_block: DEPLOYMENT_BLOCK,
        max_block_range: 50,
        window_delay: Duration::from_millis(100),
        max_attempts: 3,
        retry_backoff: Duration::from_millis(1000),
    }
}

pub struct Harness {
    pub contract: Arc<MockContract>,
    pub prover: Arc<MockProver>,
    pub flow: VotingFlow,
}

pub fn harness(contract: MockContract, prover: MockProver) -> Harness {
    let contract = Arc::new(contract);
    let prover = Arc::new(prover);

    let flow = VotingFlow::new(
        ChainClient::new(contract.clone()),
        GroupMembersFetcher::new(contract.clone(), fetcher_config()),
        ProofGenerator::new(prover.clone()),
    );
    contract.observe(flow.subscribe());
    prover.observe(flow.subscribe());

    Harness {
        contract,
        prover,
        flow,
    }
}
