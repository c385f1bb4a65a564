// Voting flow orchestrator
// Linear pipeline: prepare -> [join] -> sync members -> prove -> submit.
// State lives in a watch channel so observers always see the step that is
// executing right now. One run per instance at a time; a second `start`
// while running is ignored.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::U256;
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::chain::{ChainClient, ChainError, TxHash};
use crate::identity::Identity;
use crate::members::{FetchError, GroupMembersFetcher};
use crate::prover::{ProofError, ProofGenerator, ProofRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VotingStep {
    Idle,
    Step1Prepare,
    Step2JoinGroup,
    Step3SyncMembers,
    Step4GenerateProof,
    Step5SubmitVote,
    /// Listed for progress display; confirmation happens in the background
    Step6Confirmation,
    Success,
    Failed,
}

impl VotingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingStep::Idle => "IDLE",
            VotingStep::Step1Prepare => "STEP1_PREPARE",
            VotingStep::Step2JoinGroup => "STEP2_JOIN_GROUP",
            VotingStep::Step3SyncMembers => "STEP3_SYNC_MEMBERS",
            VotingStep::Step4GenerateProof => "STEP4_GENERATE_PROOF",
            VotingStep::Step5SubmitVote => "STEP5_SUBMIT_VOTE",
            VotingStep::Step6Confirmation => "STEP6_CONFIRMATION",
            VotingStep::Success => "SUCCESS",
            VotingStep::Failed => "FAILED",
        }
    }
}

impl fmt::Display for VotingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
}

/// Failure category shown to the user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VotingErrorKind {
    UserRejected,
    InsufficientGas,
    ProposalExpired,
    NotJoined,
    ProofFailed,
    NetworkError,
    InvalidRequest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowMode {
    /// Join if needed, then prove and vote
    #[default]
    Full,
    /// Stop after joining; vote in a later run
    JoinOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Join,
    Vote,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKind::Join => f.write_str("join"),
            TxKind::Vote => f.write_str("vote"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TxHashes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<TxHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote: Option<TxHash>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SuccessTx {
    pub hash: TxHash,
    #[serde(rename = "type")]
    pub kind: TxKind,
}

/// Observable state of a [`VotingFlow`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub current_step: VotingStep,
    pub status: FlowStatus,
    pub requires_join: bool,
    pub mode: FlowMode,
    pub proposal_id: Option<u64>,
    pub error_type: Option<VotingErrorKind>,
    pub error_message: Option<String>,
    /// Steps of the current run, known before it starts executing
    pub active_steps: Vec<VotingStep>,
    pub tx_hashes: TxHashes,
    pub last_success_tx: Option<SuccessTx>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            current_step: VotingStep::Idle,
            status: FlowStatus::Idle,
            requires_join: false,
            mode: FlowMode::Full,
            proposal_id: None,
            error_type: None,
            error_message: None,
            active_steps: steps_for(true, FlowMode::Full),
            tx_hashes: TxHashes::default(),
            last_success_tx: None,
        }
    }
}

/// Steps a run will go through
pub fn steps_for(requires_join: bool, mode: FlowMode) -> Vec<VotingStep> {
    use VotingStep::*;

    match (requires_join, mode) {
        (true, FlowMode::Full) => vec![
            Step1Prepare,
            Step2JoinGroup,
            Step3SyncMembers,
            Step4GenerateProof,
            Step5SubmitVote,
            Step6Confirmation,
        ],
        (false, FlowMode::Full) => vec![
            Step1Prepare,
            Step3SyncMembers,
            Step4GenerateProof,
            Step5SubmitVote,
            Step6Confirmation,
        ],
        (true, FlowMode::JoinOnly) => vec![Step1Prepare, Step2JoinGroup],
        (false, FlowMode::JoinOnly) => vec![Step1Prepare],
    }
}

/// One vote intent
#[derive(Clone, Debug, Default)]
pub struct StartParams {
    pub requires_join: bool,
    pub proposal_id: u64,
    pub option_id: u64,
    /// Needed to prove; full runs fail without it
    pub identity: Option<Identity>,
    /// Commitment to join with; defaults to the identity's
    pub identity_commitment: Option<U256>,
    pub mode: FlowMode,
}

impl StartParams {
    fn commitment(&self) -> Option<U256> {
        self.identity_commitment
            .or_else(|| self.identity.as_ref().map(Identity::commitment))
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("an identity is required to generate a proof")]
    MissingIdentity,

    #[error("an identity commitment is required to join")]
    MissingCommitment,

    #[error("proposal {0} has ended")]
    ProposalClosed(u64),

    #[error("option {option_id} is not an option of proposal {proposal_id}")]
    InvalidOption { proposal_id: u64, option_id: u64 },

    #[error("generated proof failed the local sanity check")]
    MalformedProof,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Proof(#[from] ProofError),
}

impl FlowError {
    /// Category for the user, decided by variant
    ///
    /// Message text is only consulted for errors that arrive untyped from
    /// the node or wallet.
    pub fn kind(&self) -> VotingErrorKind {
        match self {
            FlowError::MissingIdentity
            | FlowError::MissingCommitment
            | FlowError::InvalidOption { .. } => VotingErrorKind::InvalidRequest,
            FlowError::ProposalClosed(_) => VotingErrorKind::ProposalExpired,
            FlowError::MalformedProof => VotingErrorKind::ProofFailed,
            FlowError::Chain(e) => chain_error_kind(e),
            FlowError::Fetch(_) => VotingErrorKind::NetworkError,
            FlowError::Proof(ProofError::NotAMember { .. }) => VotingErrorKind::NotJoined,
            FlowError::Proof(_) => VotingErrorKind::ProofFailed,
        }
    }
}

fn chain_error_kind(error: &ChainError) -> VotingErrorKind {
    match error {
        ChainError::UserRejected(_) => VotingErrorKind::UserRejected,
        ChainError::InsufficientFunds(_) | ChainError::OutOfGas(_) => VotingErrorKind::InsufficientGas,
        ChainError::NoSigner => VotingErrorKind::InvalidRequest,
        ChainError::Reverted { reason } => classify_message(reason),
        ChainError::Rpc { message, .. } => classify_message(message),
        ChainError::Transport(_) | ChainError::Decode(_) | ChainError::ReceiptTimeout { .. } => {
            VotingErrorKind::NetworkError
        }
    }
}

/// Best-effort category for free-form error text
pub fn classify_message(message: &str) -> VotingErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("user rejected") || lower.contains("user denied") {
        VotingErrorKind::UserRejected
    } else if lower.contains("insufficient") || lower.contains("gas") {
        VotingErrorKind::InsufficientGas
    } else if lower.contains("expired") || lower.contains("voting ended") {
        VotingErrorKind::ProposalExpired
    } else if lower.contains("proof") {
        VotingErrorKind::ProofFailed
    } else {
        VotingErrorKind::NetworkError
    }
}

struct FlowInner {
    chain: ChainClient,
    fetcher: GroupMembersFetcher,
    prover: ProofGenerator,
    state: watch::Sender<FlowState>,
}

/// Voting flow state machine
///
/// Clones are handles to the same instance.
#[derive(Clone)]
pub struct VotingFlow {
    inner: Arc<FlowInner>,
}

impl VotingFlow {
    pub fn new(chain: ChainClient, fetcher: GroupMembersFetcher, prover: ProofGenerator) -> Self {
        let (state, _) = watch::channel(FlowState::default());
        Self {
            inner: Arc::new(FlowInner {
                chain,
                fetcher,
                prover,
                state,
            }),
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> FlowState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.inner.state.subscribe()
    }

    /// Return to `IDLE`, clearing hashes and errors
    ///
    /// Refused while a run is in flight, since a step cannot be aborted.
    pub fn reset(&self) -> bool {
        let reset = self.inner.state.send_if_modified(|state| {
            if state.status == FlowStatus::Running {
                return false;
            }
            *state = FlowState::default();
            true
        });
        if !reset {
            warn!("voting flow is running, reset ignored");
        }
        reset
    }

    /// Run the pipeline for `params`
    ///
    /// Failures end in the `FAILED` state with a classified error type; they
    /// are not returned. Returns `false` without doing anything if a run is
    /// already in progress.
    ///
    /// The pipeline runs on its own task. Dropping the returned future stops
    /// the wait, not the run: the state still reaches `SUCCESS` or `FAILED`.
    pub async fn start(&self, params: StartParams) -> bool {
        let steps = steps_for(params.requires_join, params.mode);

        let claimed = self.inner.state.send_if_modified(|state| {
            if state.status == FlowStatus::Running {
                return false;
            }
            *state = FlowState {
                current_step: VotingStep::Step1Prepare,
                status: FlowStatus::Running,
                requires_join: params.requires_join,
                mode: params.mode,
                proposal_id: Some(params.proposal_id),
                active_steps: steps.clone(),
                ..FlowState::default()
            };
            true
        });
        if !claimed {
            debug!("voting flow already running, start ignored");
            return false;
        }

        info!(
            "voting flow started for proposal {} ({} steps)",
            params.proposal_id,
            steps.len()
        );

        let flow = self.clone();
        let run = tokio::spawn(async move {
            if let Err(e) = flow.run(&params).await {
                flow.fail(e.kind(), &e);
            }
        });
        if let Err(e) = run.await {
            self.fail(VotingErrorKind::NetworkError, &e);
        }
        true
    }

    fn fail(&self, kind: VotingErrorKind, error: &dyn fmt::Display) {
        error!("voting flow failed ({:?}): {}", kind, error);
        self.inner.state.send_modify(|state| {
            state.current_step = VotingStep::Failed;
            state.status = FlowStatus::Failed;
            state.error_type = Some(kind);
            state.error_message = Some(error.to_string());
        });
    }

    fn enter(&self, step: VotingStep) {
        info!("voting flow: {}", step);
        self.inner.state.send_modify(|state| state.current_step = step);
    }

    fn succeed(&self, last: Option<SuccessTx>) {
        info!("voting flow: {}", VotingStep::Success);
        self.inner.state.send_modify(|state| {
            if let Some(tx) = last {
                match tx.kind {
                    TxKind::Join => state.tx_hashes.join = Some(tx.hash),
                    TxKind::Vote => state.tx_hashes.vote = Some(tx.hash),
                }
            }
            state.current_step = VotingStep::Success;
            state.status = FlowStatus::Success;
            state.error_type = None;
            state.error_message = None;
            state.last_success_tx = last;
        });
    }

    async fn run(&self, params: &StartParams) -> Result<(), FlowError> {
        let StartParams {
            requires_join,
            proposal_id,
            option_id,
            mode,
            ..
        } = *params;
        let chain = &self.inner.chain;

        // STEP1_PREPARE: validate the intent before any transaction
        let commitment = params.commitment();
        if requires_join && commitment.is_none() {
            return Err(FlowError::MissingCommitment);
        }
        if mode == FlowMode::Full && params.identity.is_none() {
            return Err(FlowError::MissingIdentity);
        }

        let proposal = chain.fetch_proposal(proposal_id).await?;
        if !proposal.is_active {
            return Err(FlowError::ProposalClosed(proposal_id));
        }
        if mode == FlowMode::Full {
            let options = chain.fetch_options(proposal_id).await?;
            if !options.iter().any(|option| option.id == option_id) {
                return Err(FlowError::InvalidOption {
                    proposal_id,
                    option_id,
                });
            }
        }

        let mut join_tx = None;
        if let (true, Some(commitment)) = (requires_join, commitment) {
            self.enter(VotingStep::Step2JoinGroup);
            let tx_hash = chain.join_proposal(proposal_id, commitment).await?;
            self.inner
                .state
                .send_modify(|state| state.tx_hashes.join = Some(tx_hash));
            self.confirm_in_background(TxKind::Join, tx_hash);
            join_tx = Some(tx_hash);
        }

        let identity = match (mode, params.identity.as_ref()) {
            (FlowMode::JoinOnly, _) => {
                self.succeed(join_tx.map(|hash| SuccessTx {
                    hash,
                    kind: TxKind::Join,
                }));
                return Ok(());
            }
            (FlowMode::Full, Some(identity)) => identity,
            (FlowMode::Full, None) => return Err(FlowError::MissingIdentity),
        };

        // A join submitted moments ago may not be mined yet; then the sync
        // misses it and proving fails with NotJoined, which the user retries.
        self.enter(VotingStep::Step3SyncMembers);
        let members = self.inner.fetcher.fetch_group_members(proposal_id).await?;

        self.enter(VotingStep::Step4GenerateProof);
        let proof = self
            .inner
            .prover
            .generate_proof(ProofRequest {
                identity,
                group_members: &members,
                proposal_id,
                option_id,
            })
            .await?;
        if !proof.sanity_check() {
            return Err(FlowError::MalformedProof);
        }

        self.enter(VotingStep::Step5SubmitVote);
        let vote_tx = chain.submit_vote(proposal_id, option_id, &proof).await?;

        // Success means submitted; the receipt is only logged
        self.succeed(Some(SuccessTx {
            hash: vote_tx,
            kind: TxKind::Vote,
        }));
        self.confirm_in_background(TxKind::Vote, vote_tx);
        Ok(())
    }

    fn confirm_in_background(&self, kind: TxKind, tx_hash: TxHash) {
        let chain = self.inner.chain.clone();
        tokio::spawn(async move {
            match chain.wait_for_receipt(tx_hash).await {
                Ok(receipt) => info!(
                    "{} transaction {} confirmed in block {}",
                    kind, tx_hash, receipt.block_number
                ),
                Err(e) => warn!("{} transaction {} not confirmed: {}", kind, tx_hash, e),
            }
        });
    }
}
