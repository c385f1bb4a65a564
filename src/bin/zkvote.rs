use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::Address;
use ark_bn254::Fr;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;

use zkvote_client::chain::{ChainClient, VotingContract};
use zkvote_client::config::{Config, ENV_PRIVATE_KEY};
use zkvote_client::external_prover::ExternalProver;
use zkvote_client::flow::{FlowMode, FlowState, FlowStatus, StartParams, VotingFlow};
use zkvote_client::identity::{Identity, IdentityStore};
use zkvote_client::members::GroupMembersFetcher;
use zkvote_client::merkle::{verify_merkle_proof, MembershipTree};
use zkvote_client::prover::{LazyProver, ProofGenerator};
use zkvote_client::rpc::RpcContract;
use zkvote_client::storage::FileStore;
use zkvote_client::utils::field_to_u256;

/// Anonymous proposal voting client
#[derive(Parser, Debug)]
#[command(name = "zkvote", version)]
struct Args {
    /// JSON config file (defaults apply to missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the local voter identity
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Show a proposal, its options and member count
    Proposal { id: u64 },
    /// List member commitments of a proposal in insertion order
    Members { id: u64 },
    /// Check whether the local identity has joined a proposal
    Check { id: u64 },
    /// Join a proposal's group now and vote later
    Join {
        id: u64,
        /// Wait for the join transaction to be mined
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Cast an anonymous vote
    ///
    /// Every vote draws a fresh scope, so two votes by one identity cannot be
    /// linked to each other. Whether a second vote counts is up to the contract.
    Vote {
        id: u64,
        option: u64,
        /// Join the group first in the same run
        #[arg(long, default_value_t = false)]
        join: bool,
        /// Wait for the vote transaction to be mined
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Local self-test of identity and tree construction, plus RPC reachability
    Doctor,
}

#[derive(Subcommand, Debug)]
enum IdentityAction {
    /// Print the commitment, creating an identity if none exists
    Show,
    /// Replace the identity with a fresh one
    New,
    /// Print the private key backup string
    Export,
    /// Restore an identity from a backup string
    Import { private_key: String },
    /// Delete the identity; past votes stay unlinkable to any new one
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    match args.command {
        Command::Identity { action } => identity_command(&config, action),
        Command::Proposal { id } => proposal_command(&config, id).await,
        Command::Members { id } => {
            let members = fetcher(&config, contract(&config)?)
                .fetch_group_members(id)
                .await
                .context("fetching group members")?;
            for (index, member) in members.iter().enumerate() {
                println!("{:>4}  {}", index, member);
            }
            Ok(())
        }
        Command::Check { id } => {
            let store = identity_store(&config);
            let Some(commitment) = store.commitment() else {
                bail!("no local identity; run `zkvote identity show` to create one");
            };
            let joined = fetcher(&config, contract(&config)?)
                .check_membership(id, commitment)
                .await;
            println!("{}", if joined { "joined" } else { "not joined" });
            Ok(())
        }
        Command::Join { id, wait } => {
            let mut store = identity_store(&config);
            let commitment = store.ensure_identity().context("creating identity")?;
            let params = StartParams {
                requires_join: true,
                proposal_id: id,
                identity_commitment: Some(commitment),
                mode: FlowMode::JoinOnly,
                ..StartParams::default()
            };
            run_flow(&config, params, wait).await
        }
        Command::Vote {
            id,
            option,
            join,
            wait,
        } => {
            let mut store = identity_store(&config);
            store.ensure_identity().context("creating identity")?;
            let identity = store.identity().cloned();
            let params = StartParams {
                requires_join: join,
                proposal_id: id,
                option_id: option,
                identity,
                mode: FlowMode::Full,
                ..StartParams::default()
            };
            run_flow(&config, params, wait).await
        }
        Command::Doctor => doctor(&config).await,
    }
}

fn identity_store(config: &Config) -> IdentityStore {
    IdentityStore::load(Arc::new(FileStore::new(&config.identity_dir)))
}

fn rpc_contract(config: &Config) -> Result<RpcContract> {
    let signer = Config::signer().context("reading signing key")?;
    RpcContract::connect(&config.rpc_url, config.contract_address, signer)
        .context("creating RPC client")
}

fn contract(config: &Config) -> Result<Arc<dyn VotingContract>> {
    Ok(Arc::new(rpc_contract(config)?))
}

fn fetcher(config: &Config, contract: Arc<dyn VotingContract>) -> GroupMembersFetcher {
    GroupMembersFetcher::new(contract, config.fetcher_config())
}

fn chain_client(config: &Config, contract: Arc<dyn VotingContract>) -> ChainClient {
    ChainClient::new(contract)
        .with_gas_limits(config.gas_limits())
        .with_receipt_polling(config.receipt_polling())
}

fn identity_command(config: &Config, action: IdentityAction) -> Result<()> {
    let mut store = identity_store(config);

    match action {
        IdentityAction::Show => {
            let commitment = store.ensure_identity()?;
            println!("commitment: {}", commitment);
            if let Some(created_at) = store.created_at() {
                println!("created:    {}", created_at.to_rfc3339());
            }
        }
        IdentityAction::New => {
            if store.has_identity() {
                eprintln!("replacing the current identity; votes cast with it can no longer be linked to you");
            }
            println!("commitment: {}", store.generate_identity()?);
        }
        IdentityAction::Export => {
            let exported = store.export_identity()?;
            println!("{}", serde_json::to_string_pretty(&exported)?);
        }
        IdentityAction::Import { private_key } => {
            let commitment = store
                .import_identity(&private_key)
                .context("importing identity")?;
            println!("commitment: {}", commitment);
        }
        IdentityAction::Clear => {
            store.clear_identity();
            println!("identity cleared");
        }
    }
    Ok(())
}

async fn proposal_command(config: &Config, id: u64) -> Result<()> {
    let contract = contract(config)?;
    let chain = chain_client(config, contract.clone());

    let info = chain.fetch_proposal(id).await.context("reading proposal")?;
    let options = chain.fetch_options(id).await.context("reading options")?;
    let members = fetcher(config, contract).member_count(id).await;

    println!("#{} {}", info.id, info.title);
    println!("  status:  {}", if info.is_active { "active" } else { "ended" });
    println!("  group:   {}", info.group_id);
    println!("  members: {}", members);
    for option in options {
        println!("  [{}] {} ({} votes)", option.id, option.name, option.vote_count);
    }
    Ok(())
}

async fn run_flow(config: &Config, params: StartParams, wait: bool) -> Result<()> {
    let contract = contract(config)?;
    let chain = chain_client(config, contract.clone());

    let settings = config.prover.clone();
    let backend = LazyProver::new(move || {
        ExternalProver::new(
            settings.program.clone(),
            settings.args.clone(),
            settings.wasm_path.clone(),
            settings.zkey_path.clone(),
        )
    });

    let flow = VotingFlow::new(
        chain.clone(),
        fetcher(config, contract),
        ProofGenerator::new(Arc::new(backend)),
    );
    flow.start(params).await;

    let state = flow.state();
    report(config, &state);

    if state.status != FlowStatus::Success {
        bail!(
            "voting flow failed ({:?}): {}",
            state.error_type,
            state.error_message.unwrap_or_default()
        );
    }

    if let (true, Some(last)) = (wait, state.last_success_tx) {
        let receipt = chain
            .wait_for_receipt(last.hash)
            .await
            .context("waiting for confirmation")?;
        println!("confirmed in block {}", receipt.block_number);
    }
    Ok(())
}

fn report(config: &Config, state: &FlowState) {
    if let Some(hash) = state.tx_hashes.join {
        println!("join tx: {}", hash);
    }
    if let Some(hash) = state.tx_hashes.vote {
        println!("vote tx: {}", hash);
    }
    if let Some(last) = state.last_success_tx {
        // Submitted, not yet final: point the user at the explorer
        println!("{} submitted: {}", last.kind, config.explorer_tx_url(&last.hash));
    }
}

async fn doctor(config: &Config) -> Result<()> {
    let me = Identity::generate().context("generating throwaway identity")?;
    let others = [Identity::generate()?, Identity::generate()?];

    let mut tree = MembershipTree::new()?;
    tree.insert(me.commitment())?;
    for other in &others {
        tree.insert(other.commitment())?;
    }

    let Some(root) = tree.root() else {
        bail!("tree has members but no root");
    };
    println!("identity:   {}", me.commitment());
    println!("group size: {}", tree.size());
    println!("tree depth: {}", tree.depth());
    println!("tree root:  {}", root);

    let path = tree.proof(0)?;
    if !verify_merkle_proof(&path, tree.depth())? {
        bail!("membership path of a fresh member does not verify");
    }
    let nullifier = me.nullifier(Fr::from(1u64))?;
    println!("nullifier:  {}", field_to_u256(nullifier));
    println!("local checks passed");

    let rpc = rpc_contract(config)?;
    match rpc.block_number().await {
        Ok(head) => println!("rpc:        {} at block {}", config.rpc_url, head),
        Err(e) => println!("rpc:        {} unreachable ({})", config.rpc_url, e),
    }
    match rpc.sender() {
        Some(sender) => println!("signer:     {}", sender),
        None => println!("signer:     none, join/vote disabled (set {})", ENV_PRIVATE_KEY),
    }
    if config.contract_address == Address::ZERO {
        println!("contract:   not configured (set ZKVOTE_CONTRACT)");
    }
    println!("scan from:  block {}", config.deployment_block);
    Ok(())
}
