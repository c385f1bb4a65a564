//! Client configuration
//!
//! Loaded from an optional JSON file, every field defaulted, then overridden
//! from `ZKVOTE_*` environment variables. The transaction signing key is
//! never part of the file; it only comes from `ZKVOTE_PRIVATE_KEY`.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{GasLimits, ReceiptPolling, TxHash, JOIN_GAS_LIMIT, VOTE_GAS_LIMIT};
use crate::members::{FetcherConfig, DEPLOYMENT_BLOCK, MAX_BLOCK_RANGE};

pub const ENV_RPC_URL: &str = "ZKVOTE_RPC_URL";
pub const ENV_CONTRACT: &str = "ZKVOTE_CONTRACT";
pub const ENV_PRIVATE_KEY: &str = "ZKVOTE_PRIVATE_KEY";
pub const ENV_IDENTITY_DIR: &str = "ZKVOTE_IDENTITY_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },
}

/// External prover program and circuit artifacts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProverSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub wasm_path: PathBuf,
    pub zkey_path: PathBuf,
}

impl Default for ProverSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("zkvote-prover"),
            args: Vec::new(),
            wasm_path: PathBuf::from("artifacts/semaphore.wasm"),
            zkey_path: PathBuf::from("artifacts/semaphore.zkey"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rpc_url: String,
    pub contract_address: Address,
    pub deployment_block: u64,
    pub max_block_range: u64,
    pub window_delay_ms: u64,
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub join_gas_limit: u64,
    pub vote_gas_limit: u64,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
    pub explorer_url: String,
    pub identity_dir: PathBuf,
    pub prover: ProverSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "https://ethereum-sepolia-rpc.publicnode.com".to_string(),
            contract_address: Address::ZERO,
            deployment_block: DEPLOYMENT_BLOCK,
            max_block_range: MAX_BLOCK_RANGE,
            window_delay_ms: 100,
            fetch_retries: 3,
            retry_backoff_ms: 1000,
            join_gas_limit: JOIN_GAS_LIMIT,
            vote_gas_limit: VOTE_GAS_LIMIT,
            receipt_poll_interval_ms: 2000,
            receipt_timeout_secs: 180,
            explorer_url: "https://sepolia.etherscan.io".to_string(),
            identity_dir: PathBuf::from(".zkvote"),
            prover: ProverSettings::default(),
        }
    }
}

impl Config {
    /// Read `path` (or start from defaults) and apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from `lookup` (the process environment in [`Config::load`])
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.rpc_url = url;
        }
        if let Some(raw) = lookup(ENV_CONTRACT) {
            self.contract_address = parse_address(ENV_CONTRACT, &raw)?;
        }
        if let Some(dir) = lookup(ENV_IDENTITY_DIR) {
            self.identity_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Key that signs join/vote transactions, from the process environment
    pub fn signer() -> Result<Option<PrivateKeySigner>, ConfigError> {
        signer_from(|var| std::env::var(var).ok())
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            deployment_block: self.deployment_block,
            max_block_range: self.max_block_range,
            window_delay: Duration::from_millis(self.window_delay_ms),
            max_attempts: self.fetch_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn gas_limits(&self) -> GasLimits {
        GasLimits {
            join: self.join_gas_limit,
            vote: self.vote_gas_limit,
        }
    }

    pub fn receipt_polling(&self) -> ReceiptPolling {
        ReceiptPolling {
            interval: Duration::from_millis(self.receipt_poll_interval_ms),
            timeout: Duration::from_secs(self.receipt_timeout_secs),
        }
    }

    /// Block explorer page of a transaction
    pub fn explorer_tx_url(&self, tx_hash: &TxHash) -> String {
        format!("{}/tx/{}", self.explorer_url.trim_end_matches('/'), tx_hash)
    }
}

/// Read the signing key from `lookup`; absent means read-only
pub fn signer_from(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<PrivateKeySigner>, ConfigError> {
    let Some(raw) = lookup(ENV_PRIVATE_KEY) else {
        return Ok(None);
    };
    PrivateKeySigner::from_str(raw.trim())
        .map(Some)
        .map_err(|e| ConfigError::InvalidEnv {
            var: ENV_PRIVATE_KEY,
            reason: e.to_string(),
        })
}

fn parse_address(var: &'static str, raw: &str) -> Result<Address, ConfigError> {
    Address::from_str(raw.trim()).map_err(|e| ConfigError::InvalidEnv {
        var,
        reason: e.to_string(),
    })
}
