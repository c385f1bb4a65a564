// Group membership reconstruction from MemberJoined history
// The member list is rebuilt from chain logs on every call: scan from the
// contract's deployment block to the head in windows the node will accept,
// then order by (block, log index), which is the contract's insertion order.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::sleep;

use crate::chain::{ChainError, MemberJoinedLog, VotingContract};

/// Block the voting contract was deployed in; nothing to scan before it
pub const DEPLOYMENT_BLOCK: u64 = 9_811_631;

/// Largest block span a single eth_getLogs call may cover
pub const MAX_BLOCK_RANGE: u64 = 10_000;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch group members after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ChainError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetcherConfig {
    pub deployment_block: u64,
    pub max_block_range: u64,
    /// Pause between consecutive windows
    pub window_delay: Duration,
    /// Whole-scan attempts before giving up
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * retry_backoff` before the next
    pub retry_backoff: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            deployment_block: DEPLOYMENT_BLOCK,
            max_block_range: MAX_BLOCK_RANGE,
            window_delay: Duration::from_millis(100),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1000),
        }
    }
}

/// Split the inclusive range `[from, to]` into consecutive inclusive windows
/// of at most `max_range` blocks
pub fn block_windows(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let span = max_range.max(1);
    let mut windows = Vec::new();
    let mut start = from;

    while start <= to {
        let end = start.saturating_add(span - 1).min(to);
        windows.push((start, end));
        match end.checked_add(1) {
            Some(next) => start = next,
            None => break,
        }
    }
    windows
}

pub struct GroupMembersFetcher {
    contract: Arc<dyn VotingContract>,
    config: FetcherConfig,
}

impl GroupMembersFetcher {
    pub fn new(contract: Arc<dyn VotingContract>, config: FetcherConfig) -> Self {
        Self { contract, config }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Ordered member commitments of `proposal_id`
    ///
    /// # Returns
    /// Commitments in on-chain insertion order. Two calls against the same
    /// chain state return the same list.
    pub async fn fetch_group_members(&self, proposal_id: u64) -> Result<Vec<U256>, FetchError> {
        let logs = self.fetch_member_logs(proposal_id).await?;
        let members: Vec<U256> = logs.into_iter().map(|log| log.commitment).collect();

        info!("proposal {} has {} members", proposal_id, members.len());
        Ok(members)
    }

    /// Sorted `MemberJoined` logs of `proposal_id`, retrying the whole scan
    pub async fn fetch_member_logs(&self, proposal_id: u64) -> Result<Vec<MemberJoinedLog>, FetchError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.scan(proposal_id).await {
                Ok(logs) => return Ok(logs),
                Err(source) if attempt >= attempts => {
                    return Err(FetchError::Exhausted { attempts, source });
                }
                Err(e) => {
                    let wait = self.config.retry_backoff * attempt;
                    warn!(
                        "member scan for proposal {} failed (attempt {}/{}), retrying in {:?}: {}",
                        proposal_id, attempt, attempts, wait, e
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Whether `commitment` has joined `proposal_id`
    ///
    /// Errors count as "not a member"; use this for display, not for
    /// anything that must be right.
    pub async fn check_membership(&self, proposal_id: u64, commitment: U256) -> bool {
        match self.fetch_group_members(proposal_id).await {
            Ok(members) => members.contains(&commitment),
            Err(e) => {
                warn!("membership check for proposal {} failed: {}", proposal_id, e);
                false
            }
        }
    }

    /// Number of members of `proposal_id`, 0 when the scan fails
    pub async fn member_count(&self, proposal_id: u64) -> usize {
        match self.fetch_member_logs(proposal_id).await {
            Ok(logs) => logs.len(),
            Err(e) => {
                warn!("member count for proposal {} failed: {}", proposal_id, e);
                0
            }
        }
    }

    /// One full scan, no retries
    async fn scan(&self, proposal_id: u64) -> Result<Vec<MemberJoinedLog>, ChainError> {
        let head = self.contract.block_number().await?;
        let windows = block_windows(self.config.deployment_block, head, self.config.max_block_range);
        debug!(
            "scanning blocks {}..={} in {} window(s)",
            self.config.deployment_block,
            head,
            windows.len()
        );

        let mut logs = Vec::new();
        for (i, (from, to)) in windows.iter().enumerate() {
            if i > 0 && !self.config.window_delay.is_zero() {
                sleep(self.config.window_delay).await;
            }
            let window = self.contract.member_joined_logs(proposal_id, *from, *to).await?;
            debug!("window {}..={}: {} event(s)", from, to, window.len());
            logs.extend(window);
        }

        let wanted = U256::from(proposal_id);
        logs.retain(|log| {
            let matches = log.proposal_id == wanted;
            if !matches {
                warn!("dropping MemberJoined log for proposal {}", log.proposal_id);
            }
            matches
        });

        logs.sort_by_key(|log| (log.block_number, log.log_index));
        logs.dedup_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }
}
