//! Shared configuration structures for the node and its consensus core.

use crate::app::{Amount, CYCLE_LENGTH, MIN_FREEZE_STAKE};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// A network interface the node binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Bind address.
    pub address: String,
    /// Bind port.
    pub port: u16,
}

/// Tunables of the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Blocks covered by one enrollment. Network-wide constant.
    #[serde(default = "default_cycle_length")]
    pub cycle_length: u32,
    /// Minimum stake a freeze output must carry to back an enrollment.
    #[serde(default = "default_min_freeze_stake")]
    pub min_freeze_stake: Amount,
    /// Delay before the nomination timer fires and re-nominates.
    #[serde(default = "default_nomination_timeout_ms")]
    pub nomination_timeout_ms: u64,
    /// Delay before the ballot timer fires and bumps the ballot counter.
    #[serde(default = "default_ballot_timeout_ms")]
    pub ballot_timeout_ms: u64,
    /// Deadline for fetching a peer's unknown quorum set before buffered
    /// envelopes referencing it are dropped.
    #[serde(default = "default_quorum_fetch_timeout_ms")]
    pub quorum_fetch_timeout_ms: u64,
    /// Delay before an unsealed block is signed with whichever validators
    /// have revealed, instead of waiting for the full set.
    #[serde(default = "default_block_sign_timeout_ms")]
    pub block_sign_timeout_ms: u64,
    /// Overrides the unanimous threshold the quorum builder emits. Intended
    /// for networks that trade safety margin for liveness; capped at the
    /// built set's size.
    #[serde(default)]
    pub quorum_threshold_override: Option<u32>,
    /// Whether the global quorum-intersection check runs when quorums are
    /// rebuilt. Expensive with very large validator counts, but on by default.
    #[serde(default = "default_true")]
    pub quorum_intersection_checks: bool,
}

fn default_cycle_length() -> u32 {
    CYCLE_LENGTH
}
fn default_min_freeze_stake() -> Amount {
    MIN_FREEZE_STAKE
}
fn default_nomination_timeout_ms() -> u64 {
    1_000
}
fn default_ballot_timeout_ms() -> u64 {
    1_000
}
fn default_quorum_fetch_timeout_ms() -> u64 {
    5_000
}
fn default_block_sign_timeout_ms() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            cycle_length: default_cycle_length(),
            min_freeze_stake: default_min_freeze_stake(),
            nomination_timeout_ms: default_nomination_timeout_ms(),
            ballot_timeout_ms: default_ballot_timeout_ms(),
            quorum_fetch_timeout_ms: default_quorum_fetch_timeout_ms(),
            block_sign_timeout_ms: default_block_sign_timeout_ms(),
            quorum_threshold_override: None,
            quorum_intersection_checks: default_true(),
        }
    }
}

/// Top-level node configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Interfaces to bind.
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    /// Hex-encoded secret scalar for the validator key. Overridable on the
    /// command line; absent for non-validating observers.
    #[serde(default)]
    pub seed: Option<String>,
    /// Whether this node participates in consensus.
    #[serde(default)]
    pub is_validator: bool,
    /// Directory for the persistent store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Consensus tunables.
    #[serde(default)]
    pub consensus: ConsensusParams,
}

fn default_data_dir() -> String {
    ".stoa".to_string()
}

impl NodeConfig {
    /// Semantic checks beyond what the parser enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_validator && self.seed.is_none() {
            return Err(ConfigError::Invalid(
                "a validator requires a seed".to_string(),
            ));
        }
        if self.consensus.cycle_length == 0 {
            return Err(ConfigError::Invalid(
                "cycle_length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
