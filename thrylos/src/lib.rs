//! Thrylos: a permissioned proof-of-stake blockchain node.
//!
//! The node maintains an append-only chain of blocks whose transactions
//! move value between addresses over a UTXO ledger, distributes periodic
//! time-weighted staking rewards, and answers block/transaction/balance
//! queries over an HTTP RPC adapter.
//!
//! ## Modules
//! - `types` - Core data structures (addresses, UTXOs, transactions, blocks)
//! - `storage` - Byte-keyed transactional store adapter and typed chain store
//! - `ledger` - The UTXO set with atomic spend/create semantics
//! - `chain` - Append-only block list, stakeholder table, validator selection
//! - `staking` - Stake lifecycle and time-weighted reward settlement
//! - `node` - Pending pool, block producer, RPC adapter and the node façade

pub mod chain;
pub mod ledger;
pub mod node;
pub mod staking;
pub mod storage;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

/// Base units per THRLY token.
pub const BASE_UNITS_PER_THRLY: i64 = 10_000_000;

/// Chain parameters shared by every component.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Total supply minted into the genesis account (base units)
    pub genesis_supply: i64,
    /// Stake seeded for the genesis account so block production can start
    pub genesis_stake: i64,
    /// Transaction timestamps older than this are rejected (seconds)
    pub tx_recency_window: i64,
    /// Minimum stake accepted by the staking service (base units)
    pub min_stake: i64,
    /// Reward budget distributed per reward period (base units)
    pub period_budget: i64,
    /// Length of one reward period (seconds)
    pub reward_period_secs: i64,
    /// Cadence of the vote tally task (seconds)
    pub vote_tally_interval_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            genesis_supply: 1_000_000_000_000,
            genesis_stake: 1_000 * BASE_UNITS_PER_THRLY,
            tx_recency_window: 3_600,
            min_stake: 40 * BASE_UNITS_PER_THRLY,
            period_budget: 4_800 * BASE_UNITS_PER_THRLY,
            reward_period_secs: 24 * 60 * 60,
            vote_tally_interval_secs: 60,
        }
    }
}

impl ChainConfig {
    /// Testnet parameters: small supply, fast reward cycle.
    pub fn testnet() -> Self {
        Self {
            genesis_supply: 1_000_000_000_000,
            min_stake: BASE_UNITS_PER_THRLY,
            reward_period_secs: 60 * 60,
            ..Default::default()
        }
    }
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Errors that can occur across the node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Address error: {0}")]
    Address(#[from] types::address::AddressError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] types::transaction::TransactionError),

    #[error("Block error: {0}")]
    Block(#[from] types::block::BlockError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] chain::ConsensusError),

    #[error("Staking error: {0}")]
    Staking(#[from] staking::StakingError),

    #[error("Pool error: {0}")]
    Pool(#[from] node::mempool::PoolError),

    #[error("Node error: {0}")]
    Node(#[from] node::NodeError),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl From<thrylos_crypto::SignatureError> for ChainError {
    fn from(err: thrylos_crypto::SignatureError) -> Self {
        ChainError::Crypto(err.to_string())
    }
}

impl From<thrylos_crypto::CipherError> for ChainError {
    fn from(err: thrylos_crypto::CipherError) -> Self {
        ChainError::Crypto(err.to_string())
    }
}

/// Current Unix time in seconds.
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChainConfig::default();
        assert_eq!(config.genesis_supply, 1_000_000_000_000);
        assert_eq!(config.reward_period_secs, 86_400);
        assert!(config.min_stake > 0);
    }

    #[test]
    fn test_testnet_config() {
        let config = ChainConfig::testnet();
        assert!(config.min_stake < ChainConfig::default().min_stake);
    }

    #[test]
    fn test_unix_time_monotonic_enough() {
        let t = unix_time();
        assert!(t > 1_700_000_000);
    }
}
