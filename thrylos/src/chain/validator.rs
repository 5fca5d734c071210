//! Stake-weighted validator selection and block votes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ConsensusError;
use crate::types::{Address, BlockHash};

/// A vote cast by a validator for a block, weighted by the stake the
/// validator held at vote time. Votes are transient: the tally clears
/// them once a block reaches majority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Hash of the block being voted for
    pub block_hash: BlockHash,
    /// Address of the voting validator
    pub validator: Address,
    /// The validator's stake at vote time
    pub stake: i64,
}

/// Draw the next validator, weighted by stake.
///
/// A value `r` is drawn uniformly from `[0, Σ stake)`; the stakeholders
/// are walked in canonical (lexicographic) address order subtracting each
/// stake until `r` goes negative. An empty table fails explicitly.
pub fn select_validator<R: Rng>(
    stakeholders: &BTreeMap<Address, i64>,
    rng: &mut R,
) -> Result<Address, ConsensusError> {
    let total: i64 = stakeholders.values().sum();
    if total <= 0 {
        return Err(ConsensusError::EmptyStakeTable);
    }

    let mut r = rng.gen_range(0..total);
    for (address, stake) in stakeholders {
        r -= stake;
        if r < 0 {
            return Ok(address.clone());
        }
    }
    // Unreachable: the draw is strictly below the stake total.
    Err(ConsensusError::EmptyStakeTable)
}

/// Accumulates votes until some block reaches a stake majority.
#[derive(Debug, Default)]
pub struct VoteTally {
    votes: Vec<Vote>,
}

impl VoteTally {
    /// Record a vote.
    pub fn add(&mut self, vote: Vote) {
        self.votes.push(vote);
    }

    /// Number of pending votes.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Check if no votes are pending.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Tally pending votes against `⌊total_stake/2⌋ + 1`.
    ///
    /// Returns the adopted block hash, ties resolved toward the
    /// lexicographically smaller hash; the vote set is cleared on
    /// adoption.
    pub fn tally(&mut self, total_stake: i64) -> Option<BlockHash> {
        if total_stake <= 0 {
            return None;
        }
        let majority = total_stake / 2 + 1;

        let mut by_hash: BTreeMap<BlockHash, i64> = BTreeMap::new();
        for vote in &self.votes {
            *by_hash.entry(vote.block_hash).or_insert(0) += vote.stake;
        }

        let winner = by_hash
            .iter()
            .find(|(_, stake)| **stake >= majority)
            .map(|(hash, _)| *hash);

        if winner.is_some() {
            self.votes.clear();
        }
        winner
    }
}
