//! Unspent transaction outputs.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Address;

/// An output produced by a transaction, spendable until marked spent.
///
/// Keyed uniquely by `(transaction_id, index)`. The `spent` flag flips
/// false to true exactly once and never back; spent entries are retained
/// in the store for audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Id of the transaction that created this output
    pub transaction_id: String,
    /// Position within that transaction's outputs
    pub index: u32,
    /// Address allowed to spend this output
    pub owner: Address,
    /// Value in base units, always positive
    pub amount: i64,
    /// Whether this output has been consumed
    pub spent: bool,
}

impl Utxo {
    /// Create a fresh, unspent output.
    pub fn new(transaction_id: impl Into<String>, index: u32, owner: Address, amount: i64) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            index,
            owner,
            amount,
            spent: false,
        }
    }

    /// The reference that names this output as a transaction input.
    pub fn reference(&self) -> UtxoRef {
        UtxoRef {
            transaction_id: self.transaction_id.clone(),
            index: self.index,
        }
    }
}

/// A reference to an output, used as a transaction input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
    /// Id of the transaction that created the output
    pub transaction_id: String,
    /// Position within that transaction's outputs
    pub index: u32,
}

impl UtxoRef {
    /// Create a reference.
    pub fn new(transaction_id: impl Into<String>, index: u32) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            index,
        }
    }
}

impl fmt::Display for UtxoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.transaction_id, self.index)
    }
}
