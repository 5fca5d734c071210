//! Blocks and block hashing.
//!
//! A block commits to its transactions through a merkle root; the block
//! hash covers `index ‖ timestamp ‖ prev_hash ‖ merkle_root ‖ validator`.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Address, Transaction};
use thrylos_crypto::{Hasher, HASH_SIZE};

/// Block hash (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct BlockHash(pub [u8; HASH_SIZE]);

impl BlockHash {
    /// Zero hash, the genesis parent.
    pub const ZERO: Self = Self([0u8; HASH_SIZE]);

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex.
    pub fn from_hex(s: &str) -> Result<Self, BlockError> {
        let bytes = hex::decode(s).map_err(|_| BlockError::InvalidHash)?;
        let arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| BlockError::InvalidHash)?;
        Ok(Self(arr))
    }

    /// Check if zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A block in the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Height, 0 for genesis
    pub index: u64,
    /// Unix seconds at production time
    pub timestamp: i64,
    /// Transactions in pool-insertion order
    pub transactions: Vec<Transaction>,
    /// Address of the validator that authored this block
    pub validator: Address,
    /// Hash of the previous block (zero for genesis)
    pub prev_hash: BlockHash,
    /// Hash over index, timestamp, prev_hash, merkle root and validator
    pub hash: BlockHash,
}

impl Block {
    /// Assemble a block and compute its hash.
    pub fn new(
        index: u64,
        timestamp: i64,
        transactions: Vec<Transaction>,
        validator: Address,
        prev_hash: BlockHash,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp,
            transactions,
            validator,
            prev_hash,
            hash: BlockHash::ZERO,
        };
        block.hash = block.compute_hash();
        block
    }

    /// The genesis block: a single unsigned mint transaction creating the
    /// entire supply as the genesis account's first output.
    pub fn genesis(genesis_account: Address, supply: i64, timestamp: i64) -> Self {
        let mint = Transaction::new(
            genesis_account.clone(),
            Vec::new(),
            vec![(genesis_account.clone(), supply)],
            Vec::new(),
            timestamp,
        );
        Self::new(0, timestamp, vec![mint], genesis_account, BlockHash::ZERO)
    }

    /// Recompute the hash from the block contents.
    pub fn compute_hash(&self) -> BlockHash {
        let mut hasher = Hasher::new();
        hasher.update(&self.index.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.prev_hash.0);
        hasher.update(&self.merkle_root());
        hasher.update(self.validator.as_str().as_bytes());
        BlockHash(hasher.finalize())
    }

    /// Merkle root over the canonical bytes of the transactions.
    pub fn merkle_root(&self) -> [u8; HASH_SIZE] {
        let leaves: Vec<[u8; HASH_SIZE]> = self
            .transactions
            .iter()
            .map(|tx| thrylos_crypto::hash(&tx.canonical_bytes()))
            .collect();
        compute_merkle_root(&leaves)
    }

    /// Check that the stored hash matches the contents.
    pub fn verify_hash(&self) -> Result<(), BlockError> {
        if self.hash != self.compute_hash() {
            return Err(BlockError::HashMismatch(self.index));
        }
        Ok(())
    }

    /// Check linkage against the preceding block.
    pub fn validate_against(&self, prev: &Block) -> Result<(), BlockError> {
        if self.index != prev.index + 1 {
            return Err(BlockError::NonSequentialIndex {
                expected: prev.index + 1,
                found: self.index,
            });
        }
        if self.prev_hash != prev.hash {
            return Err(BlockError::PrevHashMismatch(self.index));
        }
        Ok(())
    }
}

/// Compute a merkle root from a list of leaf hashes.
///
/// Odd nodes are paired with themselves; the empty list hashes to zero.
pub fn compute_merkle_root(hashes: &[[u8; HASH_SIZE]]) -> [u8; HASH_SIZE] {
    if hashes.is_empty() {
        return [0u8; HASH_SIZE];
    }
    if hashes.len() == 1 {
        return hashes[0];
    }

    let mut current: Vec<[u8; HASH_SIZE]> = hashes.to_vec();
    while current.len() > 1 {
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        for chunk in current.chunks(2) {
            let mut hasher = Hasher::new();
            hasher.update(&chunk[0]);
            hasher.update(if chunk.len() > 1 { &chunk[1] } else { &chunk[0] });
            next.push(hasher.finalize());
        }
        current = next;
    }
    current[0]
}

/// Block-related errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("Block {0} hash does not match its contents")]
    HashMismatch(u64),
    #[error("Non-sequential block index: expected {expected}, found {found}")]
    NonSequentialIndex { expected: u64, found: u64 },
    #[error("Block {0} does not link to its parent hash")]
    PrevHashMismatch(u64),
    #[error("Invalid block hash encoding")]
    InvalidHash,
}
