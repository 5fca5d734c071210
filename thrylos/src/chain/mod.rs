//! The chain: append-only block list, stakeholder table, validator
//! selection, votes, and full integrity checking.

pub mod validator;

pub use validator::{select_validator, Vote, VoteTally};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ledger::UtxoLedger;
use crate::storage::{ChainStore, StorageError};
use crate::types::transaction::{self, TransactionError};
use crate::types::{Address, Block, BlockHash, Transaction, Utxo};
use crate::{unix_time, ChainConfig, ChainError, ChainResult};

/// Consensus-level errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("No stake available for validator selection")]
    EmptyStakeTable,
    #[error("Insufficient stake: have {have}, need {need}")]
    InsufficientStake { have: i64, need: i64 },
    #[error("Chain is read-only")]
    ReadOnly,
}

struct ChainInner {
    blocks: Vec<Block>,
    stakeholders: BTreeMap<Address, i64>,
}

/// The blockchain: block list and stakeholder table behind a
/// reader-writer lock, votes behind their own mutex.
pub struct Blockchain {
    config: ChainConfig,
    store: Arc<ChainStore>,
    ledger: Arc<UtxoLedger>,
    inner: RwLock<ChainInner>,
    votes: Mutex<VoteTally>,
    read_only: AtomicBool,
}

impl Blockchain {
    /// Open the chain from the store, creating the genesis block (and
    /// mint transaction) on first start. The stakeholder table is rebuilt
    /// from persisted stake events; the genesis account is seeded with
    /// the configured genesis stake so production can begin.
    pub fn open(
        config: ChainConfig,
        store: Arc<ChainStore>,
        ledger: Arc<UtxoLedger>,
        genesis_account: Address,
    ) -> ChainResult<Self> {
        let mut blocks = store.load_blocks()?;

        if blocks.is_empty() {
            let genesis = Block::genesis(genesis_account.clone(), config.genesis_supply, unix_time());

            let mut txn = store.begin();
            for tx in &genesis.transactions {
                ledger.apply(&mut txn, tx)?;
                store.put_transaction_txn(&mut txn, tx)?;
            }
            store.put_block_txn(&mut txn, &genesis)?;
            txn.commit()?;
            for tx in &genesis.transactions {
                ledger.confirm(tx);
            }

            info!("Created genesis block {}", genesis.hash);
            blocks.push(genesis);
        } else {
            // The reverse-iterated tip and the loaded list must agree.
            let tip = store.tip()?.ok_or_else(|| {
                StorageError::Corruption("blocks present but no tip under the block- prefix".into())
            })?;
            let last = blocks.last().expect("nonempty");
            if tip.index != last.index || tip.hash != last.hash {
                return Err(StorageError::Corruption(format!(
                    "tip mismatch: reverse scan found {}, list ends at {}",
                    tip.index, last.index
                ))
                .into());
            }
            debug!("Loaded {} blocks from store, tip {}", blocks.len(), tip.index);
        }

        let mut stakeholders = BTreeMap::new();
        stakeholders.insert(genesis_account, config.genesis_stake);
        for address in store.stake_addresses()? {
            let active: i64 = store
                .load_stake_events(&address)?
                .iter()
                .map(|(_, delta)| delta)
                .sum();
            if active > 0 {
                *stakeholders.entry(address).or_insert(0) += active;
            }
        }

        Ok(Self {
            config,
            store,
            ledger,
            inner: RwLock::new(ChainInner {
                blocks,
                stakeholders,
            }),
            votes: Mutex::new(VoteTally::default()),
            read_only: AtomicBool::new(false),
        })
    }

    /// Chain parameters.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// The UTXO ledger.
    pub fn ledger(&self) -> &Arc<UtxoLedger> {
        &self.ledger
    }

    /// The chain store.
    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Height of the tip.
    pub fn height(&self) -> u64 {
        self.inner.read().blocks.last().map(|b| b.index).unwrap_or(0)
    }

    /// The latest block.
    pub fn last_block(&self) -> Block {
        self.inner
            .read()
            .blocks
            .last()
            .expect("chain always holds at least the genesis block")
            .clone()
    }

    /// Fetch a block by height.
    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        self.inner.read().blocks.get(index as usize).cloned()
    }

    /// Fetch a block by hash.
    pub fn block_by_hash(&self, hash: &BlockHash) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .iter()
            .find(|b| &b.hash == hash)
            .cloned()
    }

    /// Total transactions across all blocks.
    pub fn transaction_count(&self) -> usize {
        self.inner
            .read()
            .blocks
            .iter()
            .map(|b| b.transactions.len())
            .sum()
    }

    /// Fetch a mined transaction by id.
    pub fn transaction(&self, id: &str) -> ChainResult<Option<Transaction>> {
        Ok(self.store.get_transaction(id)?)
    }

    /// Whether a transaction id is already on the chain.
    pub fn has_transaction(&self, id: &str) -> ChainResult<bool> {
        Ok(self.store.has_transaction(id)?)
    }

    /// Verify a transaction against the current ledger: duplicate id,
    /// signature, input existence/ownership, conservation, recency.
    pub fn verify_transaction(&self, tx: &Transaction, now: i64) -> ChainResult<()> {
        if self.store.has_transaction(&tx.id)? {
            return Err(ChainError::Transaction(TransactionError::DuplicateId(
                tx.id.clone(),
            )));
        }
        transaction::verify(
            tx,
            self.ledger.as_ref(),
            |address| self.store.get_public_key(address).ok().flatten(),
            now,
            self.config.tx_recency_window,
        )
    }

    /// Append a block containing `transactions` in the given order.
    ///
    /// Ledger deltas, transaction records and the block itself are
    /// persisted in one store transaction; on any failure nothing is
    /// committed and the in-memory chain is untouched.
    pub fn append_block(
        &self,
        transactions: Vec<Transaction>,
        validator: Address,
        timestamp: i64,
    ) -> ChainResult<Block> {
        if self.is_read_only() {
            return Err(ConsensusError::ReadOnly.into());
        }

        let mut inner = self.inner.write();
        let prev = inner
            .blocks
            .last()
            .expect("chain always holds at least the genesis block");
        let block = Block::new(
            prev.index + 1,
            timestamp,
            transactions,
            validator,
            prev.hash,
        );

        let mut txn = self.store.begin();
        for tx in &block.transactions {
            self.ledger.apply(&mut txn, tx)?;
            self.store.put_transaction_txn(&mut txn, tx)?;
        }
        self.store.put_block_txn(&mut txn, &block)?;

        if let Err(err) = txn.commit() {
            // The batch may have partially reached the backend only if it
            // reported corruption; either way the cache can no longer be
            // trusted.
            self.ledger.invalidate_cache();
            if matches!(err, StorageError::Corruption(_)) {
                self.enter_read_only();
            }
            warn!("Block {} commit failed: {}", block.index, err);
            return Err(err.into());
        }

        for tx in &block.transactions {
            self.ledger.confirm(tx);
        }
        info!(
            "Appended block {} ({} transactions) by {}",
            block.index,
            block.transactions.len(),
            block.validator
        );
        inner.blocks.push(block.clone());
        Ok(block)
    }

    // --- stakeholders & validator selection ---

    /// Sum of all stakeholder balances.
    pub fn total_stake(&self) -> i64 {
        self.inner.read().stakeholders.values().sum()
    }

    /// Snapshot of the stakeholder table.
    pub fn stakeholders(&self) -> BTreeMap<Address, i64> {
        self.inner.read().stakeholders.clone()
    }

    /// Adjust a stakeholder's running balance. Entries that reach zero
    /// are dropped from the table.
    pub fn credit_stakeholder(&self, address: &Address, delta: i64) {
        let mut inner = self.inner.write();
        let balance = inner.stakeholders.entry(address.clone()).or_insert(0);
        *balance += delta;
        if *balance <= 0 {
            inner.stakeholders.remove(address);
        }
    }

    /// Draw the next validator using the OS CSPRNG.
    pub fn select_validator(&self) -> ChainResult<Address> {
        self.select_validator_with(&mut rand::rngs::OsRng)
    }

    /// Draw the next validator with a caller-supplied RNG. With a seeded
    /// RNG the selection is fully deterministic.
    pub fn select_validator_with<R: rand::Rng>(&self, rng: &mut R) -> ChainResult<Address> {
        let inner = self.inner.read();
        Ok(select_validator(&inner.stakeholders, rng)?)
    }

    // --- votes ---

    /// Record a vote from a peer validator.
    pub fn submit_vote(&self, vote: Vote) {
        debug!(
            "Vote for {} from {} (stake {})",
            vote.block_hash, vote.validator, vote.stake
        );
        self.votes.lock().add(vote);
    }

    /// Tally pending votes; returns the adopted hash once a block holds
    /// a stake majority, clearing the vote set.
    pub fn tally_votes(&self) -> Option<BlockHash> {
        let total = self.total_stake();
        self.votes.lock().tally(total)
    }

    // --- integrity ---

    /// Walk the whole chain verifying block hashes, linkage, and every
    /// transaction's validity under a ledger replayed from the empty set.
    pub fn check_integrity(&self) -> ChainResult<()> {
        let inner = self.inner.read();
        let mut replayed: HashMap<String, Utxo> = HashMap::new();

        for (height, block) in inner.blocks.iter().enumerate() {
            block.verify_hash()?;
            if height > 0 {
                block.validate_against(&inner.blocks[height - 1])?;
            }

            for (position, tx) in block.transactions.iter().enumerate() {
                let is_genesis_mint = height == 0 && position == 0;
                if !is_genesis_mint {
                    let mut input_total: i64 = 0;
                    for input in &tx.inputs {
                        let key = input.to_string();
                        let utxo = replayed.get_mut(&key).ok_or_else(|| {
                            StorageError::Corruption(format!(
                                "block {height}: tx {} spends unknown output {key}",
                                tx.id
                            ))
                        })?;
                        if utxo.spent {
                            return Err(StorageError::Corruption(format!(
                                "block {height}: tx {} double-spends {key}",
                                tx.id
                            ))
                            .into());
                        }
                        if utxo.owner != tx.sender {
                            return Err(StorageError::Corruption(format!(
                                "block {height}: tx {} spends foreign output {key}",
                                tx.id
                            ))
                            .into());
                        }
                        utxo.spent = true;
                        input_total += utxo.amount;
                    }
                    if input_total != tx.output_total() {
                        return Err(StorageError::Corruption(format!(
                            "block {height}: tx {} does not conserve value",
                            tx.id
                        ))
                        .into());
                    }
                }

                for output in &tx.outputs {
                    replayed.insert(output.reference().to_string(), output.clone());
                }
            }
        }
        Ok(())
    }

    /// Whether the chain has stopped accepting writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Latch the chain read-only after an integrity violation.
    pub fn enter_read_only(&self) {
        warn!("Entering read-only mode");
        self.read_only.store(true, Ordering::SeqCst);
    }
}
