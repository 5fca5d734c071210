//! The UTXO ledger.
//!
//! The persisted set of unspent outputs, keyed by
//! `utxo-{owner}-{txid}-{index}`. Applying a transaction marks each
//! referenced input spent (rewritten in place and retained for audit) and
//! inserts each output as unspent, all inside one store transaction:
//! either every mutation lands or none do.

pub mod cache;

use std::sync::Arc;

use cache::{CacheConfig, UtxoCache};

use crate::storage::{ChainStore, StorageError, StoreTransaction};
use crate::types::transaction::TransactionError;
use crate::types::{Address, Transaction, Utxo, UtxoRef, UtxoView};
use crate::{ChainError, ChainResult};

/// The store-backed UTXO set with a hot-lookup cache in front.
pub struct UtxoLedger {
    store: Arc<ChainStore>,
    cache: UtxoCache,
}

impl UtxoLedger {
    /// Create a ledger over the chain store.
    pub fn new(store: Arc<ChainStore>, cache_config: CacheConfig) -> Self {
        Self {
            store,
            cache: UtxoCache::new(cache_config),
        }
    }

    /// Apply a transaction's UTXO deltas inside `txn`.
    ///
    /// Fails atomically (nothing staged takes effect) if any referenced
    /// input is missing, already spent, or not owned by the sender.
    /// Reads go through the transaction overlay, so a double spend within
    /// the same block is caught here as well.
    pub fn apply(&self, txn: &mut StoreTransaction<'_>, tx: &Transaction) -> ChainResult<()> {
        for input in &tx.inputs {
            let mut utxo = match self.store.get_utxo_txn(txn, &tx.sender, input)? {
                Some(utxo) => utxo,
                None => {
                    return match self.store.find_utxo_any(input)? {
                        Some(_) => Err(TransactionError::NotOwned(input.to_string()).into()),
                        None => Err(TransactionError::UnknownInput(input.to_string()).into()),
                    };
                }
            };
            if utxo.spent {
                return Err(TransactionError::DoubleSpend(input.to_string()).into());
            }
            utxo.spent = true;
            self.store.put_utxo_txn(txn, &utxo)?;
        }

        for output in &tx.outputs {
            if output.amount <= 0 {
                return Err(ChainError::Transaction(TransactionError::MalformedInput(
                    "non-positive output amount".into(),
                )));
            }
            self.store.put_utxo_txn(txn, output)?;
        }

        Ok(())
    }

    /// Update the cache after the containing store transaction committed:
    /// spent inputs leave, fresh outputs enter.
    pub fn confirm(&self, tx: &Transaction) {
        for input in &tx.inputs {
            self.cache.remove(&input.to_string());
        }
        for output in &tx.outputs {
            self.cache.put(output.reference().to_string(), output.clone());
        }
    }

    /// Drop the cache wholesale. Called when a store write could not be
    /// confirmed; the store remains the source of truth.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    /// Every unspent output owned by `address`.
    pub fn unspent_for(&self, address: &Address) -> ChainResult<Vec<Utxo>> {
        Ok(self.store.unspent_for(address)?)
    }

    /// Spendable balance: the sum of unspent outputs.
    pub fn balance(&self, address: &Address) -> ChainResult<i64> {
        Ok(self.unspent_for(address)?.iter().map(|u| u.amount).sum())
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> cache::CacheStats {
        self.cache.stats()
    }
}

impl UtxoView for UtxoLedger {
    fn lookup_for(&self, owner: &Address, input: &UtxoRef) -> Result<Option<Utxo>, StorageError> {
        // Cache holds only unspent entries; a hit must still match the
        // claimed owner before it can answer the lookup.
        if let Some(cached) = self.cache.get(&input.to_string()) {
            if &cached.owner == owner {
                return Ok(Some(cached));
            }
        }
        self.store.get_utxo(owner, input)
    }

    fn lookup_any(&self, input: &UtxoRef) -> Result<Option<Utxo>, StorageError> {
        self.store.find_utxo_any(input)
    }
}
