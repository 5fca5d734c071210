//! Typed chain store: the persisted key schema over a raw key-value store.
//!
//! Key layout (all keys are byte strings):
//!
//! - `block-{index:020}` → bincode Block. The index is zero-padded decimal
//!   so that lexicographic reverse iteration over the `block-` prefix
//!   yields the numerically-latest block (the tip).
//! - `transaction-{id}` → bincode Transaction.
//! - `utxo-{owner}-{txid}-{index}` → bincode Utxo. Owner and txid are hex,
//!   so the dashes are unambiguous separators.
//! - `publicKey-{address}` → JSON `{"ed25519PublicKey": bytes}`.
//! - `privateKey-{address}` → AES-GCM sealed private key bytes.
//! - `stake-{address}-{ts:020}` → bincode list of stake deltas at that
//!   second (a list so that a stake and an unstake in the same second do
//!   not collide).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use thrylos_crypto::{AtRestCipher, PublicKey};

use super::kv::{KeyValueStore, StoreTransaction};
use super::{StorageError, StorageResult};
use crate::types::{Address, Block, Transaction, Utxo, UtxoRef};

fn block_key(index: u64) -> Vec<u8> {
    format!("block-{index:020}").into_bytes()
}

fn transaction_key(id: &str) -> Vec<u8> {
    format!("transaction-{id}").into_bytes()
}

/// Key for one UTXO under its owner's key space.
pub fn utxo_key(owner: &Address, transaction_id: &str, index: u32) -> Vec<u8> {
    format!("utxo-{owner}-{transaction_id}-{index}").into_bytes()
}

/// Prefix covering every UTXO owned by `owner`.
pub fn utxo_prefix(owner: &Address) -> Vec<u8> {
    format!("utxo-{owner}-").into_bytes()
}

fn public_key_key(address: &Address) -> Vec<u8> {
    format!("publicKey-{address}").into_bytes()
}

fn private_key_key(address: &Address) -> Vec<u8> {
    format!("privateKey-{address}").into_bytes()
}

fn stake_key(address: &Address, timestamp: i64) -> Vec<u8> {
    format!("stake-{address}-{timestamp:020}").into_bytes()
}

fn stake_prefix(address: &Address) -> Vec<u8> {
    format!("stake-{address}-").into_bytes()
}

#[derive(Serialize, Deserialize)]
struct PublicKeyRecord {
    #[serde(rename = "ed25519PublicKey")]
    ed25519_public_key: Vec<u8>,
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Codec(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Codec(e.to_string()))
}

/// The typed store every component persists through.
pub struct ChainStore {
    kv: Arc<dyn KeyValueStore>,
    at_rest: AtRestCipher,
}

impl ChainStore {
    /// Wrap a raw store with the chain schema and the at-rest cipher.
    pub fn new(kv: Arc<dyn KeyValueStore>, at_rest: AtRestCipher) -> Self {
        Self { kv, at_rest }
    }

    /// Begin a store transaction.
    pub fn begin(&self) -> StoreTransaction<'_> {
        StoreTransaction::begin(self.kv.as_ref())
    }

    /// The raw store.
    pub fn kv(&self) -> &dyn KeyValueStore {
        self.kv.as_ref()
    }

    // --- blocks ---

    /// Stage a block write inside a transaction.
    pub fn put_block_txn(&self, txn: &mut StoreTransaction<'_>, block: &Block) -> StorageResult<()> {
        txn.put(block_key(block.index), encode(block)?);
        Ok(())
    }

    /// Fetch a block by index.
    pub fn get_block(&self, index: u64) -> StorageResult<Option<Block>> {
        match self.kv.get(&block_key(index))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The latest persisted block, found by reverse iteration over the
    /// `block-` prefix.
    pub fn tip(&self) -> StorageResult<Option<Block>> {
        match self.kv.iter_prefix_rev(b"block-")?.next() {
            Some((_, bytes)) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load every block in index order.
    pub fn load_blocks(&self) -> StorageResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for (_, bytes) in self.kv.iter_prefix(b"block-")? {
            blocks.push(decode(&bytes)?);
        }
        Ok(blocks)
    }

    // --- transactions ---

    /// Stage a transaction write inside a store transaction.
    pub fn put_transaction_txn(
        &self,
        txn: &mut StoreTransaction<'_>,
        tx: &Transaction,
    ) -> StorageResult<()> {
        txn.put(transaction_key(&tx.id), encode(tx)?);
        Ok(())
    }

    /// Fetch a transaction by id.
    pub fn get_transaction(&self, id: &str) -> StorageResult<Option<Transaction>> {
        match self.kv.get(&transaction_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check whether a transaction id is already on the chain.
    pub fn has_transaction(&self, id: &str) -> StorageResult<bool> {
        self.kv.exists(&transaction_key(id))
    }

    // --- UTXOs ---

    /// Fetch one UTXO under an owner's key space, spent or not.
    pub fn get_utxo(
        &self,
        owner: &Address,
        reference: &UtxoRef,
    ) -> StorageResult<Option<Utxo>> {
        let key = utxo_key(owner, &reference.transaction_id, reference.index);
        match self.kv.get(&key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stage a UTXO write inside a store transaction.
    pub fn put_utxo_txn(&self, txn: &mut StoreTransaction<'_>, utxo: &Utxo) -> StorageResult<()> {
        let key = utxo_key(&utxo.owner, &utxo.transaction_id, utxo.index);
        txn.put(key, encode(utxo)?);
        Ok(())
    }

    /// Fetch one UTXO through a transaction's overlay, so writes staged
    /// earlier in the same transaction are visible.
    pub fn get_utxo_txn(
        &self,
        txn: &StoreTransaction<'_>,
        owner: &Address,
        reference: &UtxoRef,
    ) -> StorageResult<Option<Utxo>> {
        let key = utxo_key(owner, &reference.transaction_id, reference.index);
        match txn.get(&key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Scan the whole UTXO space for a reference, regardless of owner.
    /// Failure-path helper used to distinguish a missing output from one
    /// owned by someone else.
    pub fn find_utxo_any(&self, reference: &UtxoRef) -> StorageResult<Option<Utxo>> {
        let suffix = format!("-{}-{}", reference.transaction_id, reference.index);
        for (key, bytes) in self.kv.iter_prefix(b"utxo-")? {
            if key.ends_with(suffix.as_bytes()) {
                return Ok(Some(decode(&bytes)?));
            }
        }
        Ok(None)
    }

    /// Every unspent UTXO owned by `owner`, in key order.
    pub fn unspent_for(&self, owner: &Address) -> StorageResult<Vec<Utxo>> {
        let mut utxos = Vec::new();
        for (_, bytes) in self.kv.iter_prefix(&utxo_prefix(owner))? {
            let utxo: Utxo = decode(&bytes)?;
            if !utxo.spent {
                utxos.push(utxo);
            }
        }
        Ok(utxos)
    }

    // --- key registry ---

    /// Register an address's Ed25519 public key.
    pub fn put_public_key(&self, address: &Address, public_key: &PublicKey) -> StorageResult<()> {
        let record = PublicKeyRecord {
            ed25519_public_key: public_key.to_bytes().to_vec(),
        };
        let bytes =
            serde_json::to_vec(&record).map_err(|e| StorageError::Codec(e.to_string()))?;
        self.kv.put(&public_key_key(address), &bytes)
    }

    /// Fetch an address's registered public key.
    pub fn get_public_key(&self, address: &Address) -> StorageResult<Option<PublicKey>> {
        let Some(bytes) = self.kv.get(&public_key_key(address))? else {
            return Ok(None);
        };
        let record: PublicKeyRecord =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Codec(e.to_string()))?;
        let public_key = PublicKey::from_slice(&record.ed25519_public_key)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(Some(public_key))
    }

    /// Store a private key, AEAD-sealed under the at-rest key.
    pub fn put_private_key(&self, address: &Address, private_key: &[u8]) -> StorageResult<()> {
        let sealed = self.at_rest.seal(private_key);
        self.kv.put(&private_key_key(address), &sealed)
    }

    /// Retrieve and unseal a private key.
    pub fn get_private_key(&self, address: &Address) -> StorageResult<Option<Vec<u8>>> {
        let Some(sealed) = self.kv.get(&private_key_key(address))? else {
            return Ok(None);
        };
        self.at_rest
            .open(&sealed)
            .map(Some)
            .map_err(|e| StorageError::Corruption(format!("private key for {address}: {e}")))
    }

    // --- stake events ---

    /// Append a stake event (positive delta = stake, negative = unstake).
    pub fn put_stake_event(
        &self,
        address: &Address,
        timestamp: i64,
        delta: i64,
    ) -> StorageResult<()> {
        let key = stake_key(address, timestamp);
        let mut deltas: Vec<i64> = match self.kv.get(&key)? {
            Some(bytes) => decode(&bytes)?,
            None => Vec::new(),
        };
        deltas.push(delta);
        self.kv.put(&key, &encode(&deltas)?)
    }

    /// Load an address's stake events in timestamp order.
    pub fn load_stake_events(&self, address: &Address) -> StorageResult<Vec<(i64, i64)>> {
        let prefix = stake_prefix(address);
        let mut events = Vec::new();
        for (key, bytes) in self.kv.iter_prefix(&prefix)? {
            let ts_str = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            let timestamp: i64 = ts_str
                .parse()
                .map_err(|_| StorageError::Corruption(format!("bad stake key {ts_str}")))?;
            let deltas: Vec<i64> = decode(&bytes)?;
            for delta in deltas {
                events.push((timestamp, delta));
            }
        }
        Ok(events)
    }

    /// Addresses that have ever staked.
    pub fn stake_addresses(&self) -> StorageResult<Vec<Address>> {
        let mut addresses = Vec::new();
        for (key, _) in self.kv.iter_prefix(b"stake-")? {
            let rest = &key[b"stake-".len()..];
            let text = String::from_utf8_lossy(rest);
            if let Some(addr) = text.rsplit_once('-').map(|(a, _)| a) {
                let parsed = Address::parse(addr)
                    .map_err(|_| StorageError::Corruption(format!("bad stake key {text}")))?;
                if addresses.last() != Some(&parsed) {
                    addresses.push(parsed);
                }
            }
        }
        addresses.dedup();
        Ok(addresses)
    }

    /// Flush the underlying store.
    pub fn flush(&self) -> StorageResult<()> {
        self.kv.flush()
    }
}
