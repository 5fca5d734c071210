//! Transactions: construction, signing, canonical encoding, verification.
//!
//! A transaction spends previously unspent outputs owned by its sender and
//! creates new outputs of equal total value. The signature covers a
//! canonical, length-prefixed encoding with the signature field omitted;
//! input/output payloads are optionally encrypted at rest with AES-CFB.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use thrylos_crypto::{KeyPair, PayloadCipher, PublicKey, Signature};

use super::{Address, Utxo, UtxoRef};
use crate::storage::StorageError;
use crate::{ChainError, ChainResult};

/// A value-transfer transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique id, the hex BLAKE2b-256 digest of the transaction contents
    pub id: String,
    /// Address whose outputs are being spent
    pub sender: Address,
    /// Unix seconds at creation; must be within the recency window
    pub timestamp: i64,
    /// References to the unspent outputs being consumed
    pub inputs: Vec<UtxoRef>,
    /// Outputs created by this transaction
    pub outputs: Vec<Utxo>,
    /// Ed25519 signature over the canonical encoding
    #[serde(default)]
    pub signature: Vec<u8>,
    /// Informational references to earlier transactions; never verified
    #[serde(default)]
    pub previous_tx_ids: Vec<String>,
    /// AES-CFB encrypted serialization of the full input outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_inputs: Option<Vec<u8>>,
    /// AES-CFB encrypted serialization of the outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_outputs: Option<Vec<u8>>,
}

impl Transaction {
    /// Assemble an unsigned transaction. Output ids and indices are fixed
    /// up to the derived transaction id.
    pub fn new(
        sender: Address,
        inputs: Vec<UtxoRef>,
        outputs: Vec<(Address, i64)>,
        previous_tx_ids: Vec<String>,
        timestamp: i64,
    ) -> Self {
        let id = derive_id(&sender, timestamp, &inputs, &outputs);
        let outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(i, (owner, amount))| Utxo::new(id.clone(), i as u32, owner, amount))
            .collect();

        Self {
            id,
            sender,
            timestamp,
            inputs,
            outputs,
            signature: Vec::new(),
            previous_tx_ids,
            encrypted_inputs: None,
            encrypted_outputs: None,
        }
    }

    /// Build, optionally encrypt, and sign a transaction in one step.
    ///
    /// `spent_inputs` are the full outputs being consumed; their references
    /// go into the signed body while their serialized forms (amounts
    /// included) are encrypted under `cipher` for at-rest confidentiality.
    pub fn create_and_sign(
        sender: Address,
        spent_inputs: &[Utxo],
        outputs: Vec<(Address, i64)>,
        previous_tx_ids: Vec<String>,
        timestamp: i64,
        cipher: Option<&PayloadCipher>,
        keypair: &KeyPair,
    ) -> ChainResult<Self> {
        let refs = spent_inputs.iter().map(Utxo::reference).collect();
        let mut tx = Self::new(sender, refs, outputs, previous_tx_ids, timestamp);

        if let Some(cipher) = cipher {
            let inputs_bytes = bincode::serialize(spent_inputs)
                .map_err(|e| StorageError::Codec(e.to_string()))?;
            let outputs_bytes = bincode::serialize(&tx.outputs)
                .map_err(|e| StorageError::Codec(e.to_string()))?;
            tx.encrypted_inputs = Some(cipher.encrypt(&inputs_bytes));
            tx.encrypted_outputs = Some(cipher.encrypt(&outputs_bytes));
        }

        tx.sign(keypair);
        Ok(tx)
    }

    /// Canonical signing bytes: fields in fixed order (id, sender,
    /// timestamp, inputs, outputs, previous_tx_ids), each length-prefixed,
    /// signature omitted. Stable across implementations.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        put_str(&mut buf, &self.id);
        put_str(&mut buf, self.sender.as_str());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());

        buf.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            put_str(&mut buf, &input.transaction_id);
            buf.extend_from_slice(&input.index.to_le_bytes());
        }

        buf.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            put_str(&mut buf, &output.transaction_id);
            buf.extend_from_slice(&output.index.to_le_bytes());
            put_str(&mut buf, output.owner.as_str());
            buf.extend_from_slice(&output.amount.to_le_bytes());
        }

        buf.extend_from_slice(&(self.previous_tx_ids.len() as u32).to_le_bytes());
        for id in &self.previous_tx_ids {
            put_str(&mut buf, id);
        }

        buf
    }

    /// Sign the canonical bytes with the sender's key.
    pub fn sign(&mut self, keypair: &KeyPair) {
        let message = self.canonical_bytes();
        self.signature = keypair.sign(&message).to_bytes().to_vec();
    }

    /// Verify the signature against a known public key.
    pub fn verify_signature(&self, public_key: &PublicKey) -> Result<(), TransactionError> {
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| TransactionError::SignatureInvalid)?;
        public_key
            .verify(&self.canonical_bytes(), &signature)
            .map_err(|_| TransactionError::SignatureInvalid)
    }

    /// Total value of the outputs.
    pub fn output_total(&self) -> i64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Decrypt the at-rest output payload, if present.
    pub fn decrypt_outputs(&self, cipher: &PayloadCipher) -> ChainResult<Option<Vec<Utxo>>> {
        match &self.encrypted_outputs {
            None => Ok(None),
            Some(data) => {
                let plain = cipher.decrypt(data)?;
                let outputs =
                    bincode::deserialize(&plain).map_err(|e| StorageError::Codec(e.to_string()))?;
                Ok(Some(outputs))
            }
        }
    }

    /// Approximate serialized size, used for block size accounting.
    pub fn encoded_size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Derive a transaction id from its contents (sender, timestamp, input
/// references, output owners and amounts).
fn derive_id(
    sender: &Address,
    timestamp: i64,
    inputs: &[UtxoRef],
    outputs: &[(Address, i64)],
) -> String {
    let mut hasher = thrylos_crypto::Hasher::new();
    hasher.update(sender.as_str().as_bytes());
    hasher.update(&timestamp.to_le_bytes());
    for input in inputs {
        hasher.update(input.transaction_id.as_bytes());
        hasher.update(&input.index.to_le_bytes());
    }
    for (owner, amount) in outputs {
        hasher.update(owner.as_str().as_bytes());
        hasher.update(&amount.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Read access to the current UTXO set, as needed by verification.
pub trait UtxoView {
    /// Fetch the output named by `input` under `owner`'s key space,
    /// spent or not.
    fn lookup_for(&self, owner: &Address, input: &UtxoRef) -> Result<Option<Utxo>, StorageError>;

    /// Fetch the output named by `input` regardless of owner. Only called
    /// on failure paths to tell a missing output from a foreign one.
    fn lookup_any(&self, input: &UtxoRef) -> Result<Option<Utxo>, StorageError>;
}

/// Verify a transaction against the current UTXO set.
///
/// Checks, in order: inputs non-empty, signature over the canonical bytes,
/// every input exists / is unspent / is owned by the sender, conservation
/// of value, and timestamp recency.
pub fn verify<V: UtxoView>(
    tx: &Transaction,
    view: &V,
    lookup_pubkey: impl Fn(&Address) -> Option<PublicKey>,
    now: i64,
    recency_window: i64,
) -> ChainResult<()> {
    if tx.inputs.is_empty() {
        return Err(ChainError::Transaction(TransactionError::MalformedInput(
            "no inputs".into(),
        )));
    }
    for output in &tx.outputs {
        if output.amount <= 0 {
            return Err(
                TransactionError::MalformedInput("non-positive output amount".into()).into(),
            );
        }
    }

    let public_key =
        lookup_pubkey(&tx.sender).ok_or(TransactionError::SignatureInvalid)?;
    tx.verify_signature(&public_key)?;

    let mut input_total: i64 = 0;
    for input in &tx.inputs {
        match view.lookup_for(&tx.sender, input)? {
            Some(utxo) if utxo.spent => {
                return Err(TransactionError::DoubleSpend(input.to_string()).into());
            }
            Some(utxo) => input_total += utxo.amount,
            None => {
                // Not under the sender's keys: either absent or foreign.
                return match view.lookup_any(input)? {
                    Some(_) => Err(TransactionError::NotOwned(input.to_string()).into()),
                    None => Err(TransactionError::UnknownInput(input.to_string()).into()),
                };
            }
        }
    }

    let output_total = tx.output_total();
    if input_total != output_total {
        return Err(TransactionError::Unconserved {
            input_total,
            output_total,
        }
        .into());
    }

    if (now - tx.timestamp).abs() > recency_window {
        return Err(TransactionError::StaleTimestamp(tx.timestamp).into());
    }

    Ok(())
}

/// Verify a batch of independent transactions in parallel.
///
/// Results are collected deterministically, keyed by transaction id.
pub fn verify_batch<V>(
    txs: &[Transaction],
    view: &V,
    lookup_pubkey: impl Fn(&Address) -> Option<PublicKey> + Sync,
    now: i64,
    recency_window: i64,
) -> BTreeMap<String, bool>
where
    V: UtxoView + Sync,
{
    txs.par_iter()
        .map(|tx| {
            let ok = verify(tx, view, &lookup_pubkey, now, recency_window).is_ok();
            (tx.id.clone(), ok)
        })
        .collect()
}

/// Sign a batch of transactions with one key, in parallel.
pub fn sign_batch(txs: &mut [Transaction], keypair: &KeyPair) {
    txs.par_iter_mut().for_each(|tx| tx.sign(keypair));
}

/// Transaction-level errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("Malformed transaction: {0}")]
    MalformedInput(String),
    #[error("Signature verification failed")]
    SignatureInvalid,
    #[error("Referenced output {0} not found")]
    UnknownInput(String),
    #[error("Referenced output {0} is already spent")]
    DoubleSpend(String),
    #[error("Referenced output {0} is not owned by the sender")]
    NotOwned(String),
    #[error("Value not conserved: inputs {input_total}, outputs {output_total}")]
    Unconserved { input_total: i64, output_total: i64 },
    #[error("Timestamp {0} outside the recency window")]
    StaleTimestamp(i64),
    #[error("Transaction {0} already known")]
    DuplicateId(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapView(HashMap<(Address, UtxoRef), Utxo>);

    impl UtxoView for MapView {
        fn lookup_for(
            &self,
            owner: &Address,
            input: &UtxoRef,
        ) -> Result<Option<Utxo>, StorageError> {
            Ok(self.0.get(&(owner.clone(), input.clone())).cloned())
        }

        fn lookup_any(&self, input: &UtxoRef) -> Result<Option<Utxo>, StorageError> {
            Ok(self
                .0
                .iter()
                .find(|(key, _)| key.1 == *input)
                .map(|(_, u)| u.clone()))
        }
    }

    fn keyed_address(seed: &[u8]) -> (KeyPair, Address) {
        let keypair = KeyPair::from_seed(seed);
        let address = Address::from_public_key(&keypair.public_key());
        (keypair, address)
    }

    fn funded_view(owner: &Address, amount: i64) -> (MapView, Utxo) {
        let utxo = Utxo::new("genesis-tx", 0, owner.clone(), amount);
        let mut map = HashMap::new();
        map.insert((owner.clone(), utxo.reference()), utxo.clone());
        (MapView(map), utxo)
    }

    fn transfer(
        sender_kp: &KeyPair,
        sender: &Address,
        input: &Utxo,
        to: &Address,
        amount: i64,
        now: i64,
    ) -> Transaction {
        let change = input.amount - amount;
        let mut outputs = vec![(to.clone(), amount)];
        if change > 0 {
            outputs.push((sender.clone(), change));
        }
        Transaction::create_and_sign(
            sender.clone(),
            std::slice::from_ref(input),
            outputs,
            vec![],
            now,
            None,
            sender_kp,
        )
        .unwrap()
    }

    #[test]
    fn test_sign_then_verify() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let (view, utxo) = funded_view(&alice, 250);
        let now = 1_700_000_000;

        let tx = transfer(&alice_kp, &alice, &utxo, &bob, 100, now);
        let pk = alice_kp.public_key();
        assert!(verify(&tx, &view, |_| Some(pk.clone()), now, 3600).is_ok());
    }

    #[test]
    fn test_canonical_bytes_exclude_signature() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let utxo = Utxo::new("t", 0, alice.clone(), 10);

        let mut tx = transfer(&alice_kp, &alice, &utxo, &bob, 10, 1_700_000_000);
        let before = tx.canonical_bytes();
        tx.signature = vec![0xFF; 64];
        assert_eq!(tx.canonical_bytes(), before);
    }

    #[test]
    fn test_tampered_amount_fails_signature() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let (view, utxo) = funded_view(&alice, 250);
        let now = 1_700_000_000;

        let mut tx = transfer(&alice_kp, &alice, &utxo, &bob, 100, now);
        tx.outputs[0].amount = 150;
        tx.outputs[1].amount = 100;

        let pk = alice_kp.public_key();
        let err = verify(&tx, &view, |_| Some(pk.clone()), now, 3600).unwrap_err();
        assert_eq!(
            err,
            ChainError::Transaction(TransactionError::SignatureInvalid)
        );
    }

    #[test]
    fn test_unknown_input() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let now = 1_700_000_000;

        let phantom = Utxo::new("missing-tx", 0, alice.clone(), 50);
        let tx = transfer(&alice_kp, &alice, &phantom, &bob, 50, now);

        let view = MapView(HashMap::new());
        let pk = alice_kp.public_key();
        let err = verify(&tx, &view, |_| Some(pk.clone()), now, 3600).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Transaction(TransactionError::UnknownInput(_))
        ));
    }

    #[test]
    fn test_double_spend_detected() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let now = 1_700_000_000;

        let (mut view, utxo) = funded_view(&alice, 100);
        let tx = transfer(&alice_kp, &alice, &utxo, &bob, 100, now);

        // Flip the stored copy to spent, as the ledger does on apply.
        view.0.get_mut(&(alice.clone(), utxo.reference())).unwrap().spent = true;

        let pk = alice_kp.public_key();
        let err = verify(&tx, &view, |_| Some(pk.clone()), now, 3600).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Transaction(TransactionError::DoubleSpend(_))
        ));
    }

    #[test]
    fn test_not_owned() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, carol) = keyed_address(b"carol");
        let (_, bob) = keyed_address(b"bob");
        let now = 1_700_000_000;

        // The output exists, but belongs to carol.
        let foreign = Utxo::new("carols-tx", 0, carol.clone(), 80);
        let mut map = HashMap::new();
        map.insert((carol.clone(), foreign.reference()), foreign.clone());
        let view = MapView(map);

        let tx = transfer(&alice_kp, &alice, &foreign, &bob, 80, now);
        let pk = alice_kp.public_key();
        let err = verify(&tx, &view, |_| Some(pk.clone()), now, 3600).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Transaction(TransactionError::NotOwned(_))
        ));
    }

    #[test]
    fn test_unconserved() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let now = 1_700_000_000;
        let (view, utxo) = funded_view(&alice, 250);

        // Outputs sum to 200 against a 250 input.
        let tx = Transaction::create_and_sign(
            alice.clone(),
            std::slice::from_ref(&utxo),
            vec![(bob.clone(), 200)],
            vec![],
            now,
            None,
            &alice_kp,
        )
        .unwrap();

        let pk = alice_kp.public_key();
        let err = verify(&tx, &view, |_| Some(pk.clone()), now, 3600).unwrap_err();
        assert_eq!(
            err,
            ChainError::Transaction(TransactionError::Unconserved {
                input_total: 250,
                output_total: 200,
            })
        );
    }

    #[test]
    fn test_stale_timestamp() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let now = 1_700_000_000;
        let (view, utxo) = funded_view(&alice, 100);

        let tx = transfer(&alice_kp, &alice, &utxo, &bob, 100, now - 7200);
        let pk = alice_kp.public_key();
        let err = verify(&tx, &view, |_| Some(pk.clone()), now, 3600).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Transaction(TransactionError::StaleTimestamp(_))
        ));
    }

    #[test]
    fn test_encrypted_payload_round_trip() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let cipher = PayloadCipher::new(&thrylos_crypto::generate_key()).unwrap();
        let utxo = Utxo::new("t", 0, alice.clone(), 100);

        let tx = Transaction::create_and_sign(
            alice.clone(),
            std::slice::from_ref(&utxo),
            vec![(bob.clone(), 100)],
            vec![],
            1_700_000_000,
            Some(&cipher),
            &alice_kp,
        )
        .unwrap();

        assert!(tx.encrypted_inputs.is_some());
        let outputs = tx.decrypt_outputs(&cipher).unwrap().unwrap();
        assert_eq!(outputs, tx.outputs);
    }

    #[test]
    fn test_verify_batch_deterministic_keys() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let now = 1_700_000_000;
        let (view, utxo) = funded_view(&alice, 100);

        let good = transfer(&alice_kp, &alice, &utxo, &bob, 100, now);
        let mut bad = good.clone();
        bad.signature = vec![0u8; 64];

        let pk = alice_kp.public_key();
        let results = verify_batch(
            &[good.clone(), bad.clone()],
            &view,
            |_| Some(pk.clone()),
            now,
            3600,
        );
        assert_eq!(results.get(&good.id), Some(&true));
        // The tampered copy shares the id; last write wins in the map, so
        // build a distinct bad transaction instead.
        let other = Utxo::new("other", 0, alice.clone(), 10);
        let mut distinct_bad = transfer(&alice_kp, &alice, &other, &bob, 10, now);
        distinct_bad.signature = vec![0u8; 64];
        let results = verify_batch(
            &[good.clone(), distinct_bad.clone()],
            &view,
            |_| Some(pk.clone()),
            now,
            3600,
        );
        assert_eq!(results.get(&good.id), Some(&true));
        assert_eq!(results.get(&distinct_bad.id), Some(&false));
    }

    #[test]
    fn test_sign_batch_signs_everything() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");

        let mut txs: Vec<Transaction> = (0..8)
            .map(|i| {
                Transaction::new(
                    alice.clone(),
                    vec![UtxoRef::new(format!("in-{i}"), 0)],
                    vec![(bob.clone(), 10)],
                    vec![],
                    1_700_000_000 + i,
                )
            })
            .collect();

        sign_batch(&mut txs, &alice_kp);
        let pk = alice_kp.public_key();
        for tx in &txs {
            assert!(tx.verify_signature(&pk).is_ok());
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let (alice_kp, alice) = keyed_address(b"alice");
        let (_, bob) = keyed_address(b"bob");
        let utxo = Utxo::new("t", 0, alice.clone(), 100);
        let tx = transfer(&alice_kp, &alice, &utxo, &bob, 100, 1_700_000_000);

        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, tx);
    }
}
