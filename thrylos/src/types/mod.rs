//! Core data structures for the Thrylos chain.

pub mod address;
pub mod block;
pub mod transaction;
pub mod utxo;

pub use address::{Address, AddressError};
pub use block::{compute_merkle_root, Block, BlockError, BlockHash};
pub use transaction::{Transaction, TransactionError, UtxoView};
pub use utxo::{Utxo, UtxoRef};
