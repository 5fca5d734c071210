//! Persistent storage for the chain.
//!
//! The core only ever sees a byte-keyed transactional map: the
//! [`KeyValueStore`] capability set (get / put / delete / atomic batch /
//! prefix iteration / reverse iteration) plus an overlay-based
//! [`StoreTransaction`] with commit and rollback. `MemoryKV` backs unit
//! tests; `SledStore` backs a real node. `ChainStore` layers the typed
//! key schema on top.

pub mod db;
pub mod kv;
pub mod sled_kv;

pub use db::ChainStore;
pub use kv::{KeyValueStore, MemoryKV, StoreTransaction, WriteBatch};
pub use sled_kv::SledStore;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-level errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The backing store failed (I/O, lock poisoning, backend fault)
    #[error("Store failure: {0}")]
    Backend(String),
    /// The backing store reported inconsistent data; the node must stop
    /// accepting writes
    #[error("Store integrity violation: {0}")]
    Corruption(String),
    /// A persisted value failed to encode or decode
    #[error("Codec error: {0}")]
    Codec(String),
}
