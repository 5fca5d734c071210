//! Key-value store capability and in-memory implementation.
//!
//! Any store providing this capability set can back the node; the
//! in-memory implementation exists for unit tests and ephemeral nodes.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::StorageResult;

/// Byte-keyed store capability: point reads and writes, atomic batch
/// commit, forward and reverse iteration by key prefix.
pub trait KeyValueStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Delete a key.
    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Check if a key exists.
    fn exists(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Apply a batch of writes atomically: all land or none do.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Iterate entries whose keys start with `prefix`, in key order.
    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;

    /// Iterate entries whose keys start with `prefix`, in reverse key
    /// order. Used to find the chain tip under the `block-` prefix.
    fn iter_prefix_rev(
        &self,
        prefix: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;

    /// Flush buffered writes to durable storage.
    fn flush(&self) -> StorageResult<()>;
}

/// Batched write operations.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    /// Operations to perform, in order
    pub operations: Vec<BatchOperation>,
}

/// Single batch operation.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Put a key-value pair
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Delete a key
    Delete { key: Vec<u8> },
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch with capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            operations: Vec::with_capacity(capacity),
        }
    }

    /// Queue a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(BatchOperation::Put { key, value });
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.operations.push(BatchOperation::Delete { key });
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A store transaction: an overlay of uncommitted writes over a base
/// store. Reads see the overlay first; `commit` lands every write as one
/// atomic batch, dropping the transaction discards them all.
pub struct StoreTransaction<'a> {
    base: &'a dyn KeyValueStore,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> StoreTransaction<'a> {
    /// Begin a transaction over `base`.
    pub fn begin(base: &'a dyn KeyValueStore) -> Self {
        Self {
            base,
            overlay: BTreeMap::new(),
        }
    }

    /// Read through the overlay, falling back to the base store.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if let Some(value) = self.overlay.get(key) {
            return Ok(value.clone());
        }
        self.base.get(key)
    }

    /// Stage a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert(key, Some(value));
    }

    /// Stage a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.overlay.insert(key, None);
    }

    /// Number of staged writes.
    pub fn pending(&self) -> usize {
        self.overlay.len()
    }

    /// Commit every staged write atomically.
    pub fn commit(self) -> StorageResult<()> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::with_capacity(self.overlay.len());
        for (key, value) in self.overlay {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        self.base.write_batch(batch)
    }

    /// Discard every staged write.
    pub fn rollback(self) {
        drop(self);
    }
}

/// In-memory store backed by a sorted map.
#[derive(Debug, Default)]
pub struct MemoryKV {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKV {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore for MemoryKV {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut data = self.data.write();
        for op in batch.operations {
            match op {
                BatchOperation::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let items = self.collect_prefix(prefix);
        Ok(Box::new(items.into_iter()))
    }

    fn iter_prefix_rev(
        &self,
        prefix: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let items = self.collect_prefix(prefix);
        Ok(Box::new(items.into_iter().rev()))
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl MemoryKV {
    fn collect_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        data.range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
