//! Persistent store adapter backed by sled.

use std::path::Path;

use super::kv::{BatchOperation, KeyValueStore, WriteBatch};
use super::{StorageError, StorageResult};

/// A sled-backed key-value store.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a database under `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = sled::open(path).map_err(map_err)?;
        Ok(Self { db })
    }

    /// On-disk size estimate in bytes.
    pub fn size_on_disk(&self) -> StorageResult<u64> {
        self.db.size_on_disk().map_err(map_err)
    }
}

fn map_err(err: sled::Error) -> StorageError {
    match err {
        sled::Error::Corruption { .. } | sled::Error::ReportableBug(_) => {
            StorageError::Corruption(err.to_string())
        }
        _ => StorageError::Backend(err.to_string()),
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.db.get(key).map_err(map_err)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.db.insert(key, value).map_err(map_err)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.db.remove(key).map_err(map_err)?;
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.operations {
            match op {
                BatchOperation::Put { key, value } => sled_batch.insert(key, value),
                BatchOperation::Delete { key } => sled_batch.remove(key),
            }
        }
        self.db.apply_batch(sled_batch).map_err(map_err)
    }

    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let iter = self
            .db
            .scan_prefix(prefix)
            .filter_map(|item| item.ok())
            .map(|(k, v)| (k.to_vec(), v.to_vec()));
        Ok(Box::new(iter))
    }

    fn iter_prefix_rev(
        &self,
        prefix: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let iter = self
            .db
            .scan_prefix(prefix)
            .rev()
            .filter_map(|item| item.ok())
            .map(|(k, v)| (k.to_vec(), v.to_vec()));
        Ok(Box::new(iter))
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush().map_err(map_err)?;
        Ok(())
    }
}
