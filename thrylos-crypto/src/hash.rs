//! BLAKE2b-256 hashing.
//!
//! Every identifier in the chain is a BLAKE2b-256 digest: addresses are
//! derived from public keys, transaction ids from canonical transaction
//! bytes, block hashes from header fields and the merkle root.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// Digest size in bytes.
pub const HASH_SIZE: usize = 32;

type Blake2b256 = Blake2b<U32>;

/// Incremental BLAKE2b-256 hasher.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Blake2b256,
}

impl Hasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Self {
            inner: Blake2b256::new(),
        }
    }

    /// Absorb data into the hash state.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the 32-byte digest.
    pub fn finalize(self) -> [u8; HASH_SIZE] {
        self.inner.finalize().into()
    }
}

/// One-shot BLAKE2b-256 digest.
pub fn hash(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// One-shot digest rendered as lowercase hex.
pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(hash(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = hash(b"thrylos");
        let b = hash(b"thrylos");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_avalanche() {
        let a = hash(b"thrylos");
        let b = hash(b"thrylot");
        assert_ne!(a, b);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"thry");
        hasher.update(b"los");
        assert_eq!(hasher.finalize(), hash(b"thrylos"));
    }

    #[test]
    fn test_hash_hex_length() {
        let h = hash_hex(b"address material");
        assert_eq!(h.len(), HASH_SIZE * 2);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, h.to_lowercase());
    }
}
