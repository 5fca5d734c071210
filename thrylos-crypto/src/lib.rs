//! # thrylos-crypto
//!
//! Cryptographic primitives for the Thrylos blockchain node.
//!
//! ## Modules
//! - `hash` - BLAKE2b-256 hashing (identifiers, block hashes, merkle nodes)
//! - `signature` - Ed25519 key pairs, signing and verification
//! - `cipher` - AES-256-CFB payload encryption and AES-256-GCM at-rest AEAD
//! - `random` - OS-entropy helpers and uniform bounded sampling
//!
//! All secret material (private keys, symmetric keys) is zeroized on drop.

pub mod cipher;
pub mod hash;
pub mod random;
pub mod signature;

pub use cipher::{AtRestCipher, CipherError, PayloadCipher};
pub use hash::{hash, hash_hex, Hasher, HASH_SIZE};
pub use random::{generate_key, random_bytes, secure_random_below, RandomError};
pub use signature::{KeyPair, PublicKey, Signature, SignatureError};
