//! Symmetric ciphers.
//!
//! Two schemes, matching their two uses in the node:
//!
//! - [`PayloadCipher`]: AES-256-CFB with a random IV prepended to the
//!   ciphertext. Used for the optional at-rest encryption of transaction
//!   input/output payloads, where the surrounding transaction is already
//!   signed and integrity comes from the signature.
//! - [`AtRestCipher`]: AES-256-GCM with a random nonce prepended. Used for
//!   secrets the store must never hold in the clear (private keys), where
//!   authenticated encryption is required.

use aes::Aes256;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key size (AES-256).
pub const KEY_SIZE: usize = 32;
/// CFB initialization vector size (one AES block).
pub const IV_SIZE: usize = 16;
/// GCM nonce size.
pub const NONCE_SIZE: usize = 12;

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// Error types for cipher operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Key is not 32 bytes
    InvalidKeyLength,
    /// Ciphertext shorter than its IV/nonce prefix
    CiphertextTooShort,
    /// GCM authentication tag mismatch
    AuthenticationFailed,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::InvalidKeyLength => write!(f, "Invalid key length (expected 32 bytes)"),
            CipherError::CiphertextTooShort => write!(f, "Ciphertext too short"),
            CipherError::AuthenticationFailed => write!(f, "Authentication tag verification failed"),
        }
    }
}

impl std::error::Error for CipherError {}

/// AES-256-CFB cipher for transaction payloads.
///
/// Output layout: `IV (16 bytes) ‖ ciphertext`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadCipher {
    key: [u8; KEY_SIZE],
}

impl PayloadCipher {
    /// Create a cipher from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| CipherError::InvalidKeyLength)?;
        Ok(Self { key })
    }

    /// Encrypt under a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let mut out = Vec::with_capacity(IV_SIZE + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);

        let enc = Aes256CfbEnc::new(&self.key.into(), &iv.into());
        enc.encrypt(&mut out[IV_SIZE..]);
        out
    }

    /// Decrypt an IV-prefixed ciphertext.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < IV_SIZE {
            return Err(CipherError::CiphertextTooShort);
        }
        let (iv, ciphertext) = data.split_at(IV_SIZE);
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| CipherError::CiphertextTooShort)?;

        let mut out = ciphertext.to_vec();
        let dec = Aes256CfbDec::new(&self.key.into(), &iv.into());
        dec.decrypt(&mut out);
        Ok(out)
    }
}

/// AES-256-GCM AEAD for secrets persisted to the store.
///
/// Output layout: `nonce (12 bytes) ‖ ciphertext ‖ tag`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AtRestCipher {
    key: [u8; KEY_SIZE],
}

impl AtRestCipher {
    /// Create a cipher from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| CipherError::InvalidKeyLength)?;
        Ok(Self { key })
    }

    /// Encrypt and authenticate under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new(&self.key.into());

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        // Aes256Gcm::encrypt only fails on plaintext longer than the GCM
        // limit of ~64 GiB, unreachable for store values.
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .unwrap_or_default();

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt and verify a nonce-prefixed ciphertext.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_SIZE {
            return Err(CipherError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new(&self.key.into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::AuthenticationFailed)
    }
}
