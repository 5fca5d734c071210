//! Ed25519 signing and verification.
//!
//! Wraps `ed25519-dalek` behind the small surface the node needs: seeded
//! and random key generation, signing, and verification against a stored
//! public key. Private key material is zeroized on drop by the underlying
//! implementation.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

use crate::hash;

/// Public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Error types for signature operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Public key bytes are not a valid curve point
    InvalidPublicKey,
    /// Signature bytes have the wrong length or structure
    InvalidSignature,
    /// Signature did not verify against the message
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidPublicKey => write!(f, "Invalid public key"),
            SignatureError::InvalidSignature => write!(f, "Invalid signature format"),
            SignatureError::VerificationFailed => write!(f, "Signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// An Ed25519 key pair.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a new key pair from OS entropy.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    /// Derive a key pair deterministically from arbitrary seed bytes.
    ///
    /// The seed is hashed to 32 bytes first, so any length is accepted.
    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = hash::hash(seed);
        Self {
            signing: SigningKey::from_bytes(&digest),
        }
    }

    /// Reconstruct a key pair from raw private key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    /// Export the raw private key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose private key material, even in debug output.
        write!(f, "KeyPair({})", hex::encode(self.public_key().to_bytes()))
    }
}

/// An Ed25519 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse a public key from its 32-byte encoding.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, SignatureError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| SignatureError::InvalidPublicKey)
    }

    /// Parse a public key from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        Self::from_bytes(&arr)
    }

    /// Serialize to the 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0
            .verify(message, &sig)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Parse a signature from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; SIGNATURE_SIZE] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidSignature)?;
        Ok(Self(arr))
    }

    /// The raw 64 signature bytes.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", &hex::encode(self.0)[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::from_seed(b"signer");
        let message = b"value transfer";

        let sig = keypair.sign(message);
        assert!(keypair.public_key().verify(message, &sig).is_ok());
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let keypair = KeyPair::from_seed(b"signer");
        let sig = keypair.sign(b"original");

        assert_eq!(
            keypair.public_key().verify(b"tampered", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let alice = KeyPair::from_seed(b"alice");
        let bob = KeyPair::from_seed(b"bob");
        let sig = alice.sign(b"message");

        assert!(bob.public_key().verify(b"message", &sig).is_err());
    }

    #[test]
    fn test_from_seed_deterministic() {
        let a = KeyPair::from_seed(b"same seed");
        let b = KeyPair::from_seed(b"same seed");
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_public_key_roundtrip() {
        let keypair = KeyPair::generate();
        let bytes = keypair.public_key().to_bytes();
        let parsed = PublicKey::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, keypair.public_key());
    }

    #[test]
    fn test_signature_slice_roundtrip() {
        let keypair = KeyPair::from_seed(b"k");
        let sig = keypair.sign(b"m");
        let parsed = Signature::from_slice(&sig.to_bytes()).unwrap();
        assert_eq!(parsed, sig);

        assert!(Signature::from_slice(&[0u8; 12]).is_err());
    }
}
