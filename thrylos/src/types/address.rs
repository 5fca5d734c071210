//! Thrylos addresses.
//!
//! An address is the lowercase hex encoding of the BLAKE2b-256 digest of
//! an Ed25519 public key. Externally supplied addresses are canonicalized
//! on ingress: trimmed, lowercased, and validated against the hex format.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use thrylos_crypto::PublicKey;

/// Shortest accepted address (hex chars).
pub const MIN_ADDRESS_LENGTH: usize = 40;
/// Longest accepted address (hex chars); full BLAKE2b-256 digests are 64.
pub const MAX_ADDRESS_LENGTH: usize = 64;

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{40,64}$").expect("static pattern"))
}

/// A canonicalized chain address.
///
/// The inner string is always lowercase hex, 40-64 characters. `Ord` gives
/// the lexicographic order used for validator walks and tie-breaking.
/// Deserialization goes through [`Address::parse`], so addresses are
/// canonicalized wherever they enter the process.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Address {
    /// Canonicalize and validate an externally supplied address.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let canonical = raw.trim().to_lowercase();
        if !address_regex().is_match(&canonical) {
            return Err(AddressError::InvalidFormat(raw.trim().to_string()));
        }
        Ok(Self(canonical))
    }

    /// Derive the address for a public key: `hex(BLAKE2b-256(public_key))`.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(thrylos_crypto::hash_hex(&public_key.to_bytes()))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}..)", &self.0[..8.min(self.0.len())])
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Address parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use thrylos_crypto::KeyPair;

    #[test]
    fn test_derive_from_public_key() {
        let keypair = KeyPair::from_seed(b"address test");
        let address = Address::from_public_key(&keypair.public_key());

        assert_eq!(address.as_str().len(), 64);
        assert!(Address::parse(address.as_str()).is_ok());
    }

    #[test]
    fn test_parse_canonicalizes() {
        let raw = "  1234567890ABCDEF1234567890ABCDEF12345678  ";
        let address = Address::parse(raw).unwrap();
        assert_eq!(address.as_str(), "1234567890abcdef1234567890abcdef12345678");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Address::parse("too-short").is_err());
        assert!(Address::parse("zzzz567890abcdef1234567890abcdef12345678").is_err());
        // 39 chars: one below the minimum
        assert!(Address::parse(&"a".repeat(39)).is_err());
        // 65 chars: one above the maximum
        assert!(Address::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_parse_accepts_boundary_lengths() {
        assert!(Address::parse(&"a".repeat(40)).is_ok());
        assert!(Address::parse(&"f".repeat(64)).is_ok());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = Address::parse(&"a".repeat(40)).unwrap();
        let b = Address::parse(&"b".repeat(40)).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_deserialize_goes_through_parse() {
        let upper = format!("\"{}\"", "AB".repeat(20));
        let address: Address = serde_json::from_str(&upper).unwrap();
        assert_eq!(address.as_str(), "ab".repeat(20));

        assert!(serde_json::from_str::<Address>("\"not-an-address\"").is_err());
    }

    #[test]
    fn test_derivation_deterministic() {
        let keypair = KeyPair::from_seed(b"same");
        let a = Address::from_public_key(&keypair.public_key());
        let b = Address::from_public_key(&keypair.public_key());
        assert_eq!(a, b);
    }
}
