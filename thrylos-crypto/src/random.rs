//! Secure randomness.
//!
//! All randomness that influences consensus (validator draws) or key
//! material comes from the operating system CSPRNG.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use crate::cipher::KEY_SIZE;

/// Error types for random operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RandomError {
    /// Requested bound was zero or negative
    InvalidBound,
}

impl std::fmt::Display for RandomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RandomError::InvalidBound => write!(f, "Bound must be positive"),
        }
    }
}

impl std::error::Error for RandomError {}

/// Fill a fixed-size array with OS entropy.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a fresh 32-byte symmetric key.
pub fn generate_key() -> [u8; KEY_SIZE] {
    random_bytes::<KEY_SIZE>()
}

/// Draw a uniform value in `[0, bound)` from the OS CSPRNG.
pub fn secure_random_below(bound: i64) -> Result<i64, RandomError> {
    if bound <= 0 {
        return Err(RandomError::InvalidBound);
    }
    Ok(OsRng.gen_range(0..bound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_vary() {
        let a = random_bytes::<32>();
        let b = random_bytes::<32>();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_key_size() {
        assert_eq!(generate_key().len(), KEY_SIZE);
    }

    #[test]
    fn test_secure_random_below_in_range() {
        for _ in 0..100 {
            let v = secure_random_below(7).unwrap();
            assert!((0..7).contains(&v));
        }
    }

    #[test]
    fn test_secure_random_below_rejects_bad_bound() {
        assert_eq!(secure_random_below(0), Err(RandomError::InvalidBound));
        assert_eq!(secure_random_below(-5), Err(RandomError::InvalidBound));
    }

    #[test]
    fn test_bound_one_is_zero() {
        assert_eq!(secure_random_below(1).unwrap(), 0);
    }
}
