//! Content hash types and utilities.
//!
//! The cache names blobs by a 64-bit xxHash of their bytes and pointer
//! records by the same hash of the reference string. The hash is a dedup
//! key, not a cryptographic commitment.

use std::fmt;
use xxhash_rust::xxh64::{xxh64, Xxh64};

/// A 64-bit xxHash content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(u64);

impl ContentHash {
    /// Create a ContentHash from a raw value.
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Compute the hash of a byte slice in one shot.
    pub fn compute(data: &[u8]) -> Self {
        Self(xxh64(data, 0))
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Xxh64::new(0))
    }

    /// Parse from a 16-character lowercase hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 16 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 16 hex chars, got {}",
                s.len()
            )));
        }
        let value = u64::from_str_radix(s, 16)
            .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        Ok(Self(value))
    }

    /// Encode as a zero-padded lowercase hex string.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental xxHash64 hasher for single-pass stream hashing.
pub struct ContentHasher(Xxh64);

impl ContentHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::compute(b"hello world");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 16);
        let parsed = ContentHash::from_hex(&hex).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = ContentHash::hasher();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), ContentHash::compute(data));
    }

    #[test]
    fn test_distinct_content_distinct_hash() {
        assert_ne!(ContentHash::compute(b"v1"), ContentHash::compute(b"v2"));
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentHash::from_hex("zz").is_err());
        assert!(ContentHash::from_hex("not-hex-not-hex!").is_err());
    }
}
