//! Content hashes for certificate bundles.
//!
//! A bundle is identified by the SHA-256 digest of its archive bytes. On the
//! wire the digest is always 64 lowercase hex characters.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a SHA-256 digest in bytes.
pub const HASH_LEN: usize = 32;

/// Error returned when a string is not a valid hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseHashError {
    #[error("expected {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("invalid hex digest: {0}")]
    Hex(String),
}

/// SHA-256 digest of a bundle's archive bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Hash a byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(12);
        s
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != HASH_LEN * 2 {
            return Err(ParseHashError::Length {
                expected: HASH_LEN * 2,
                actual: s.len(),
            });
        }

        let mut digest = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut digest).map_err(|e| ParseHashError::Hex(e.to_string()))?;
        Ok(Self(digest))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        let hash = ContentHash::of(b"abc");
        assert_eq!(
            hash.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash.short(), "ba7816bf8f01");
    }

    #[test]
    fn test_parse_accepts_uppercase_and_whitespace() {
        let hash = ContentHash::of(b"abc");
        let parsed: ContentHash = format!("  {}\n", hash.to_hex().to_uppercase())
            .parse()
            .unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "abcd".parse::<ContentHash>(),
            Err(ParseHashError::Length { actual: 4, .. })
        ));

        let not_hex = "z".repeat(64);
        assert!(matches!(
            not_hex.parse::<ContentHash>(),
            Err(ParseHashError::Hex(_))
        ));
    }

    #[test]
    fn test_serde_uses_hex_string() {
        let hash = ContentHash::of(b"bundle");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));

        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parse_matches_hex_shape(s in "[0-9a-fA-Fg-z]{0,70}") {
                let expected = s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit());
                prop_assert_eq!(s.parse::<ContentHash>().is_ok(), expected);
            }

            #[test]
            fn short_is_prefix_of_hex(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let hash = ContentHash::of(&bytes);
                prop_assert!(hash.to_hex().starts_with(&hash.short()));
            }
        }
    }
}
