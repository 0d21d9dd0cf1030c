//! Digest engine.
//!
//! Content digests for byte blobs and canonical JSON documents. Pure
//! functions; no I/O.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use stratum_core::error::{BuildError, Result};

/// Digest algorithm prefix.
pub const ALGORITHM: &str = "sha256";

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest {
    hex: String,
}

impl ContentDigest {
    /// Digest of raw bytes.
    pub fn of(data: &[u8]) -> Self {
        ContentDigest {
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Parse `sha256:<64 lowercase hex>`.
    pub fn parse(value: &str) -> Result<Self> {
        let hex = value
            .strip_prefix("sha256:")
            .ok_or_else(|| BuildError::Serialization(format!("unsupported digest '{}'", value)))?;
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(BuildError::Serialization(format!(
                "malformed sha256 digest '{}'",
                value
            )));
        }
        Ok(ContentDigest {
            hex: hex.to_string(),
        })
    }

    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.hex)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentDigest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Immutable bytes with their digest computed once.
#[derive(Clone)]
pub struct Blob {
    data: Arc<[u8]>,
    digest: ContentDigest,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        let digest = ContentDigest::of(&data);
        Blob {
            data: Arc::from(data),
            digest,
        }
    }

    /// Serialize a document canonically and wrap the bytes.
    pub fn canonical_json<T: Serialize>(document: &T) -> Result<Self> {
        Ok(Blob::new(canonical_json(document)?))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("digest", &self.digest)
            .field("size", &self.size())
            .finish()
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Blob {}

/// Canonical JSON (RFC 8785): sorted keys, no insignificant whitespace.
pub fn canonical_json<T: Serialize>(document: &T) -> Result<Vec<u8>> {
    serde_json_canonicalizer::to_vec(document)
        .map_err(|e| BuildError::Serialization(format!("canonical JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_digest_of_empty() {
        let d = ContentDigest::of(b"");
        assert_eq!(
            d.to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(d.algorithm(), "sha256");
    }

    #[test]
    fn test_digest_is_idempotent() {
        assert_eq!(ContentDigest::of(b"layer"), ContentDigest::of(b"layer"));
        assert_ne!(ContentDigest::of(b"layer"), ContentDigest::of(b"layer2"));
    }

    #[test]
    fn test_parse() {
        let d = ContentDigest::of(b"x");
        assert_eq!(ContentDigest::parse(&d.to_string()).unwrap(), d);
        assert!(ContentDigest::parse("sha512:abcd").is_err());
        assert!(ContentDigest::parse("sha256:abcd").is_err());
        assert!(ContentDigest::parse(&format!("sha256:{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn test_blob_size_and_digest() {
        let blob = Blob::new(b"hello".to_vec());
        assert_eq!(blob.size(), 5);
        assert_eq!(blob.digest(), &ContentDigest::of(b"hello"));
        assert_eq!(blob.bytes(), b"hello");
    }

    #[test]
    fn test_canonical_json_ignores_insertion_order() {
        let mut a = HashMap::new();
        a.insert("zeta", 1);
        a.insert("alpha", 2);
        a.insert("mid", 3);
        let mut b = HashMap::new();
        b.insert("mid", 3);
        b.insert("alpha", 2);
        b.insert("zeta", 1);

        let bytes = canonical_json(&a).unwrap();
        assert_eq!(bytes, canonical_json(&b).unwrap());
        assert_eq!(bytes, br#"{"alpha":2,"mid":3,"zeta":1}"#.to_vec());
    }

    #[test]
    fn test_canonical_json_nested() {
        let value = serde_json::json!({"b": {"y": 1, "x": [3, 2]}, "a": "s"});
        assert_eq!(
            canonical_json(&value).unwrap(),
            br#"{"a":"s","b":{"x":[3,2],"y":1}}"#.to_vec()
        );
    }

    #[test]
    fn test_digest_serializes_as_string() {
        let d = ContentDigest::of(b"x");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d));
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
