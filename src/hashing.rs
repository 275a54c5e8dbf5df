//! Streaming digests used throughout the ledger.
//!
//! SHA-256 is the default and only digest required for verification of
//! any ledger produced by this crate; BLAKE3 is available behind the
//! `blake3` feature for callers that want a faster digest for their own
//! auxiliary tooling (it is never used for `entry_hash`/`merkle_root`,
//! which must stay SHA-256 for cross-implementation compatibility).

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::Result;
use crate::serialization::{canonical_json, Value};

/// A streaming SHA-256 hasher.
#[derive(Default)]
pub struct Hasher(Sha256);

impl Hasher {
    /// Creates a new, empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Feeds a canonicalized payload into the digest.
    pub fn update_value(&mut self, value: &Value) -> Result<&mut Self> {
        let bytes = canonical_json(value)?;
        self.0.update(bytes);
        Ok(self)
    }

    /// Consumes the hasher, returning the lowercase hex digest.
    pub fn finish_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// SHA-256 of raw bytes, as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a canonicalized payload, as lowercase hex. This is the
/// `payload_hash` computation used by the Receipt Engine and re-derived by
/// the Verifier.
pub fn hash_value(value: &Value) -> Result<String> {
    let bytes = canonical_json(value)?;
    Ok(sha256_hex(&bytes))
}

/// Concatenates the bytes of each path (in the order given, treating a
/// missing file as empty) and returns the SHA-256 digest of the
/// concatenation. Used by cross-tool reproducibility checks (e.g.
/// comparing a rebuilt index file set against the original).
pub fn hash_paths<P: AsRef<Path>>(sorted_paths: &[P]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in sorted_paths {
        if let Ok(bytes) = std::fs::read(path) {
            hasher.update(&bytes);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// BLAKE3 of raw bytes, as lowercase hex. Available only when the
/// `blake3` feature is enabled; intentionally separate from the SHA-256
/// path used by the ledger's own integrity fields.
#[cfg(feature = "blake3")]
pub fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
