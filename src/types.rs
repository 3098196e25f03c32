//! Core identifiers and constants for the blob exchange stack.
//!
//! Hashes and node ids are binary internally; hex appears only at external
//! boundaries (wire JSON, filesystem names, CLI arguments).

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha384};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of a blob hash / DHT node id in bytes (SHA-384).
pub const HASH_SIZE: usize = 48;

/// Width of a blob hash in lowercase hex characters.
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;

/// Maximum size of a single blob (2 MiB).
/// This is a network-wide constant: peers reject anything larger, and the
/// stream format assumes it. Do not change without a protocol version bump.
pub const MAX_BLOB_SIZE: u64 = 2 * 1024 * 1024;

/// AES block width; non-final stream blobs carry a whole number of blocks.
pub const AES_BLOCK_SIZE: usize = 16;

/// Identity of a blob: SHA-384 over its content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHash(pub [u8; HASH_SIZE]);

impl BlobHash {
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from lowercase hex. Uppercase is rejected: hashes are
    /// lowercase everywhere on the wire and on disk.
    pub fn from_hex(s: &str) -> Result<Self, InvalidHash> {
        if s.len() != HASH_HEX_SIZE || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(InvalidHash);
        }
        let mut out = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut out).map_err(|_| InvalidHash)?;
        Ok(Self(out))
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 hex chars are enough to identify a blob in logs
        write!(f, "{}…", &self.to_hex()[..8])
    }
}

impl FromStr for BlobHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for BlobHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid blob hash: expected {HASH_HEX_SIZE} lowercase hex characters")]
pub struct InvalidHash;

/// SHA-384 of a byte slice. CPU cost is ~1 ms/MiB; callers hashing whole
/// blobs must run this off the event loop.
pub fn sha384(data: &[u8]) -> BlobHash {
    let digest = Sha384::digest(data);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    BlobHash(out)
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
