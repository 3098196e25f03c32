//! Stream descriptor: the JSON document that names a stream's blobs.
//!
//! The descriptor's bytes are themselves a blob, so its serialization is part
//! of the content-addressing contract: object keys are emitted in
//! lexicographic order with compact separators, and re-encoding a parsed
//! canonical document is byte-equal. Changing the byte layout would change
//! every `sd_hash` on the network.

use super::crypt::{IV_SIZE, KEY_SIZE};
use crate::types::{sha384, BlobHash, MAX_BLOB_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("descriptor lists no blobs")]
    NoBlobs,
    #[error("descriptor must end with a single zero-length terminator")]
    BadTerminator,
    #[error("blob numbers are not the sequence 0..n-1")]
    BadBlobNums,
    #[error("data blob {0} has invalid length")]
    BadBlobLength(u32),
    #[error("data blob {0} is missing its hash")]
    MissingBlobHash(u32),
    #[error("stream key must be 32 hex characters")]
    BadKey,
    #[error("blob {0} IV must be 32 hex characters")]
    BadIv(u32),
    #[error("stream name fields must be hex-encoded UTF-8")]
    BadName,
    #[error("stream_hash does not match descriptor contents")]
    StreamHashMismatch,
}

/// One entry of the descriptor's `blobs` list. The terminator entry has
/// `length == 0` and no `blob_hash`; every other entry has both.
///
/// Field order is the canonical (lexicographic) key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_hash: Option<BlobHash>,
    pub blob_num: u32,
    pub iv: String,
    pub length: u64,
}

impl BlobInfo {
    pub fn is_terminator(&self) -> bool {
        self.length == 0 && self.blob_hash.is_none()
    }

    pub fn iv_bytes(&self) -> Result<[u8; IV_SIZE], DescriptorError> {
        let raw = hex::decode(&self.iv).map_err(|_| DescriptorError::BadIv(self.blob_num))?;
        raw.try_into()
            .map_err(|_| DescriptorError::BadIv(self.blob_num))
    }
}

/// Parsed stream descriptor. Field order is the canonical key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamDescriptor {
    pub blobs: Vec<BlobInfo>,
    pub key: String,
    pub stream_hash: String,
    pub stream_name: String,
    pub suggested_file_name: String,
}

impl StreamDescriptor {
    /// Decode and fully validate descriptor bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let descriptor: Self = serde_json::from_slice(bytes)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Canonical bytes. Keys come out in struct declaration order, which is
    /// the lexicographic order the format requires.
    pub fn serialize(&self) -> Vec<u8> {
        // a descriptor built from validated fields always encodes
        serde_json::to_vec(self).expect("descriptor serialization cannot fail")
    }

    /// Hash of the canonical bytes: the stream's `sd_hash`.
    pub fn sd_hash(&self) -> BlobHash {
        sha384(&self.serialize())
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        let blobs = &self.blobs;
        if blobs.is_empty() {
            return Err(DescriptorError::NoBlobs);
        }
        let last = blobs.len() - 1;
        for (i, info) in blobs.iter().enumerate() {
            if info.blob_num as usize != i {
                return Err(DescriptorError::BadBlobNums);
            }
            if hex::decode(&info.iv)
                .map(|raw| raw.len() != IV_SIZE)
                .unwrap_or(true)
            {
                return Err(DescriptorError::BadIv(info.blob_num));
            }
            if i == last {
                if !info.is_terminator() {
                    return Err(DescriptorError::BadTerminator);
                }
            } else {
                if info.length == 0 || info.length > MAX_BLOB_SIZE {
                    return Err(DescriptorError::BadBlobLength(info.blob_num));
                }
                if info.blob_hash.is_none() {
                    return Err(DescriptorError::MissingBlobHash(info.blob_num));
                }
            }
        }
        if blobs.len() == 1 {
            // a terminator alone describes nothing
            return Err(DescriptorError::NoBlobs);
        }
        if hex::decode(&self.key)
            .map(|raw| raw.len() != KEY_SIZE)
            .unwrap_or(true)
        {
            return Err(DescriptorError::BadKey);
        }
        decode_hex_utf8(&self.stream_name)?;
        decode_hex_utf8(&self.suggested_file_name)?;
        if self.stream_hash != self.compute_stream_hash() {
            return Err(DescriptorError::StreamHashMismatch);
        }
        Ok(())
    }

    /// Deterministic digest over the descriptor's identifying fields. The
    /// hex-string fields contribute their ASCII bytes; numbers contribute
    /// plain decimal digits; the terminator's absent hash contributes
    /// nothing.
    pub fn compute_stream_hash(&self) -> String {
        let mut hasher = Sha384::new();
        hasher.update(self.stream_name.as_bytes());
        hasher.update(self.key.as_bytes());
        hasher.update(self.suggested_file_name.as_bytes());
        for info in &self.blobs {
            if let Some(hash) = &info.blob_hash {
                hasher.update(hash.to_hex().as_bytes());
            }
            hasher.update(info.blob_num.to_string().as_bytes());
            hasher.update(info.iv.as_bytes());
            hasher.update(info.length.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn key_bytes(&self) -> Result<[u8; KEY_SIZE], DescriptorError> {
        let raw = hex::decode(&self.key).map_err(|_| DescriptorError::BadKey)?;
        raw.try_into().map_err(|_| DescriptorError::BadKey)
    }

    /// Decoded `stream_name`.
    pub fn name(&self) -> Result<String, DescriptorError> {
        decode_hex_utf8(&self.stream_name)
    }

    /// Decoded `suggested_file_name`.
    pub fn suggested_file_name(&self) -> Result<String, DescriptorError> {
        decode_hex_utf8(&self.suggested_file_name)
    }

    /// The entries to download, in order: everything but the terminator.
    pub fn data_blobs(&self) -> &[BlobInfo] {
        &self.blobs[..self.blobs.len() - 1]
    }
}

fn decode_hex_utf8(s: &str) -> Result<String, DescriptorError> {
    let raw = hex::decode(s).map_err(|_| DescriptorError::BadName)?;
    String::from_utf8(raw).map_err(|_| DescriptorError::BadName)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sha384;

    fn sample() -> StreamDescriptor {
        let mut d = StreamDescriptor {
            blobs: vec![
                BlobInfo {
                    blob_hash: Some(sha384(b"first data blob")),
                    blob_num: 0,
                    iv: "aa".repeat(16),
                    length: 32,
                },
                BlobInfo {
                    blob_hash: Some(sha384(b"second data blob")),
                    blob_num: 1,
                    iv: "bb".repeat(16),
                    length: 48,
                },
                BlobInfo {
                    blob_hash: None,
                    blob_num: 2,
                    iv: "cc".repeat(16),
                    length: 0,
                },
            ],
            key: "0f".repeat(16),
            stream_hash: String::new(),
            stream_name: hex::encode("My Stream"),
            suggested_file_name: hex::encode("my_stream.bin"),
        };
        d.stream_hash = d.compute_stream_hash();
        d
    }

    #[test]
    fn test_round_trip_both_directions() {
        let d = sample();
        let bytes = d.serialize();
        let parsed = StreamDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed, d);
        // byte-equal re-encoding is the content-addressing contract
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_canonical_key_order() {
        let bytes = sample().serialize();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\"blobs\":[{\"blob_hash\":\""));
        let key_pos = text.find("\"key\":").unwrap();
        let sh_pos = text.find("\"stream_hash\":").unwrap();
        let sn_pos = text.find("\"stream_name\":").unwrap();
        let sf_pos = text.find("\"suggested_file_name\":").unwrap();
        assert!(key_pos < sh_pos && sh_pos < sn_pos && sn_pos < sf_pos);
        // compact separators only
        assert!(!text.contains(": "));
        assert!(!text.contains(", "));
    }

    #[test]
    fn test_terminator_has_no_hash_key() {
        let text = String::from_utf8(sample().serialize()).unwrap();
        assert_eq!(text.matches("\"blob_hash\"").count(), 2);
    }

    #[test]
    fn test_stream_hash_is_deterministic_and_binding() {
        let d = sample();
        assert_eq!(d.compute_stream_hash(), sample().compute_stream_hash());

        let mut tampered = d.clone();
        tampered.blobs[0].length = 33;
        assert_ne!(d.compute_stream_hash(), tampered.compute_stream_hash());
        // tampered descriptor no longer parses
        assert!(matches!(
            StreamDescriptor::parse(&tampered.serialize()),
            Err(DescriptorError::StreamHashMismatch)
        ));
    }

    #[test]
    fn test_rejects_schema_violations() {
        // missing terminator
        let mut d = sample();
        d.blobs.pop();
        d.stream_hash = d.compute_stream_hash();
        assert!(matches!(
            StreamDescriptor::parse(&d.serialize()),
            Err(DescriptorError::BadTerminator)
        ));

        // non-contiguous blob_num
        let mut d = sample();
        d.blobs[1].blob_num = 5;
        d.stream_hash = d.compute_stream_hash();
        assert!(matches!(
            StreamDescriptor::parse(&d.serialize()),
            Err(DescriptorError::BadBlobNums)
        ));

        // zero-length data blob
        let mut d = sample();
        d.blobs[0].length = 0;
        d.stream_hash = d.compute_stream_hash();
        assert!(StreamDescriptor::parse(&d.serialize()).is_err());

        // bad key width
        let mut d = sample();
        d.key = "0f".repeat(8);
        d.stream_hash = d.compute_stream_hash();
        assert!(matches!(
            StreamDescriptor::parse(&d.serialize()),
            Err(DescriptorError::BadKey)
        ));

        // bad IV
        let mut d = sample();
        d.blobs[1].iv = "zz".repeat(16);
        d.stream_hash = d.compute_stream_hash();
        assert!(StreamDescriptor::parse(&d.serialize()).is_err());

        // terminator alone
        let mut d = sample();
        d.blobs = vec![BlobInfo {
            blob_hash: None,
            blob_num: 0,
            iv: "cc".repeat(16),
            length: 0,
        }];
        d.stream_hash = d.compute_stream_hash();
        assert!(matches!(
            StreamDescriptor::parse(&d.serialize()),
            Err(DescriptorError::NoBlobs)
        ));

        // unknown key
        assert!(StreamDescriptor::parse(b"{\"blobs\":[],\"key\":\"\",\"stream_hash\":\"\",\"stream_name\":\"\",\"suggested_file_name\":\"\",\"extra\":1}").is_err());

        assert!(StreamDescriptor::parse(b"not json").is_err());
    }

    #[test]
    fn test_single_blob_stream_is_valid() {
        let mut d = sample();
        d.blobs.remove(1);
        d.blobs[1].blob_num = 1;
        d.stream_hash = d.compute_stream_hash();
        let parsed = StreamDescriptor::parse(&d.serialize()).unwrap();
        assert_eq!(parsed.data_blobs().len(), 1);
    }
}
