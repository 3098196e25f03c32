//! Blob exchange wire format.
//!
//! Messages are JSON objects with no length prefix: a message ends at the
//! first byte that completes a balanced JSON object, and for blob data
//! responses the raw payload bytes follow immediately. Field names and the
//! rate sentinel strings are fixed by the deployed network.
//!
//! Every message has an explicit size cap, checked while reading. A peer
//! cannot make us buffer more than the cap plus one read chunk.

use crate::types::BlobHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on an incoming request object.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;
/// Cap on an incoming response header object.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024;

pub const RATE_ACCEPTED: &str = "RATE_ACCEPTED";
pub const RATE_TOO_LOW: &str = "RATE_TOO_LOW";
pub const RATE_UNSET: &str = "RATE_UNSET";
pub const ERR_BLOB_UNAVAILABLE: &str = "BLOB_UNAVAILABLE";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message exceeds size cap")]
    TooLarge,
    #[error("malformed message framing")]
    Malformed,
    #[error("connection closed")]
    Closed,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Client → server: one blob request with a payment-rate offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRequest {
    pub blob_data_payment_rate: f64,
    pub requested_blob: String,
}

/// Server → client response header; blob bytes follow when `incoming_blob`
/// is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_data_payment_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_blob: Option<IncomingBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BlobResponse {
    pub fn rate_accepted(&self) -> bool {
        self.blob_data_payment_rate.as_deref() == Some(RATE_ACCEPTED)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingBlob {
    pub blob_hash: BlobHash,
    pub length: u64,
}

/// Index one past the end of the first balanced JSON object in `buf`, if a
/// complete object is present. Tracks strings and escapes so braces inside
/// string values don't confuse the depth count.
pub fn json_object_end(buf: &[u8]) -> Result<Option<usize>, WireError> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut started = false;

    for (i, &b) in buf.iter().enumerate() {
        if !started {
            if b.is_ascii_whitespace() {
                continue;
            }
            if b != b'{' {
                return Err(WireError::Malformed);
            }
            started = true;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1).ok_or(WireError::Malformed)?;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Read one balanced JSON object from `reader`, buffering through `buf`.
/// Bytes past the object (payload, or a pipelined request) stay in `buf`.
pub async fn read_json_object<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> Result<Vec<u8>, WireError> {
    loop {
        if let Some(end) = json_object_end(buf)? {
            if end > cap {
                return Err(WireError::TooLarge);
            }
            let object: Vec<u8> = buf.drain(..end).collect();
            return Ok(object);
        }
        if buf.len() > cap {
            return Err(WireError::TooLarge);
        }
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(WireError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
