//! Blob client: transfer one blob from one peer over TCP.

use super::wire::{
    read_json_object, BlobRequest, BlobResponse, WireError, MAX_RESPONSE_SIZE,
};
use crate::store::Blob;
use crate::types::MAX_BLOB_SIZE;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Error)]
enum ClientError {
    #[error("peer refused the request: {0}")]
    Refused(String),
    #[error("peer response violates the protocol: {0}")]
    Protocol(&'static str),
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Wire(#[from] WireError),
    #[error("{0}")]
    Blob(#[from] crate::store::BlobError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Request `blob` from one peer.
///
/// Returns bytes received plus the transport when it is still usable for
/// another request. Every failure mode comes back as `(0, None)` — the
/// caller's cue to ban the peer — and the details go to the debug log.
/// Requesting an already-verified blob is a no-op that keeps the transport.
pub async fn request_blob(
    blob: Arc<Blob>,
    address: IpAddr,
    tcp_port: u16,
    rate: f64,
    connect_timeout: Duration,
    download_timeout: Duration,
    transport: Option<TcpStream>,
) -> (u64, Option<TcpStream>) {
    if blob.is_verified() {
        return (0, transport);
    }

    let mut stream = match transport {
        Some(stream) => stream,
        None => match timeout(connect_timeout, TcpStream::connect((address, tcp_port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(peer = %address, %tcp_port, "connect failed: {e}");
                return (0, None);
            }
            Err(_) => {
                debug!(peer = %address, %tcp_port, "connect timed out");
                return (0, None);
            }
        },
    };

    match transfer(&blob, &mut stream, rate, connect_timeout, download_timeout).await {
        Ok(bytes_received) => (bytes_received, Some(stream)),
        Err(e) => {
            debug!(peer = %address, %tcp_port, blob = ?blob.hash(), "request failed: {e}");
            (0, None)
        }
    }
}

async fn transfer(
    blob: &Arc<Blob>,
    stream: &mut TcpStream,
    rate: f64,
    connect_timeout: Duration,
    download_timeout: Duration,
) -> Result<u64, ClientError> {
    let request = BlobRequest {
        blob_data_payment_rate: rate,
        requested_blob: blob.hash().to_hex(),
    };
    stream
        .write_all(&serde_json::to_vec(&request).map_err(WireError::Json)?)
        .await?;

    // response header must arrive within the connect window
    let mut buf = Vec::new();
    let header = timeout(
        connect_timeout,
        read_json_object(stream, &mut buf, MAX_RESPONSE_SIZE),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;
    let response: BlobResponse = serde_json::from_slice(&header).map_err(WireError::Json)?;

    if let Some(error) = response.error {
        return Err(ClientError::Refused(error));
    }
    if !response.rate_accepted() {
        return Err(ClientError::Refused(format!(
            "rate {:?}",
            response.blob_data_payment_rate
        )));
    }
    let incoming = response
        .incoming_blob
        .ok_or(ClientError::Protocol("accepted without incoming_blob"))?;
    if incoming.blob_hash != blob.hash() {
        return Err(ClientError::Protocol("wrong blob hash in response"));
    }
    if incoming.length == 0 || incoming.length > MAX_BLOB_SIZE {
        return Err(ClientError::Protocol("bad blob length in response"));
    }
    if let Some(known) = blob.length() {
        if known != incoming.length {
            return Err(ClientError::Protocol("length conflicts with known length"));
        }
    } else {
        blob.set_length(incoming.length);
    }

    let mut writer = blob.open_for_writing();
    let length = incoming.length;

    // bytes past the header already sit in buf
    if !buf.is_empty() {
        let take = buf.len().min(length as usize);
        writer.write(&buf[..take])?;
    }

    let mut chunk = [0u8; 16 * 1024];
    while writer.written() < length {
        if blob.is_verified() {
            // another racer finished; discard our bytes, but consume the
            // rest of the payload so the transport stays usable
            drain_exact(stream, length - writer.written(), download_timeout).await?;
            return Ok(writer.written());
        }
        let n = timeout(download_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if n == 0 {
            return Err(ClientError::Protocol("connection closed mid-blob"));
        }
        writer.write(&chunk[..n])?;
    }

    let received = writer.written();
    writer.finalize().await?;
    Ok(received)
}

async fn drain_exact(
    stream: &mut TcpStream,
    mut remaining: u64,
    download_timeout: Duration,
) -> Result<(), ClientError> {
    let mut chunk = [0u8; 16 * 1024];
    while remaining > 0 {
        let want = chunk.len().min(remaining as usize);
        let n = timeout(download_timeout, stream.read(&mut chunk[..want]))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if n == 0 {
            return Err(ClientError::Protocol("connection closed mid-blob"));
        }
        remaining -= n as u64;
    }
    Ok(())
}
