//! Serving side of the blob exchange protocol.
//!
//! Accepts TCP connections and answers blob requests until the peer hangs
//! up. Only `Finished` blobs are ever served; a pending blob is
//! indistinguishable from an absent one on the wire.

use super::wire::{
    read_json_object, BlobRequest, BlobResponse, IncomingBlob, WireError, ERR_BLOB_UNAVAILABLE,
    MAX_REQUEST_SIZE, RATE_ACCEPTED, RATE_TOO_LOW, RATE_UNSET,
};
use crate::store::BlobStore;
use crate::types::BlobHash;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct BlobServer {
    store: Arc<BlobStore>,
    min_rate: f64,
}

impl BlobServer {
    pub fn new(store: Arc<BlobStore>, min_rate: f64) -> Arc<Self> {
        Arc::new(Self { store, min_rate })
    }

    /// Accept loop. Runs until the returned handle is aborted.
    pub fn start(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "blob server listening");
            }
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                debug!(%peer, "connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        debug!("accept failed: {e}");
                    }
                }
            }
        })
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), WireError> {
        let mut buf = Vec::new();
        loop {
            let object = match read_json_object(&mut stream, &mut buf, MAX_REQUEST_SIZE).await {
                Ok(object) => object,
                Err(WireError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let request: BlobRequest = serde_json::from_slice(&object)?;
            let (response, payload) = self.answer(&request, peer).await;
            stream.write_all(&serde_json::to_vec(&response)?).await?;
            if let Some(bytes) = payload {
                stream.write_all(&bytes).await?;
            }
        }
    }

    /// Build the response header and, when the blob is available, its bytes.
    /// The bytes are read before the header goes out so an accepted request
    /// is never left hanging without its payload.
    async fn answer(
        &self,
        request: &BlobRequest,
        peer: SocketAddr,
    ) -> (BlobResponse, Option<Vec<u8>>) {
        let rate = request.blob_data_payment_rate;
        if rate < 0.0 {
            return (
                BlobResponse {
                    blob_data_payment_rate: Some(RATE_UNSET.to_string()),
                    ..Default::default()
                },
                None,
            );
        }
        if rate < self.min_rate {
            debug!(%peer, rate, "rate too low");
            return (
                BlobResponse {
                    blob_data_payment_rate: Some(RATE_TOO_LOW.to_string()),
                    ..Default::default()
                },
                None,
            );
        }

        let unavailable = || {
            (
                BlobResponse {
                    blob_data_payment_rate: Some(RATE_ACCEPTED.to_string()),
                    error: Some(ERR_BLOB_UNAVAILABLE.to_string()),
                    ..Default::default()
                },
                None,
            )
        };

        let Ok(hash) = BlobHash::from_hex(&request.requested_blob) else {
            return unavailable();
        };
        let Ok(Some(blob)) = self.store.finished_blob(hash).await else {
            return unavailable();
        };
        let Ok(bytes) = blob.read_all().await else {
            return unavailable();
        };

        debug!(%peer, blob = ?hash, length = bytes.len(), "serving blob");
        (
            BlobResponse {
                blob_data_payment_rate: Some(RATE_ACCEPTED.to_string()),
                incoming_blob: Some(IncomingBlob {
                    blob_hash: hash,
                    length: bytes.len() as u64,
                }),
                ..Default::default()
            },
            Some(bytes),
        )
    }
}
