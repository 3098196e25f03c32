//! Blob exchange: wire protocol, per-peer client, serving side, and the
//! peer-racing downloader.

pub mod client;
pub mod downloader;
pub mod server;
pub mod wire;

pub use client::request_blob;
pub use downloader::BlobDownloader;
pub use server::BlobServer;
pub use wire::{BlobRequest, BlobResponse, IncomingBlob};

use crate::config::Config;
use crate::dht::{Node, Peer};
use crate::store::{BlobError, BlobStore};
use crate::types::BlobHash;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One-shot diagnostic download: race a fresh DHT search for `hash` and
/// return the verified bytes. `seed_peers` join the race alongside whatever
/// the search finds. The search task dies with this call; the search queue
/// sender stays alive until the race resolves.
pub async fn download_blob(
    config: Arc<Config>,
    store: Arc<BlobStore>,
    node: &Arc<Node>,
    hash: BlobHash,
    seed_peers: Vec<Peer>,
) -> Result<Vec<u8>, BlobError> {
    let (search_tx, search_rx) = mpsc::channel(config.max_connections_per_download.max(1));
    let (peer_tx, peer_rx, _search_task) = node.accumulate_peers(search_rx);
    let _ = search_tx.send(hash).await;
    if !seed_peers.is_empty() {
        let _ = peer_tx.try_send(seed_peers);
    }

    let mut downloader = BlobDownloader::new(config, store, peer_tx, peer_rx);
    let result = downloader.download_blob(hash, None).await;
    downloader.close();
    result?.read_all().await
}
