//! Runtime configuration, threaded explicitly into every component.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the blob exchange stack. Constructed once at startup and
/// shared behind an `Arc`; components never reach for globals.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one file per finished blob, named by hex hash.
    pub blob_dir: PathBuf,
    /// Directory for the metadata database.
    pub data_dir: PathBuf,

    /// TCP port we serve blobs on (advertised via DHT announces).
    pub peer_port: u16,
    /// UDP port of the DHT node.
    pub dht_port: u16,

    /// Payment rate offered when requesting blobs, in LBC per megabyte.
    pub data_rate: f64,
    /// Minimum rate we accept when serving. Zero accepts any offer.
    pub min_blob_data_payment_rate: f64,

    /// Cap on concurrent per-blob download attempts during a race.
    pub max_connections_per_download: usize,

    /// TCP connect + response header deadline per peer.
    pub peer_connect_timeout: Duration,
    /// Inactivity deadline while receiving blob payload bytes.
    pub blob_download_timeout: Duration,
    /// Outer deadline on fetching a stream descriptor blob.
    pub sd_download_timeout: Duration,
    /// Deadline on one iterative DHT search.
    pub peer_search_timeout: Duration,
    /// Deadline on a single DHT RPC.
    pub node_rpc_timeout: Duration,

    /// How long a successful announce stays fresh before republish.
    pub announce_interval: Duration,
    /// Concurrent announce operations per sweep.
    pub concurrent_announcers: usize,
    /// Announce only descriptor and head blobs rather than every blob.
    pub announce_head_and_sd_only: bool,
}

impl Config {
    /// Defaults rooted under `data_dir`, with blobs in `<data_dir>/blobfiles`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            blob_dir: data_dir.join("blobfiles"),
            data_dir,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("./data/blobfiles"),
            data_dir: PathBuf::from("./data"),
            peer_port: 3333,
            dht_port: 4444,
            data_rate: 0.0001,
            min_blob_data_payment_rate: 0.0,
            max_connections_per_download: 5,
            peer_connect_timeout: Duration::from_secs(3),
            blob_download_timeout: Duration::from_secs(20),
            sd_download_timeout: Duration::from_secs(3),
            peer_search_timeout: Duration::from_secs(60),
            node_rpc_timeout: Duration::from_secs(5),
            announce_interval: Duration::from_secs(6 * 60 * 60),
            concurrent_announcers: 10,
            announce_head_and_sd_only: true,
        }
    }
}
