//! blobnet node binary.
//!
//! Thin dispatcher over the library: serve blobs, publish files as
//! encrypted streams, and download streams or single blobs. The DHT RPC
//! codec of the deployed network plugs in behind `DhtRpc`; this binary
//! ships with a stub transport, so peers are supplied with `--peer` until a
//! transport is wired up.

use blobnet::dht::{DhtError, DhtRpc, FindValueResult, NODE_ID_SIZE};
use blobnet::{
    create_stream, BlobHash, BlobServer, BlobStore, Config, Contact, HashAnnouncer, Node, NodeId,
    Peer, StreamDownloader,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "blobnet", version, about = "Content-addressed blob exchange node")]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// TCP port to serve blobs on
    #[arg(short, long, default_value = "3333")]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve local blobs to peers and keep announcing them
    Serve,
    /// Publish a file as an encrypted stream, printing its sd hash
    Create { path: PathBuf },
    /// Download a stream by sd hash
    Download {
        sd_hash: String,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        /// Output file name (defaults to the stream's suggested name)
        #[arg(short, long)]
        file_name: Option<String>,
        /// Known peers to race, ip:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
    },
    /// Download a single blob and print where it landed
    GetBlob {
        blob_hash: String,
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
    },
    /// List finished blobs
    List,
    /// Delete blobs by hash
    Delete { hashes: Vec<String> },
    /// Force an immediate announce of specific blobs
    Announce { hashes: Vec<String> },
}

/// Placeholder transport: answers every RPC with nothing. Discovery comes
/// from `--peer` until the deployed wire codec is plugged in.
struct StubRpc;

#[async_trait::async_trait]
impl DhtRpc for StubRpc {
    async fn find_node(
        &self,
        _to: &Contact,
        _target: [u8; NODE_ID_SIZE],
    ) -> Result<Vec<Contact>, DhtError> {
        Ok(Vec::new())
    }

    async fn find_value(
        &self,
        _to: &Contact,
        _target: [u8; NODE_ID_SIZE],
    ) -> Result<FindValueResult, DhtError> {
        Ok(FindValueResult::default())
    }

    async fn store(&self, _to: &Contact, _hash: BlobHash, _tcp_port: u16) -> Result<(), DhtError> {
        Err(DhtError::Unreachable("stub transport".into()))
    }
}

fn parse_hashes(raw: &[String]) -> Result<Vec<BlobHash>, String> {
    raw.iter()
        .map(|s| BlobHash::from_hex(s).map_err(|e| format!("{s}: {e}")))
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blobnet=info".parse().expect("static directive parses")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::with_data_dir(args.data_dir.clone());
    config.peer_port = args.port;
    let config = Arc::new(config);

    let store = match BlobStore::open(&config.blob_dir, &config.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open blob store: {e}");
            return;
        }
    };
    let node = Node::new(NodeId::random(), config.clone(), Arc::new(StubRpc), None);

    info!("blobnet v{VERSION}");

    match args.command {
        Command::Serve => {
            let listener =
                match tokio::net::TcpListener::bind(("0.0.0.0", config.peer_port)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("failed to bind port {}: {e}", config.peer_port);
                        return;
                    }
                };
            let server = BlobServer::new(store.clone(), config.min_blob_data_payment_rate);
            let server_task = server.start(listener);
            let announcer = HashAnnouncer::new(node, store.clone(), config);
            let announce_task = announcer.start();

            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
            server_task.abort();
            announce_task.abort();
            let _ = store.flush();
        }

        Command::Create { path } => match create_stream(&store, &config, &path, None).await {
            Ok(created) => {
                println!("{}", created.sd_hash.to_hex());
                info!(
                    blobs = created.descriptor.data_blobs().len(),
                    "stream created"
                );
                let _ = store.flush();
            }
            Err(e) => error!("create failed: {e}"),
        },

        Command::Download {
            sd_hash,
            out_dir,
            file_name,
            peers,
        } => {
            let Ok(sd_hash) = BlobHash::from_hex(&sd_hash) else {
                error!("invalid sd hash");
                return;
            };
            let mut downloader = StreamDownloader::new(config, store, node);
            downloader.add_fixed_peers(
                peers
                    .iter()
                    .map(|addr| Peer::new(addr.ip(), addr.port()))
                    .collect(),
            );
            match downloader.download_stream(sd_hash, &out_dir, file_name).await {
                Ok(path) => println!("{}", path.display()),
                Err(e) => error!("download failed: {e}"),
            }
        }

        Command::GetBlob { blob_hash, peers } => {
            let Ok(hash) = BlobHash::from_hex(&blob_hash) else {
                error!("invalid blob hash");
                return;
            };
            let seed_peers: Vec<Peer> = peers
                .iter()
                .map(|addr| Peer::new(addr.ip(), addr.port()))
                .collect();
            match blobnet::download_blob(config, store, &node, hash, seed_peers).await {
                Ok(bytes) => println!("{} ({} bytes)", hash.to_hex(), bytes.len()),
                Err(e) => error!("download failed: {e}"),
            }
        }

        Command::List => {
            for hash in store.completed_hashes() {
                println!("{}", hash.to_hex());
            }
        }

        Command::Delete { hashes } => match parse_hashes(&hashes) {
            Ok(hashes) => {
                if let Err(e) = store.delete(&hashes).await {
                    error!("delete failed: {e}");
                }
                let _ = store.flush();
            }
            Err(e) => error!("{e}"),
        },

        Command::Announce { hashes } => match parse_hashes(&hashes) {
            Ok(hashes) => {
                let announcer = HashAnnouncer::new(node, store, config);
                announcer.announce(hashes).await;
            }
            Err(e) => error!("{e}"),
        },
    }
}
