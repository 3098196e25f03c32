//! blobnet — content-addressed blob exchange.
//!
//! Turns a stream descriptor hash into a reconstructed file: discover peers
//! through a Kademlia DHT, race concurrent downloads of 2 MiB
//! content-addressed blobs, verify everything on write, decrypt in order,
//! and announce what we hold back into the DHT.

pub mod config;
pub mod dht;
pub mod exchange;
pub mod store;
pub mod stream;
pub mod types;

pub use config::Config;
pub use dht::{Contact, DhtRpc, HashAnnouncer, Node, NodeId, Peer};
pub use exchange::{download_blob, BlobDownloader, BlobServer};
pub use store::{Blob, BlobError, BlobStore};
pub use stream::{create_stream, StreamDescriptor, StreamDownloader, StreamError};
pub use types::{sha384, BlobHash, MAX_BLOB_SIZE};
