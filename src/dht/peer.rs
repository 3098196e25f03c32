//! Peer and contact records.
//!
//! A `Peer` is where blobs come from: `(address, tcp_port)`. A `Contact` is
//! who answers DHT RPCs: `(id, address, udp_port)`. The same machine usually
//! backs both, but the two identities are kept distinct on purpose.

use super::node_id::NodeId;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Mutex;

/// A blob exchange peer. Equality and hashing cover `(address, tcp_port)`
/// only — the node id is advisory and may be learned later.
#[derive(Clone, Copy, Debug)]
pub struct Peer {
    pub address: IpAddr,
    pub tcp_port: u16,
    pub node_id: Option<NodeId>,
}

impl Peer {
    pub fn new(address: IpAddr, tcp_port: u16) -> Self {
        Self {
            address,
            tcp_port,
            node_id: None,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.tcp_port == other.tcp_port
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.tcp_port.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.tcp_port)
    }
}

/// A DHT routing contact.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Contact {
    pub id: NodeId,
    pub address: IpAddr,
    pub udp_port: u16,
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}:{}", self.id, self.address, self.udp_port)
    }
}

/// Owns the canonical peer records, keyed by `(address, tcp_port)`.
/// Everything that materializes peers from DHT results goes through here, so
/// a node id learned once sticks to the record.
#[derive(Default)]
pub struct PeerManager {
    known: Mutex<HashMap<(IpAddr, u16), Option<NodeId>>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_peer(&self, address: IpAddr, tcp_port: u16, node_id: Option<NodeId>) -> Peer {
        let mut known = self.known.lock().expect("peer manager lock poisoned");
        let entry = known.entry((address, tcp_port)).or_insert(None);
        if node_id.is_some() {
            *entry = node_id;
        }
        Peer {
            address,
            tcp_port,
            node_id: *entry,
        }
    }

    pub fn known_count(&self) -> usize {
        self.known.lock().expect("peer manager lock poisoned").len()
    }
}
