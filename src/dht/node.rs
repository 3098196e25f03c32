//! DHT node: iterative Kademlia operations over a pluggable RPC transport.
//!
//! The concrete UDP codec is inherited from the deployed network and lives
//! behind [`DhtRpc`]; everything here is the lookup logic itself. Routing
//! table maintenance beyond what lookups learn is the transport's business.

use super::node_id::{NodeId, NODE_ID_SIZE};
use super::peer::{Contact, Peer, PeerManager};
use super::routing::{RoutingTable, K};
use crate::config::Config;
use crate::types::BlobHash;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

/// Lookup parallelism — the Kademlia `α`.
pub const ALPHA: usize = 3;

/// Consecutive no-progress rounds before a lookup bottoms out.
pub const BOTTOM_OUT_LIMIT: usize = 3;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("rpc timed out")]
    Timeout,
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("rejected by remote node: {0}")]
    Rejected(String),
}

/// What a `FIND_VALUE` brings back: nodes closer to the target, and peer
/// records for nodes that actually store the value.
#[derive(Debug, Clone, Default)]
pub struct FindValueResult {
    pub closer: Vec<Contact>,
    pub peers: Vec<Peer>,
}

/// The deployed network's RPC surface, one call per Kademlia message.
#[async_trait::async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    async fn find_node(
        &self,
        to: &Contact,
        target: [u8; NODE_ID_SIZE],
    ) -> Result<Vec<Contact>, DhtError>;

    async fn find_value(
        &self,
        to: &Contact,
        target: [u8; NODE_ID_SIZE],
    ) -> Result<FindValueResult, DhtError>;

    /// Ask `to` to record that we serve `hash` on `tcp_port`.
    async fn store(&self, to: &Contact, hash: BlobHash, tcp_port: u16) -> Result<(), DhtError>;
}

pub struct Node {
    id: NodeId,
    /// Our address as peers see it; used to filter ourselves out of results.
    external_address: Option<IpAddr>,
    advertised_tcp_port: u16,
    config: Arc<Config>,
    rpc: Arc<dyn DhtRpc>,
    routing: Mutex<RoutingTable>,
    peer_manager: PeerManager,
}

enum LookupKind {
    Value,
    Node,
}

impl Node {
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        rpc: Arc<dyn DhtRpc>,
        external_address: Option<IpAddr>,
    ) -> Arc<Self> {
        let advertised_tcp_port = config.peer_port;
        Arc::new(Self {
            id,
            external_address,
            advertised_tcp_port,
            config,
            rpc,
            routing: Mutex::new(RoutingTable::new(id)),
            peer_manager: PeerManager::new(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Seed the routing table, e.g. from bootstrap nodes.
    pub fn add_contacts(&self, contacts: impl IntoIterator<Item = Contact>) {
        let mut routing = self.routing.lock().expect("routing lock poisoned");
        for contact in contacts {
            routing.add(contact);
        }
    }

    pub fn contact_count(&self) -> usize {
        self.routing.lock().expect("routing lock poisoned").len()
    }

    fn is_self(&self, peer: &Peer) -> bool {
        self.external_address == Some(peer.address) && peer.tcp_port == self.advertised_tcp_port
    }

    /// Iterative `FIND_VALUE` for a blob hash. Peer batches are pushed into
    /// `sink` as they are discovered and the complete set is returned.
    pub async fn iterative_find_value(
        &self,
        target: BlobHash,
        sink: Option<&mpsc::Sender<Vec<Peer>>>,
    ) -> Vec<Peer> {
        let (_, peers) = self.lookup(target.0, LookupKind::Value, sink).await;
        peers
    }

    /// One full search for a hash: the `peer_list` diagnostic.
    pub async fn peer_list(&self, target: BlobHash) -> Vec<Peer> {
        self.iterative_find_value(target, None).await
    }

    /// Converge on the `k` nodes closest to `hash` and issue `STORE` to each.
    /// Returns the ids that accepted.
    pub async fn announce_have_blob(&self, hash: BlobHash) -> Vec<NodeId> {
        let (closest, _) = self.lookup(hash.0, LookupKind::Node, None).await;
        if closest.is_empty() {
            return Vec::new();
        }

        let mut stores: JoinSet<Option<NodeId>> = JoinSet::new();
        for contact in closest.into_iter().take(K) {
            let rpc = self.rpc.clone();
            let tcp_port = self.advertised_tcp_port;
            let rpc_timeout = self.config.node_rpc_timeout;
            stores.spawn(async move {
                match timeout(rpc_timeout, rpc.store(&contact, hash, tcp_port)).await {
                    Ok(Ok(())) => Some(contact.id),
                    Ok(Err(e)) => {
                        debug!(%contact, "store rejected: {e}");
                        None
                    }
                    Err(_) => {
                        debug!(%contact, "store timed out");
                        None
                    }
                }
            });
        }
        let mut accepted = Vec::new();
        while let Some(res) = stores.join_next().await {
            if let Ok(Some(id)) = res {
                accepted.push(id);
            }
        }
        accepted
    }

    /// Wave-based iterative lookup: query the `α` closest unqueried contacts
    /// in parallel, fold responses into the shortlist, stop once the
    /// shortlist is exhausted or no round has produced a closer contact for
    /// `BOTTOM_OUT_LIMIT` rounds.
    async fn lookup(
        &self,
        target: [u8; NODE_ID_SIZE],
        kind: LookupKind,
        sink: Option<&mpsc::Sender<Vec<Peer>>>,
    ) -> (Vec<Contact>, Vec<Peer>) {
        let mut shortlist = {
            let routing = self.routing.lock().expect("routing lock poisoned");
            routing.closest(&target, K)
        };
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut known: HashSet<NodeId> = shortlist.iter().map(|c| c.id).collect();
        let mut found: Vec<Peer> = Vec::new();
        let mut found_set: HashSet<Peer> = HashSet::new();
        let mut best = shortlist.first().map(|c| c.id.distance(&target));
        let mut stale_rounds = 0usize;

        loop {
            shortlist.sort_by_key(|c| c.id.distance(&target));
            // only the k closest matter: once they are all queried, we are done
            let candidates: Vec<Contact> = shortlist
                .iter()
                .take(K)
                .filter(|c| !queried.contains(&c.id))
                .take(ALPHA)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let mut wave: JoinSet<(Contact, Result<FindValueResult, DhtError>)> = JoinSet::new();
            for contact in candidates {
                queried.insert(contact.id);
                let rpc = self.rpc.clone();
                let rpc_timeout = self.config.node_rpc_timeout;
                let value_mode = matches!(kind, LookupKind::Value);
                wave.spawn(async move {
                    let call = async {
                        if value_mode {
                            rpc.find_value(&contact, target).await
                        } else {
                            rpc.find_node(&contact, target).await.map(|closer| {
                                FindValueResult {
                                    closer,
                                    peers: Vec::new(),
                                }
                            })
                        }
                    };
                    let result = match timeout(rpc_timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(DhtError::Timeout),
                    };
                    (contact, result)
                });
            }

            let mut round_progress = false;
            while let Some(joined) = wave.join_next().await {
                let Ok((contact, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(response) => {
                        {
                            let mut routing =
                                self.routing.lock().expect("routing lock poisoned");
                            routing.add(contact);
                            for closer in &response.closer {
                                routing.add(closer.clone());
                            }
                        }
                        for closer in response.closer {
                            if closer.id == self.id || !known.insert(closer.id) {
                                continue;
                            }
                            let distance = closer.id.distance(&target);
                            if best.map_or(true, |b| distance < b) {
                                best = Some(distance);
                                round_progress = true;
                            }
                            shortlist.push(closer);
                        }
                        let mut batch = Vec::new();
                        for peer in response.peers {
                            let peer = self.peer_manager.make_peer(
                                peer.address,
                                peer.tcp_port,
                                peer.node_id,
                            );
                            if self.is_self(&peer) || !found_set.insert(peer) {
                                continue;
                            }
                            batch.push(peer);
                        }
                        if !batch.is_empty() {
                            found.extend(batch.iter().copied());
                            if let Some(sink) = sink {
                                let _ = sink.send(batch).await;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%contact, "lookup rpc failed: {e}");
                        let mut routing = self.routing.lock().expect("routing lock poisoned");
                        routing.remove(&contact.id);
                    }
                }
            }

            if round_progress {
                stale_rounds = 0;
            } else {
                stale_rounds += 1;
                if stale_rounds >= BOTTOM_OUT_LIMIT {
                    debug!("lookup bottomed out");
                    break;
                }
            }
        }

        shortlist.sort_by_key(|c| c.id.distance(&target));
        shortlist.truncate(K);
        (shortlist, found)
    }
}
