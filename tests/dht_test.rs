//! Iterative lookup and announce tests against a simulated DHT.

use blobnet::dht::{DhtError, DhtRpc, FindValueResult, HashAnnouncer, K, NODE_ID_SIZE};
use blobnet::{BlobHash, BlobStore, Config, Contact, Node, NodeId, Peer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Global-knowledge network simulation: every node answers `FIND_NODE` with
/// the globally closest contacts, and `FIND_VALUE` with its own stored
/// peers, which is all the iterative lookup needs to be exercised.
struct SimNet {
    contacts: Vec<Contact>,
    values: Mutex<HashMap<(NodeId, BlobHash), Vec<Peer>>>,
    store_calls: AtomicUsize,
}

impl SimNet {
    fn new(size: usize) -> Arc<Self> {
        let contacts = (0..size)
            .map(|i| Contact {
                id: NodeId::random(),
                address: format!("10.0.{}.{}", i / 256, i % 256).parse().unwrap(),
                udp_port: 4444,
            })
            .collect();
        Arc::new(Self {
            contacts,
            values: Mutex::new(HashMap::new()),
            store_calls: AtomicUsize::new(0),
        })
    }

    fn closest_to(&self, target: &[u8; NODE_ID_SIZE], count: usize) -> Vec<Contact> {
        let mut all = self.contacts.clone();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    /// Place a stored value (peer record) at the node closest to the hash.
    fn store_value_at_closest(&self, hash: BlobHash, peer: Peer) -> NodeId {
        let holder = self.closest_to(&hash.0, 1)[0].id;
        self.values
            .lock()
            .unwrap()
            .insert((holder, hash), vec![peer]);
        holder
    }
}

#[async_trait::async_trait]
impl DhtRpc for SimNet {
    async fn find_node(
        &self,
        _to: &Contact,
        target: [u8; NODE_ID_SIZE],
    ) -> Result<Vec<Contact>, DhtError> {
        Ok(self.closest_to(&target, K))
    }

    async fn find_value(
        &self,
        to: &Contact,
        target: [u8; NODE_ID_SIZE],
    ) -> Result<FindValueResult, DhtError> {
        let peers = self
            .values
            .lock()
            .unwrap()
            .get(&(to.id, BlobHash(target)))
            .cloned()
            .unwrap_or_default();
        Ok(FindValueResult {
            closer: self.closest_to(&target, K),
            peers,
        })
    }

    async fn store(
        &self,
        to: &Contact,
        hash: BlobHash,
        tcp_port: u16,
    ) -> Result<(), DhtError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        let peer = Peer::new("127.0.0.1".parse().unwrap(), tcp_port);
        self.values
            .lock()
            .unwrap()
            .entry((to.id, hash))
            .or_default()
            .push(peer);
        Ok(())
    }
}

fn sim_node(net: &Arc<SimNet>, external: Option<IpAddr>) -> Arc<Node> {
    let config = Arc::new(Config::default());
    let node = Node::new(NodeId::random(), config, net.clone(), external);
    // the node only knows a few bootstrap contacts; lookups walk the rest
    node.add_contacts(net.contacts.iter().take(3).cloned());
    node
}

#[tokio::test]
async fn test_iterative_find_value_walks_to_the_holder() {
    let net = SimNet::new(40);
    let node = sim_node(&net, None);

    let hash = blobnet::sha384(b"wanted");
    let provider = Peer::new("10.9.9.9".parse().unwrap(), 3333);
    net.store_value_at_closest(hash, provider);

    let (sink_tx, mut sink_rx) = mpsc::channel(8);
    let found = node.iterative_find_value(hash, Some(&sink_tx)).await;
    assert_eq!(found, vec![provider]);
    // the same batch went to the sink
    assert_eq!(sink_rx.recv().await.unwrap(), vec![provider]);
}

#[tokio::test]
async fn test_lookup_without_value_terminates_empty() {
    let net = SimNet::new(40);
    let node = sim_node(&net, None);
    let found = node
        .iterative_find_value(blobnet::sha384(b"nobody has this"), None)
        .await;
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_local_node_filtered_from_results() {
    let net = SimNet::new(20);
    let external: IpAddr = "203.0.113.7".parse().unwrap();
    let node = sim_node(&net, Some(external));

    let hash = blobnet::sha384(b"our own blob");
    // the stored peer record points back at us
    let self_peer = Peer::new(external, node.config().peer_port);
    net.store_value_at_closest(hash, self_peer);

    assert!(node.iterative_find_value(hash, None).await.is_empty());
}

#[tokio::test]
async fn test_announce_stores_at_k_nodes() {
    let net = SimNet::new(40);
    let node = sim_node(&net, None);

    let hash = blobnet::sha384(b"announce me");
    let accepted = node.announce_have_blob(hash).await;
    assert_eq!(accepted.len(), K);
    assert_eq!(net.store_calls.load(Ordering::SeqCst), K);

    // the blob is now discoverable through a fresh lookup
    let other = sim_node(&net, None);
    let found = other.iterative_find_value(hash, None).await;
    assert!(!found.is_empty());
}

fn open_store(dir: &Path) -> Arc<BlobStore> {
    Arc::new(BlobStore::open(&dir.join("blobfiles"), &dir.join("db")).unwrap())
}

async fn put_finished_blob(store: &BlobStore, content: &[u8]) -> BlobHash {
    let hash = blobnet::sha384(content);
    let blob = store.get_blob(hash, None).await.unwrap();
    let mut writer = blob.open_for_writing();
    writer.write(content).unwrap();
    writer.finalize().await.unwrap();
    hash
}

#[tokio::test]
async fn test_announce_cycle_respects_interval() {
    let net = SimNet::new(40);
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    // announce times are tracked at second resolution
    let mut config = Config::with_data_dir(dir.path().to_path_buf());
    config.announce_interval = Duration::from_secs(2);
    let config = Arc::new(config);

    let node = Node::new(NodeId::random(), config.clone(), net.clone(), None);
    node.add_contacts(net.contacts.iter().take(3).cloned());

    let hash = put_finished_blob(&store, b"refresh me").await;
    store.mark_should_announce(&hash, true).unwrap();

    let announcer = HashAnnouncer::new(node, store.clone(), config.clone());

    // first sweep announces to k nodes and records the time
    announcer.manage().await;
    assert_eq!(net.store_calls.load(Ordering::SeqCst), K);

    // within the interval nothing is due
    announcer.manage().await;
    assert_eq!(net.store_calls.load(Ordering::SeqCst), K);

    // past the interval it re-announces exactly once more
    tokio::time::sleep(Duration::from_millis(2200)).await;
    announcer.manage().await;
    assert_eq!(net.store_calls.load(Ordering::SeqCst), 2 * K);
}
