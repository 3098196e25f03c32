//! Peer finder: turns a queue of blob hashes into a queue of peer batches.

use super::node::Node;
use super::peer::Peer;
use crate::types::BlobHash;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::debug;

/// Capacity of the peer queue, in batches. Producers drop batches rather
/// than block forever when the consumer has wandered off.
const PEER_QUEUE_CAPACITY: usize = 64;

/// Handle to a running peer accumulator. Dropping it cancels the
/// accumulator and every in-flight search, which closes the peer queue.
pub struct SearchTask(JoinHandle<()>);

impl SearchTask {
    pub fn abort(&self) {
        self.0.abort();
    }
}

impl Drop for SearchTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Node {
    /// Spawn a background task that reads blob hashes from `search_rx` and
    /// feeds discovered peers into the returned queue.
    ///
    /// Searches for the same hash coalesce: while one is in flight, further
    /// requests attach to it instead of restarting it. Each search is
    /// bounded by `peer_search_timeout` and ends quietly with whatever it
    /// found. The sender half of the peer queue is handed back so the
    /// consumer can requeue peers it wants to revisit.
    pub fn accumulate_peers(
        self: &Arc<Self>,
        mut search_rx: mpsc::Receiver<BlobHash>,
    ) -> (
        mpsc::Sender<Vec<Peer>>,
        mpsc::Receiver<Vec<Peer>>,
        SearchTask,
    ) {
        let (peer_tx, peer_rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let node = self.clone();
        let sink = peer_tx.clone();

        let handle = tokio::spawn(async move {
            let mut in_flight: HashSet<BlobHash> = HashSet::new();
            let mut searches: JoinSet<BlobHash> = JoinSet::new();
            loop {
                tokio::select! {
                    request = search_rx.recv() => match request {
                        Some(hash) => {
                            if !in_flight.insert(hash) {
                                debug!(blob = ?hash, "attaching to in-flight search");
                                continue;
                            }
                            let node = node.clone();
                            let sink = sink.clone();
                            let deadline = node.config().peer_search_timeout;
                            searches.spawn(async move {
                                match timeout(
                                    deadline,
                                    node.iterative_find_value(hash, Some(&sink)),
                                )
                                .await
                                {
                                    Ok(peers) => {
                                        debug!(blob = ?hash, found = peers.len(), "search done")
                                    }
                                    Err(_) => debug!(blob = ?hash, "search timed out"),
                                }
                                hash
                            });
                        }
                        None => break,
                    },
                    Some(done) = searches.join_next(), if !searches.is_empty() => {
                        if let Ok(hash) = done {
                            in_flight.remove(&hash);
                        }
                    }
                }
            }
            // search queue closed: let the running searches drain
            while searches.join_next().await.is_some() {}
        });

        (peer_tx, peer_rx, SearchTask(handle))
    }
}
