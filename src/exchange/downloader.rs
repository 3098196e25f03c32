//! Peer-racing blob downloader.
//!
//! One blob at a time: solicit several peers concurrently, keep whichever
//! delivers first, and adapt — fast peers earn score, failing peers sit out
//! a ban window. The race never gives up on its own; the caller bounds it
//! with a timeout or by dropping the future.

use super::client::request_blob;
use crate::config::Config;
use crate::dht::Peer;
use crate::store::{Blob, BlobError, BlobStore};
use crate::types::BlobHash;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// How long a failing peer stays out of the race.
const BAN_TIME: Duration = Duration::from_secs(10);

/// With no completed blob in this long, the unban sweep stands down:
/// a stall that wide is our problem, not the banned peers'.
const STALL_GATE: Duration = Duration::from_secs(60);

/// Bounded wait for fresh peers before the race loop re-evaluates.
const EMPTY_QUEUE_WAIT: Duration = Duration::from_secs(1);

struct RequestOutcome {
    peer: Peer,
    bytes_received: u64,
    transport: Option<TcpStream>,
    elapsed: Duration,
}

/// Races peers for one blob at a time. Scores and bans persist across blobs
/// within this instance, so a stream download carries peer quality forward;
/// they never cross instances.
pub struct BlobDownloader {
    config: Arc<Config>,
    store: Arc<BlobStore>,
    peer_tx: mpsc::Sender<Vec<Peer>>,
    peer_rx: mpsc::Receiver<Vec<Peer>>,
    outcome_tx: mpsc::UnboundedSender<RequestOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<RequestOutcome>,
    active: HashMap<Peer, JoinHandle<()>>,
    ignored: HashMap<Peer, Instant>,
    scores: HashMap<Peer, f64>,
    connections: HashMap<Peer, TcpStream>,
    time_since_last_blob: Instant,
}

impl BlobDownloader {
    pub fn new(
        config: Arc<Config>,
        store: Arc<BlobStore>,
        peer_tx: mpsc::Sender<Vec<Peer>>,
        peer_rx: mpsc::Receiver<Vec<Peer>>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            config,
            store,
            peer_tx,
            peer_rx,
            outcome_tx,
            outcome_rx,
            active: HashMap::new(),
            ignored: HashMap::new(),
            scores: HashMap::new(),
            connections: HashMap::new(),
            time_since_last_blob: Instant::now(),
        }
    }

    /// Obtain a verified blob, racing whatever peers the queue produces.
    /// Returns immediately if the blob is already finished.
    pub async fn download_blob(
        &mut self,
        hash: BlobHash,
        length: Option<u64>,
    ) -> Result<Arc<Blob>, BlobError> {
        let blob = self.store.get_blob(hash, length).await?;
        if blob.is_verified() {
            return Ok(blob);
        }
        self.race(&blob).await;
        debug!(blob = ?hash, "downloaded");
        self.wind_down();
        Ok(blob)
    }

    async fn race(&mut self, blob: &Arc<Blob>) {
        let mut verified = blob.subscribe();
        while !blob.is_verified() {
            let mut batch: Vec<Peer> = Vec::new();
            while let Ok(peers) = self.peer_rx.try_recv() {
                batch.extend(peers);
            }
            dedup_in_place(&mut batch);
            // stable sort: equal scores keep their queue order
            batch.sort_by(|a, b| {
                let sa = self.scores.get(a).copied().unwrap_or(0.0);
                let sb = self.scores.get(b).copied().unwrap_or(0.0);
                sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
            });
            debug!(
                blob = ?blob.hash(),
                peers = batch.len(),
                ignored = self.ignored.len(),
                active = self.active.len(),
                "racing"
            );

            for peer in &batch {
                if self.active.len() >= self.config.max_connections_per_download {
                    break;
                }
                if self.active.contains_key(peer) || self.ignored.contains_key(peer) {
                    continue;
                }
                self.spawn_request(blob.clone(), *peer);
            }

            let first = self.wait_for_progress(&mut verified).await;
            self.reap_finished(blob, first);

            if !batch.is_empty() {
                let keep: Vec<Peer> = batch
                    .into_iter()
                    .filter(|p| !self.ignored.contains_key(p))
                    .collect();
                if !keep.is_empty() {
                    let _ = self.peer_tx.try_send(keep);
                }
            } else {
                self.clear_banned();
            }
        }
    }

    /// Launch one request task. The peer pays one score point up front, so a
    /// peer tying up a slot ranks below one that has not been tried yet.
    fn spawn_request(&mut self, blob: Arc<Blob>, peer: Peer) {
        *self.scores.entry(peer).or_insert(0.0) -= 1.0;
        let transport = self.connections.remove(&peer);
        let rate = self.config.data_rate;
        let connect_timeout = self.config.peer_connect_timeout;
        let download_timeout = self.config.blob_download_timeout;
        let outcome_tx = self.outcome_tx.clone();
        debug!(blob = ?blob.hash(), %peer, "request");
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let (bytes_received, transport) = request_blob(
                blob,
                peer.address,
                peer.tcp_port,
                rate,
                connect_timeout,
                download_timeout,
                transport,
            )
            .await;
            let _ = outcome_tx.send(RequestOutcome {
                peer,
                bytes_received,
                transport,
                elapsed: start.elapsed(),
            });
        });
        self.active.insert(peer, handle);
    }

    /// Block until something changes: the blob verifies, a task finishes, or
    /// a peer batch arrives (bounded so an empty queue cannot stall us past
    /// one sweep interval).
    async fn wait_for_progress(
        &mut self,
        verified: &mut watch::Receiver<bool>,
    ) -> Option<RequestOutcome> {
        let Self {
            peer_rx,
            outcome_rx,
            peer_tx,
            ..
        } = self;
        tokio::select! {
            _ = verified.wait_for(|v| *v) => None,
            outcome = outcome_rx.recv() => outcome,
            batch = timeout(EMPTY_QUEUE_WAIT, peer_rx.recv()) => {
                if let Ok(Some(peers)) = batch {
                    // hand it back; the next drain sorts it with the rest
                    let _ = peer_tx.try_send(peers);
                }
                None
            }
        }
    }

    /// Fold completed request tasks into peer state. Full-length delivery
    /// refreshes the stall clock and rescores the peer by rough throughput;
    /// a dead transport bans; a live-but-short transport is kept quietly.
    fn reap_finished(&mut self, blob: &Arc<Blob>, first: Option<RequestOutcome>) {
        let mut outcomes: Vec<RequestOutcome> = first.into_iter().collect();
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            outcomes.push(outcome);
        }
        for outcome in outcomes {
            self.active.remove(&outcome.peer);
            let full_blob = blob
                .length()
                .is_some_and(|length| outcome.bytes_received == length);
            if full_blob {
                self.time_since_last_blob = Instant::now();
            }
            match outcome.transport {
                None => {
                    debug!(peer = %outcome.peer, "drop peer");
                    self.ignored.entry(outcome.peer).or_insert_with(Instant::now);
                    self.connections.remove(&outcome.peer);
                }
                Some(transport) => {
                    debug!(peer = %outcome.peer, "keep peer");
                    let rough_speed = if outcome.bytes_received > 0 {
                        outcome.bytes_received as f64 / outcome.elapsed.as_secs_f64().max(1e-6)
                    } else {
                        0.0
                    };
                    self.scores.insert(outcome.peer, rough_speed);
                    self.connections.insert(outcome.peer, transport);
                }
            }
        }
    }

    /// Unban sweep, run on empty-batch iterations. Deliberately returns
    /// before unbanning while downloads are stalled.
    fn clear_banned(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.time_since_last_blob) > STALL_GATE {
            return;
        }
        let forgiven: Vec<Peer> = self
            .ignored
            .iter()
            .filter(|(_, since)| now.duration_since(**since) > BAN_TIME)
            .map(|(peer, _)| *peer)
            .collect();
        if forgiven.is_empty() {
            return;
        }
        for peer in &forgiven {
            self.ignored.remove(peer);
        }
        debug!(count = forgiven.len(), "unbanned peers");
        let _ = self.peer_tx.try_send(forgiven);
    }

    /// Cancel the current race's tasks. Peer state survives for the next
    /// blob; cached transports stay open for reuse.
    fn wind_down(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.abort();
        }
        while self.outcome_rx.try_recv().is_ok() {}
    }

    /// Drop all session state and close cached transports.
    pub fn close(&mut self) {
        self.wind_down();
        self.scores.clear();
        self.ignored.clear();
        self.connections.clear();
    }

    /// Peers currently banned (diagnostics and tests).
    pub fn banned_peers(&self) -> Vec<Peer> {
        self.ignored.keys().copied().collect()
    }

    /// A peer's current score (diagnostics and tests).
    pub fn peer_score(&self, peer: &Peer) -> f64 {
        self.scores.get(peer).copied().unwrap_or(0.0)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl Drop for BlobDownloader {
    fn drop(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.abort();
        }
    }
}

fn dedup_in_place(batch: &mut Vec<Peer>) {
    let mut seen = HashSet::with_capacity(batch.len());
    batch.retain(|peer| seen.insert(*peer));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn peer(last_octet: u8) -> Peer {
        let address: IpAddr = format!("10.0.0.{last_octet}").parse().unwrap();
        Peer::new(address, 3333)
    }

    fn test_downloader(dir: &std::path::Path) -> BlobDownloader {
        let config = Arc::new(Config::with_data_dir(dir.to_path_buf()));
        let store = Arc::new(
            BlobStore::open(&config.blob_dir, &config.data_dir.join("db")).unwrap(),
        );
        let (peer_tx, peer_rx) = mpsc::channel(64);
        BlobDownloader::new(config, store, peer_tx, peer_rx)
    }

    #[tokio::test]
    async fn test_spawn_pre_decrements_score() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = test_downloader(dir.path());
        let blob = dl
            .store
            .get_blob(crate::types::sha384(b"x"), None)
            .await
            .unwrap();

        let p = peer(1);
        assert_eq!(dl.peer_score(&p), 0.0);
        dl.spawn_request(blob, p);
        assert_eq!(dl.peer_score(&p), -1.0);
        assert_eq!(dl.active_count(), 1);
        dl.close();
    }

    #[tokio::test]
    async fn test_clear_banned_respects_ban_time_and_stall_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = test_downloader(dir.path());

        let fresh = peer(1);
        let stale = peer(2);
        dl.ignored.insert(fresh, Instant::now());
        dl.ignored.insert(stale, Instant::now() - Duration::from_secs(11));

        dl.clear_banned();
        // only the expired ban lifts, and the peer goes back on the queue
        assert_eq!(dl.banned_peers(), vec![fresh]);
        let requeued = dl.peer_rx.try_recv().unwrap();
        assert_eq!(requeued, vec![stale]);

        // stalled downloader refuses to unban anything
        dl.ignored.insert(stale, Instant::now() - Duration::from_secs(11));
        dl.time_since_last_blob = Instant::now() - Duration::from_secs(61);
        dl.clear_banned();
        assert_eq!(dl.banned_peers().len(), 2);
        assert!(dl.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_sort_prefers_high_scores_stably() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = test_downloader(dir.path());
        dl.scores.insert(peer(1), -1.0);
        dl.scores.insert(peer(2), 250_000.0);

        let mut batch = vec![peer(1), peer(3), peer(4), peer(2)];
        dedup_in_place(&mut batch);
        batch.sort_by(|a, b| {
            let sa = dl.scores.get(a).copied().unwrap_or(0.0);
            let sb = dl.scores.get(b).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        // scored peer first, unknown peers keep order, penalized peer last
        assert_eq!(batch, vec![peer(2), peer(3), peer(4), peer(1)]);
    }

    #[tokio::test]
    async fn test_dedup_preserves_first_occurrence() {
        let mut batch = vec![peer(5), peer(6), peer(5), peer(7), peer(6)];
        dedup_in_place(&mut batch);
        assert_eq!(batch, vec![peer(5), peer(6), peer(7)]);
    }
}
