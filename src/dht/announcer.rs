//! Periodic DHT announcement of locally-stored blobs.

use super::node::Node;
use crate::config::Config;
use crate::store::BlobStore;
use crate::types::{now, BlobHash};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Sweep cadence. Each sweep announces only blobs that are actually due.
const ANNOUNCE_TICK: Duration = Duration::from_secs(30);

pub struct HashAnnouncer {
    node: Arc<Node>,
    store: Arc<BlobStore>,
    config: Arc<Config>,
}

impl HashAnnouncer {
    pub fn new(node: Arc<Node>, store: Arc<BlobStore>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            node,
            store,
            config,
        })
    }

    /// Run the sweep loop until the returned handle is aborted.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let announcer = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ANNOUNCE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                announcer.manage().await;
            }
        })
    }

    /// One sweep: announce everything due for a refresh.
    pub async fn manage(&self) {
        if self.node.contact_count() == 0 {
            debug!("not ready to announce, no dht contacts");
            return;
        }
        let due = self.store.blobs_to_announce(
            now(),
            self.config.announce_interval,
            self.config.announce_head_and_sd_only,
        );
        if due.is_empty() {
            debug!("nothing to announce");
            return;
        }
        info!(count = due.len(), "announcing blobs");
        self.announce(due).await;
    }

    /// Announce specific hashes immediately, bounded by
    /// `concurrent_announcers`. Failed announces keep their record untouched
    /// and retry on a later sweep.
    pub async fn announce(&self, hashes: Vec<BlobHash>) {
        let limit = Arc::new(Semaphore::new(self.config.concurrent_announcers.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        for hash in hashes {
            let node = self.node.clone();
            let store = self.store.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let Ok(_permit) = limit.acquire_owned().await else {
                    return;
                };
                let stored_to = node.announce_have_blob(hash).await;
                if stored_to.is_empty() {
                    debug!(blob = ?hash, "announce failed, will retry");
                    return;
                }
                debug!(blob = ?hash, nodes = stored_to.len(), "announced");
                if let Err(e) = store.announced(&hash, now()) {
                    warn!(blob = ?hash, "failed to record announce time: {e}");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
