//! Contact table for seeding iterative lookups.
//!
//! Contacts are binned by XOR-distance bucket with a most-recently-seen
//! policy: a re-seen contact moves to the back, a full bucket drops the
//! newcomer. That is enough to keep lookups seeded; full Kademlia bucket
//! maintenance (ping-before-evict, refresh) lives with the protocol
//! handlers, not here.

use super::node_id::{NodeId, NODE_ID_SIZE};
use super::peer::Contact;

/// Bucket capacity — the Kademlia `k`.
pub const K: usize = 8;

const BUCKET_COUNT: usize = NODE_ID_SIZE * 8;

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Vec<Contact>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let distance = self.local_id.distance(&id.0);
        if distance.is_zero() {
            return None;
        }
        Some((BUCKET_COUNT as u32 - 1 - distance.leading_zero_bits()) as usize)
    }

    /// Record a contact as seen. The local node is never stored.
    pub fn add(&mut self, contact: Contact) {
        let Some(index) = self.bucket_index(&contact.id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.iter().position(|c| c.id == contact.id) {
            bucket.remove(pos);
            bucket.push(contact);
            return;
        }
        if bucket.len() < K {
            bucket.push(contact);
        }
    }

    /// Forget a contact, typically after an RPC failure.
    pub fn remove(&mut self, id: &NodeId) {
        if let Some(index) = self.bucket_index(id) {
            self.buckets[index].retain(|c| c.id != *id);
        }
    }

    /// Up to `count` known contacts closest to `target`.
    pub fn closest(&self, target: &[u8; NODE_ID_SIZE], count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.buckets.iter().flatten().cloned().collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn contact(id: NodeId) -> Contact {
        let address: IpAddr = "127.0.0.1".parse().unwrap();
        Contact {
            id,
            address,
            udp_port: 4444,
        }
    }

    #[test]
    fn test_self_never_stored() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local);
        table.add(contact(local));
        assert!(table.is_empty());
    }

    #[test]
    fn test_closest_sorted_by_distance() {
        let local = NodeId([0u8; NODE_ID_SIZE]);
        let mut table = RoutingTable::new(local);
        for _ in 0..64 {
            table.add(contact(NodeId::random()));
        }
        let target = NodeId::random().0;
        let closest = table.closest(&target, K);
        assert_eq!(closest.len(), K);
        for pair in closest.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
    }

    #[test]
    fn test_full_bucket_drops_newcomer() {
        let local = NodeId([0u8; NODE_ID_SIZE]);
        let mut table = RoutingTable::new(local);
        // contacts in the same far bucket: top bit set
        let mut ids = Vec::new();
        for i in 0..=K as u8 {
            let mut raw = [0u8; NODE_ID_SIZE];
            raw[0] = 0x80;
            raw[NODE_ID_SIZE - 1] = i + 1;
            ids.push(NodeId(raw));
        }
        for id in &ids {
            table.add(contact(*id));
        }
        assert_eq!(table.len(), K);
        // the straggler was dropped, the original residents stayed
        let stored = table.closest(&[0u8; NODE_ID_SIZE], K + 1);
        assert!(!stored.iter().any(|c| c.id == ids[K]));
    }

    #[test]
    fn test_reseen_contact_moves_to_back() {
        let local = NodeId([0u8; NODE_ID_SIZE]);
        let mut table = RoutingTable::new(local);
        let a = NodeId::random();
        table.add(contact(a));
        table.add(contact(NodeId::random()));
        table.add(contact(a));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local);
        let id = NodeId::random();
        table.add(contact(id));
        assert_eq!(table.len(), 1);
        table.remove(&id);
        assert!(table.is_empty());
    }
}
