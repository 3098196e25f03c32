//! Kademlia-flavored peer discovery and announcement.

pub mod announcer;
pub mod finder;
pub mod node;
pub mod node_id;
pub mod peer;
pub mod routing;

pub use announcer::HashAnnouncer;
pub use finder::SearchTask;
pub use node::{DhtError, DhtRpc, FindValueResult, Node, ALPHA, BOTTOM_OUT_LIMIT};
pub use node_id::{xor_distance, Distance, NodeId, NODE_ID_SIZE};
pub use peer::{Contact, Peer, PeerManager};
pub use routing::{RoutingTable, K};
