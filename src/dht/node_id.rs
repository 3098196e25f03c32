//! 384-bit node identifiers and the XOR distance metric.

use crate::types::HASH_SIZE;
use std::fmt;

/// Width of a node id in bytes. Node ids share the keyspace with blob
/// hashes, which is what makes "nodes close to a blob" meaningful.
pub const NODE_ID_SIZE: usize = HASH_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_SIZE]);

impl NodeId {
    pub fn random() -> Self {
        let mut raw = [0u8; NODE_ID_SIZE];
        rand::Rng::fill(&mut rand::thread_rng(), &mut raw[..]);
        Self(raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn distance(&self, target: &[u8; NODE_ID_SIZE]) -> Distance {
        xor_distance(&self.0, target)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", &self.to_hex()[..8])
    }
}

/// XOR distance between two 384-bit keys. Byte arrays compare
/// lexicographically, which for big-endian keys is numeric order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Distance([u8; NODE_ID_SIZE]);

impl Distance {
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

pub fn xor_distance(a: &[u8; NODE_ID_SIZE], b: &[u8; NODE_ID_SIZE]) -> Distance {
    let mut out = [0u8; NODE_ID_SIZE];
    for i in 0..NODE_ID_SIZE {
        out[i] = a[i] ^ b[i];
    }
    Distance(out)
}
