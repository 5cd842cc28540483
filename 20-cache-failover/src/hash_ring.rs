//! Consistent hashing of cache keys onto servers.
//!
//! Each server owns `VIRTUAL_NODES_PER_WEIGHT * weight` points on a 64-bit
//! ring kept in a `BTreeMap`. A key is owned by the first point at or after
//! its hash; replicas are the next distinct servers walking clockwise.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::config::{ServerId, ServerSpec};

const VIRTUAL_NODES_PER_WEIGHT: u32 = 160;

// Fixed keys so ring positions are identical in every process.
const HASH_KEY_0: u64 = 0x6d65_6d63_6163_6865;
const HASH_KEY_1: u64 = 0x7269_6e67_2d76_6e31;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, ServerId>,
    weights: HashMap<ServerId, u32>,
}

impl HashRing {
    pub fn new(servers: &[ServerSpec]) -> Self {
        let mut ring = Self::default();
        for spec in servers {
            ring.add(&spec.addr, spec.weight);
        }
        ring
    }

    /// Inserts a server's points. Adding a present server is a no-op.
    pub fn add(&mut self, server: &str, weight: u32) {
        if self.weights.contains_key(server) {
            return;
        }
        for point in virtual_points(server, weight) {
            // On the (astronomically rare) collision the first owner keeps the point.
            self.ring.entry(point).or_insert_with(|| server.to_string());
        }
        self.weights.insert(server.to_string(), weight);
    }

    /// Drops a server's points; keys owned by other servers are unaffected.
    pub fn remove(&mut self, server: &str) {
        let Some(weight) = self.weights.remove(server) else {
            return;
        };
        for point in virtual_points(server, weight) {
            if self.ring.get(&point).is_some_and(|owner| owner == server) {
                self.ring.remove(&point);
            }
        }
    }

    /// Ordered candidates for `key`: the owner first, then up to `replicas`
    /// further distinct servers in ring order.
    pub fn lookup(&self, key: &str, replicas: usize) -> Vec<ServerId> {
        let wanted = self.weights.len().min(replicas.saturating_add(1));
        let mut candidates: Vec<ServerId> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return candidates;
        }

        let start = hash(key.as_bytes());
        let clockwise = self.ring.range(start..).chain(self.ring.range(..start));
        for (_, server) in clockwise {
            if !candidates.contains(server) {
                candidates.push(server.clone());
                if candidates.len() == wanted {
                    break;
                }
            }
        }
        candidates
    }

    pub fn contains(&self, server: &str) -> bool {
        self.weights.contains_key(server)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerId> {
        self.weights.keys()
    }
}

fn virtual_points(server: &str, weight: u32) -> impl Iterator<Item = u64> + '_ {
    (0..VIRTUAL_NODES_PER_WEIGHT.saturating_mul(weight))
        .map(move |index| hash(format!("{server}-{index}").as_bytes()))
}

fn hash(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(HASH_KEY_0, HASH_KEY_1);
    hasher.write(bytes);
    hasher.finish()
}
