use crate::NodeId;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Deterministic fold of a 128-bit NodeId to the 32-bit hash carried in
/// packet headers. XOR of the four big-endian words, identical on every node.
pub fn node_hash(id: NodeId) -> u32 {
    let bytes = id.0.as_bytes();
    let mut hash = 0u32;
    for chunk in bytes.chunks_exact(4) {
        hash ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    hash
}

/// Maps the compact in-packet node hash back to the full NodeId.
///
/// Registrations are idempotent; lookups dominate and run under a read lock.
/// A hash collision between two live NodeIds is recorded and logged, never
/// fatal: the first registrant wins and callers are expected to regenerate a
/// NodeId if they discover their own registration collided.
#[derive(Default)]
pub struct UuidRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    by_hash: HashMap<u32, NodeId>,
    collisions: HashSet<u32>,
}

impl UuidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node. Re-registering the same id is a no-op; a different
    /// id hashing to an occupied slot records a collision and keeps the
    /// first registrant.
    pub fn register(&self, id: NodeId) {
        let hash = node_hash(id);
        let mut inner = self.inner.write().expect("uuid registry poisoned");
        match inner.by_hash.get(&hash) {
            Some(existing) if *existing == id => {}
            Some(existing) => {
                warn!(
                    "node hash collision on 0x{:08X}: {} kept, {} rejected",
                    hash, existing, id
                );
                inner.collisions.insert(hash);
            }
            None => {
                inner.by_hash.insert(hash, id);
            }
        }
    }

    /// Removes a node. Only the current holder of the hash slot is removed.
    pub fn unregister(&self, id: NodeId) {
        let hash = node_hash(id);
        let mut inner = self.inner.write().expect("uuid registry poisoned");
        if inner.by_hash.get(&hash) == Some(&id) {
            inner.by_hash.remove(&hash);
        }
    }

    pub fn lookup(&self, hash: u32) -> Option<NodeId> {
        self.inner
            .read()
            .expect("uuid registry poisoned")
            .by_hash
            .get(&hash)
            .copied()
    }

    pub fn has_collision(&self, hash: u32) -> bool {
        self.inner
            .read()
            .expect("uuid registry poisoned")
            .collisions
            .contains(&hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("uuid registry poisoned").by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
