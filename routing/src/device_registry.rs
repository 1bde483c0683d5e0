// routing/src/device_registry.rs

use log::{debug, info};
use midi_fabric_core::{DeviceId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Input,
    Output,
}

/// One MIDI port somewhere in the fabric, addressed by (owner, id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub owner: NodeId,
    pub name: String,
    pub kind: DeviceKind,
    pub manufacturer: String,
}

/// Inventory of local and per-peer devices with local id allocation.
///
/// Reads dominate; everything sits behind one readers-writer lock. Removing
/// a peer removes all of its records in one critical section.
pub struct DeviceRegistry {
    local_node: NodeId,
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    local: HashMap<DeviceId, DeviceRecord>,
    remote: HashMap<NodeId, HashMap<DeviceId, DeviceRecord>>,
    used_ids: HashSet<DeviceId>,
    next_id: DeviceId,
}

impl DeviceRegistry {
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Registers a local port under a freshly allocated id.
    pub fn add_local(
        &self,
        name: impl Into<String>,
        kind: DeviceKind,
        manufacturer: impl Into<String>,
    ) -> DeviceId {
        let mut inner = self.inner.write().expect("device registry lock");
        let id = inner.allocate();
        let record = DeviceRecord {
            id,
            owner: self.local_node,
            name: name.into(),
            kind,
            manufacturer: manufacturer.into(),
        };
        info!("local device {} registered as {id}", record.name);
        inner.local.insert(id, record);
        id
    }

    /// Upserts a local record under a caller-chosen id.
    pub fn add_local_with_id(&self, record: DeviceRecord) {
        let mut inner = self.inner.write().expect("device registry lock");
        inner.used_ids.insert(record.id);
        inner.local.insert(record.id, record);
    }

    /// Upserts a record owned by a remote peer.
    pub fn add_remote(&self, owner: NodeId, record: DeviceRecord) {
        let mut inner = self.inner.write().expect("device registry lock");
        inner.remote.entry(owner).or_default().insert(record.id, record);
    }

    pub fn remove_local(&self, id: DeviceId) -> Option<DeviceRecord> {
        let mut inner = self.inner.write().expect("device registry lock");
        inner.used_ids.remove(&id);
        inner.local.remove(&id)
    }

    pub fn remove_remote(&self, owner: NodeId, id: DeviceId) -> Option<DeviceRecord> {
        let mut inner = self.inner.write().expect("device registry lock");
        let devices = inner.remote.get_mut(&owner)?;
        let removed = devices.remove(&id);
        if devices.is_empty() {
            inner.remote.remove(&owner);
        }
        removed
    }

    pub fn clear_local_devices(&self) {
        let mut inner = self.inner.write().expect("device registry lock");
        inner.local.clear();
        inner.used_ids.clear();
    }

    /// Drops every record the peer owns, atomically.
    pub fn remove_node_devices(&self, owner: NodeId) -> usize {
        let mut inner = self.inner.write().expect("device registry lock");
        let removed = inner.remote.remove(&owner).map(|d| d.len()).unwrap_or(0);
        if removed > 0 {
            debug!("dropped {removed} devices owned by {owner}");
        }
        removed
    }

    pub fn get(&self, id: DeviceId) -> Option<DeviceRecord> {
        self.inner
            .read()
            .expect("device registry lock")
            .local
            .get(&id)
            .cloned()
    }

    pub fn get_local(&self) -> Vec<DeviceRecord> {
        self.inner
            .read()
            .expect("device registry lock")
            .local
            .values()
            .cloned()
            .collect()
    }

    pub fn get_remote(&self) -> Vec<DeviceRecord> {
        self.inner
            .read()
            .expect("device registry lock")
            .remote
            .values()
            .flat_map(|d| d.values().cloned())
            .collect()
    }

    pub fn get_by_node(&self, owner: NodeId) -> Vec<DeviceRecord> {
        let inner = self.inner.read().expect("device registry lock");
        if owner == self.local_node || owner.is_local() {
            inner.local.values().cloned().collect()
        } else {
            inner
                .remote
                .get(&owner)
                .map(|d| d.values().cloned().collect())
                .unwrap_or_default()
        }
    }

    /// True when the node is this host or a peer with registered devices.
    pub fn contains_node(&self, node: NodeId) -> bool {
        if node == self.local_node || node.is_local() {
            return true;
        }
        self.inner
            .read()
            .expect("device registry lock")
            .remote
            .contains_key(&node)
    }

    pub fn device_exists(&self, node: NodeId, id: DeviceId) -> bool {
        let inner = self.inner.read().expect("device registry lock");
        if node == self.local_node || node.is_local() {
            inner.local.contains_key(&id)
        } else {
            inner
                .remote
                .get(&node)
                .map(|d| d.contains_key(&id))
                .unwrap_or(false)
        }
    }

    /// The id the next `add_local` would take.
    pub fn next_available_id(&self) -> DeviceId {
        let inner = self.inner.read().expect("device registry lock");
        let mut candidate = inner.next_id;
        while inner.used_ids.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        candidate
    }

    pub fn is_available(&self, id: DeviceId) -> bool {
        !self
            .inner
            .read()
            .expect("device registry lock")
            .used_ids
            .contains(&id)
    }
}

impl RegistryInner {
    /// Monotonically advancing allocator that skips ids still in use.
    fn allocate(&mut self) -> DeviceId {
        let mut candidate = self.next_id;
        while self.used_ids.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        self.next_id = candidate.wrapping_add(1);
        self.used_ids.insert(candidate);
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_record(owner: NodeId, id: DeviceId) -> DeviceRecord {
        DeviceRecord {
            id,
            owner,
            name: format!("remote-{id}"),
            kind: DeviceKind::Output,
            manufacturer: "Akai".into(),
        }
    }

    #[test]
    fn allocator_advances_and_skips_used_ids() {
        let registry = DeviceRegistry::new(NodeId::new_random());
        let a = registry.add_local("in-a", DeviceKind::Input, "Akai");
        let b = registry.add_local("in-b", DeviceKind::Input, "Akai");
        assert_ne!(a, b);

        // Pin the next candidate manually, then allocate around it.
        registry.add_local_with_id(DeviceRecord {
            id: b + 1,
            owner: registry.local_node(),
            name: "pinned".into(),
            kind: DeviceKind::Output,
            manufacturer: "".into(),
        });
        let c = registry.add_local("in-c", DeviceKind::Input, "Akai");
        assert_ne!(c, b + 1);
        assert!(!registry.is_available(c));
        assert!(registry.is_available(c + 10));
    }

    #[test]
    fn upsert_replaces_record() {
        let registry = DeviceRegistry::new(NodeId::new_random());
        let id = registry.add_local("before", DeviceKind::Input, "Akai");
        registry.add_local_with_id(DeviceRecord {
            id,
            owner: registry.local_node(),
            name: "after".into(),
            kind: DeviceKind::Input,
            manufacturer: "Akai".into(),
        });
        assert_eq!(registry.get(id).unwrap().name, "after");
        assert_eq!(registry.get_local().len(), 1);
    }

    #[test]
    fn removing_a_node_is_atomic() {
        let registry = DeviceRegistry::new(NodeId::new_random());
        let peer = NodeId::new_random();
        registry.add_remote(peer, remote_record(peer, 10));
        registry.add_remote(peer, remote_record(peer, 11));
        assert!(registry.contains_node(peer));
        assert_eq!(registry.get_by_node(peer).len(), 2);

        assert_eq!(registry.remove_node_devices(peer), 2);
        assert!(!registry.contains_node(peer));
        assert!(registry.get_by_node(peer).is_empty());
    }

    #[test]
    fn local_queries_answer_for_both_spellings_of_local() {
        let registry = DeviceRegistry::new(NodeId::new_random());
        let id = registry.add_local("port", DeviceKind::Output, "Akai");
        assert!(registry.device_exists(NodeId::LOCAL, id));
        assert!(registry.device_exists(registry.local_node(), id));
        assert!(!registry.device_exists(NodeId::LOCAL, id + 1));
        assert!(registry.contains_node(NodeId::LOCAL));
    }

    #[test]
    fn clear_local_devices_releases_ids() {
        let registry = DeviceRegistry::new(NodeId::new_random());
        let id = registry.add_local("port", DeviceKind::Input, "Akai");
        registry.clear_local_devices();
        assert!(registry.get(id).is_none());
        assert!(registry.is_available(id));
    }
}
