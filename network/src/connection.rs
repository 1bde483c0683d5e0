// network/src/connection.rs

use log::{debug, info};
use midi_fabric_core::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Lifecycle of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failing,
    Failed,
}

/// One peer of the fabric: identity, address, link state, liveness.
pub struct NetworkConnection {
    node_id: NodeId,
    name: String,
    addr: SocketAddr,
    state: Mutex<ConnectionState>,
    last_seen: Mutex<Instant>,
    missed_heartbeats: AtomicU32,
}

impl NetworkConnection {
    pub fn new(node_id: NodeId, name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            node_id,
            name: name.into(),
            addr,
            state: Mutex::new(ConnectionState::Disconnected),
            last_seen: Mutex::new(Instant::now()),
            missed_heartbeats: AtomicU32::new(0),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock")
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.lock().expect("connection state lock");
        if *guard != state {
            debug!("peer {} {:?} -> {:?}", self.node_id, *guard, state);
            *guard = state;
        }
    }

    /// Records liveness: resets the heartbeat-miss count and recovers a
    /// Failing link back to Connected.
    pub fn touch(&self) {
        *self.last_seen.lock().expect("last seen lock") = Instant::now();
        self.missed_heartbeats.store(0, Ordering::Relaxed);
        let mut state = self.state.lock().expect("connection state lock");
        match *state {
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Failing => {
                debug!("peer {} {:?} -> Connected", self.node_id, *state);
                *state = ConnectionState::Connected;
            }
            _ => {}
        }
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("last seen lock")
    }

    /// Notes a missed heartbeat, returning the running count.
    pub fn note_missed_heartbeat(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionPoolStats {
    pub total: usize,
    pub by_state: HashMap<String, usize>,
}

/// Owns exactly one [NetworkConnection] per remote NodeId.
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<NodeId, Arc<NetworkConnection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. A second connection for the same NodeId is
    /// rejected; callers remove the old one first.
    pub fn add_connection(&self, conn: Arc<NetworkConnection>) -> Result<(), Arc<NetworkConnection>> {
        let mut connections = self.connections.write().expect("pool lock");
        if connections.contains_key(&conn.node_id()) {
            return Err(conn);
        }
        info!("registered peer {} at {}", conn.node_id(), conn.addr());
        connections.insert(conn.node_id(), conn);
        Ok(())
    }

    pub fn remove_connection(&self, node_id: NodeId) -> Option<Arc<NetworkConnection>> {
        self.connections.write().expect("pool lock").remove(&node_id)
    }

    pub fn get_connection(&self, node_id: NodeId) -> Option<Arc<NetworkConnection>> {
        self.connections
            .read()
            .expect("pool lock")
            .get(&node_id)
            .cloned()
    }

    pub fn has_connection(&self, node_id: NodeId) -> bool {
        self.connections
            .read()
            .expect("pool lock")
            .contains_key(&node_id)
    }

    pub fn get_all_connections(&self) -> Vec<Arc<NetworkConnection>> {
        self.connections
            .read()
            .expect("pool lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_connections_by_state(&self, state: ConnectionState) -> Vec<Arc<NetworkConnection>> {
        self.connections
            .read()
            .expect("pool lock")
            .values()
            .filter(|c| c.state() == state)
            .cloned()
            .collect()
    }

    /// Sweeps Failed connections out of the pool, returning them so the
    /// caller can tear down dependent state (devices, routes).
    pub fn remove_dead_connections(&self) -> Vec<Arc<NetworkConnection>> {
        let mut connections = self.connections.write().expect("pool lock");
        let dead: Vec<NodeId> = connections
            .values()
            .filter(|c| c.state() == ConnectionState::Failed)
            .map(|c| c.node_id())
            .collect();
        dead.iter()
            .filter_map(|id| connections.remove(id))
            .collect()
    }

    pub fn clear(&self) {
        self.connections.write().expect("pool lock").clear();
    }

    pub fn len(&self) -> usize {
        self.connections.read().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> ConnectionPoolStats {
        let connections = self.connections.read().expect("pool lock");
        let mut by_state: HashMap<String, usize> = HashMap::new();
        for conn in connections.values() {
            *by_state.entry(format!("{:?}", conn.state())).or_insert(0) += 1;
        }
        ConnectionPoolStats {
            total: connections.len(),
            by_state,
        }
    }
}
