// routing/src/routing_table.rs

use crate::device_registry::DeviceKind;
use midi_fabric_core::{DeviceId, NodeId};
use std::collections::HashMap;
use std::sync::RwLock;

/// Where a device lives and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub node: NodeId,
    pub device: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
}

/// (node, device) -> route lookup shared between the router and the control
/// plane. Order-preserving is not required.
#[derive(Default)]
pub struct RoutingTable {
    routes: RwLock<HashMap<(NodeId, DeviceId), Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, route: Route) {
        self.routes
            .write()
            .expect("routing table lock")
            .insert((route.node, route.device), route);
    }

    pub fn remove_route(&self, node: NodeId, device: DeviceId) -> Option<Route> {
        self.routes
            .write()
            .expect("routing table lock")
            .remove(&(node, device))
    }

    pub fn remove_node_routes(&self, node: NodeId) -> usize {
        let mut routes = self.routes.write().expect("routing table lock");
        let before = routes.len();
        routes.retain(|(owner, _), _| *owner != node);
        before - routes.len()
    }

    /// Atomically swaps every route of `node` for the given set.
    pub fn replace_node_routes(&self, node: NodeId, replacements: Vec<Route>) {
        let mut routes = self.routes.write().expect("routing table lock");
        routes.retain(|(owner, _), _| *owner != node);
        for route in replacements {
            routes.insert((node, route.device), Route { node, ..route });
        }
    }

    pub fn get_route(&self, node: NodeId, device: DeviceId) -> Option<Route> {
        self.routes
            .read()
            .expect("routing table lock")
            .get(&(node, device))
            .cloned()
    }

    pub fn get_local_routes(&self, local: NodeId) -> Vec<Route> {
        self.routes
            .read()
            .expect("routing table lock")
            .values()
            .filter(|r| r.node == local || r.node.is_local())
            .cloned()
            .collect()
    }

    pub fn get_remote_routes(&self, local: NodeId) -> Vec<Route> {
        self.routes
            .read()
            .expect("routing table lock")
            .values()
            .filter(|r| r.node != local && !r.node.is_local())
            .cloned()
            .collect()
    }

    pub fn get_node_routes(&self, node: NodeId) -> Vec<Route> {
        self.routes
            .read()
            .expect("routing table lock")
            .values()
            .filter(|r| r.node == node)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().expect("routing table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(node: NodeId, device: DeviceId) -> Route {
        Route {
            node,
            device,
            name: format!("dev-{device}"),
            kind: DeviceKind::Output,
        }
    }

    #[test]
    fn add_get_remove() {
        let table = RoutingTable::new();
        let node = NodeId::new_random();
        table.add_route(route(node, 1));
        assert_eq!(table.get_route(node, 1).unwrap().name, "dev-1");
        assert!(table.remove_route(node, 1).is_some());
        assert!(table.get_route(node, 1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn replace_node_routes_is_atomic() {
        let table = RoutingTable::new();
        let node = NodeId::new_random();
        let other = NodeId::new_random();
        table.add_route(route(node, 1));
        table.add_route(route(node, 2));
        table.add_route(route(other, 7));

        table.replace_node_routes(node, vec![route(node, 3)]);
        assert!(table.get_route(node, 1).is_none());
        assert!(table.get_route(node, 2).is_none());
        assert!(table.get_route(node, 3).is_some());
        assert!(table.get_route(other, 7).is_some());
        assert_eq!(table.get_node_routes(node).len(), 1);
    }

    #[test]
    fn local_and_remote_views_split_by_owner() {
        let table = RoutingTable::new();
        let local = NodeId::new_random();
        let peer = NodeId::new_random();
        table.add_route(route(local, 1));
        table.add_route(route(peer, 2));

        assert_eq!(table.get_local_routes(local).len(), 1);
        assert_eq!(table.get_remote_routes(local).len(), 1);
        assert_eq!(table.remove_node_routes(peer), 1);
        assert_eq!(table.len(), 1);
    }
}
