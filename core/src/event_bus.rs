// core/src/event_bus.rs

use crate::{DeviceId, NodeId};
use std::net::SocketAddr;
use tokio::sync::broadcast::{self, Receiver, Sender};

/// Fabric-level events published for observers (CLI surfaces, tests).
///
/// The core components never depend on the bus; the service loop publishes
/// into it as things happen.
#[derive(Debug, Clone)]
pub enum Event {
    PeerConnected {
        node: NodeId,
        addr: SocketAddr,
    },
    PeerFailing {
        node: NodeId,
    },
    PeerLost {
        node: NodeId,
    },
    MidiDelivered {
        source: NodeId,
        device: DeviceId,
        bytes: Vec<u8>,
    },
    PacketLossDetected {
        source: NodeId,
        missing_seq: u16,
    },
    RulesReloaded {
        count: usize,
    },
}

pub struct EventBus {
    pub sender: Sender<Event>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event, ignoring the no-subscriber case.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}
