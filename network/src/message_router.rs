// network/src/message_router.rs

use crate::fragment::{split_payload, MAX_FRAGMENT_PAYLOAD};
use crate::packet::{flags, ForwardingContext, Packet};
use crate::reliable::{DeliveredCallback, FailedCallback, ReliableTransport};
use crate::transport::DatagramTransport;
use async_trait::async_trait;
use log::debug;
use midi_fabric_core::{
    classify, node_hash, DeviceId, MessageClass, MidiMessageKind, NodeId, TransportError,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The seam the routing engine sends remote traffic through.
#[async_trait]
pub trait FabricSender: Send + Sync {
    async fn forward_midi(
        &self,
        bytes: Vec<u8>,
        src_device: DeviceId,
        dest_node: NodeId,
        addr: SocketAddr,
        context: &ForwardingContext,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct MessageRouterStats {
    pub messages: u64,
    pub bytes: u64,
    pub real_time: u64,
    pub non_real_time: u64,
    pub fragments: u64,
    pub per_kind: HashMap<MidiMessageKind, u64>,
}

/// Classifies each outgoing MIDI message and dispatches it on the matching
/// transport: real-time traffic rides the raw datagram path, everything else
/// goes through the reliable layer.
pub struct MessageRouter {
    datagram: Arc<DatagramTransport>,
    reliable: Arc<ReliableTransport>,
    local_hash: u32,
    detailed_tracking: AtomicBool,
    messages: AtomicU64,
    bytes: AtomicU64,
    real_time: AtomicU64,
    non_real_time: AtomicU64,
    fragments: AtomicU64,
    per_kind: Mutex<HashMap<MidiMessageKind, u64>>,
}

impl MessageRouter {
    pub fn new(
        datagram: Arc<DatagramTransport>,
        reliable: Arc<ReliableTransport>,
        local_hash: u32,
    ) -> Self {
        Self {
            datagram,
            reliable,
            local_hash,
            detailed_tracking: AtomicBool::new(false),
            messages: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            real_time: AtomicU64::new(0),
            non_real_time: AtomicU64::new(0),
            fragments: AtomicU64::new(0),
            per_kind: Mutex::new(HashMap::new()),
        }
    }

    /// Enables the per-message-kind counter table.
    pub fn set_detailed_tracking(&self, enabled: bool) {
        self.detailed_tracking.store(enabled, Ordering::Relaxed);
    }

    /// Sends one MIDI message to a peer. Real-time messages are
    /// fire-and-forget: `on_delivered` runs as soon as the datagram is out.
    /// Non-real-time payloads over the fragment size go out as a reliable
    /// fragment train, reassembled on the far side.
    pub async fn send_midi(
        &self,
        bytes: Vec<u8>,
        src_device: DeviceId,
        dest_node: NodeId,
        addr: SocketAddr,
        context: Option<&ForwardingContext>,
        mut on_delivered: Option<DeliveredCallback>,
        mut on_failed: Option<FailedCallback>,
    ) -> Result<(), TransportError> {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if self.detailed_tracking.load(Ordering::Relaxed) {
            if let Some(kind) = bytes.first().and_then(|&b| MidiMessageKind::from_status(b)) {
                *self
                    .per_kind
                    .lock()
                    .expect("kind table lock")
                    .entry(kind)
                    .or_insert(0) += 1;
            }
        }

        let dest_hash = node_hash(dest_node);
        match classify(&bytes) {
            MessageClass::RealTime => {
                self.real_time.fetch_add(1, Ordering::Relaxed);
                let mut packet = Packet::data(src_device, self.local_hash, dest_hash, bytes);
                if let Some(ctx) = context {
                    packet
                        .set_forwarding_context(ctx)
                        .map_err(TransportError::Encode)?;
                }
                match self.datagram.send(&mut packet, addr).await {
                    Ok(()) => {
                        if let Some(cb) = on_delivered {
                            cb();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        debug!("real-time send to {dest_node} failed: {e}");
                        if let Some(cb) = on_failed {
                            cb("datagram send failed");
                        }
                        Err(e)
                    }
                }
            }
            MessageClass::NonRealTime if bytes.len() <= MAX_FRAGMENT_PAYLOAD => {
                self.non_real_time.fetch_add(1, Ordering::Relaxed);
                let mut packet = Packet::data(src_device, self.local_hash, dest_hash, bytes);
                if let Some(ctx) = context {
                    packet
                        .set_forwarding_context(ctx)
                        .map_err(TransportError::Encode)?;
                }
                self.reliable
                    .send(packet, addr, on_delivered, on_failed)
                    .await
                    .map(|_| ())
            }
            MessageClass::NonRealTime => {
                self.non_real_time.fetch_add(1, Ordering::Relaxed);
                let is_sysex = bytes.first() == Some(&0xF0);
                let chunks = split_payload(&bytes);
                let last = chunks.len() - 1;
                for (i, chunk) in chunks.iter().enumerate() {
                    let mut packet =
                        Packet::data(src_device, self.local_hash, dest_hash, chunk.to_vec());
                    if is_sysex {
                        packet.flags |= flags::SYSEX | flags::RELIABLE;
                    }
                    if i != last {
                        packet.flags |= flags::FRAGMENT;
                        self.fragments.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(ctx) = context {
                        packet
                            .set_forwarding_context(ctx)
                            .map_err(TransportError::Encode)?;
                    }
                    // Completion is the last fragment's completion.
                    let (done, failed) = if i == last {
                        (on_delivered.take(), on_failed.take())
                    } else {
                        (None, None)
                    };
                    self.reliable.send(packet, addr, done, failed).await?;
                }
                Ok(())
            }
        }
    }

    pub fn statistics(&self) -> MessageRouterStats {
        MessageRouterStats {
            messages: self.messages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            real_time: self.real_time.load(Ordering::Relaxed),
            non_real_time: self.non_real_time.load(Ordering::Relaxed),
            fragments: self.fragments.load(Ordering::Relaxed),
            per_kind: self.per_kind.lock().expect("kind table lock").clone(),
        }
    }
}

#[async_trait]
impl FabricSender for MessageRouter {
    async fn forward_midi(
        &self,
        bytes: Vec<u8>,
        src_device: DeviceId,
        dest_node: NodeId,
        addr: SocketAddr,
        context: &ForwardingContext,
    ) -> Result<(), TransportError> {
        self.send_midi(bytes, src_device, dest_node, addr, Some(context), None, None)
            .await
    }
}
