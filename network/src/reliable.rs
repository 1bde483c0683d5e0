// network/src/reliable.rs

use crate::buffer::{MessageBuffer, MessageBufferConfig};
use crate::fragment::Reassembler;
use crate::packet::{flags, Packet, PacketType};
use crate::transport::DatagramTransport;
use log::{debug, warn};
use midi_fabric_core::TransportError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub type DeliveredCallback = Box<dyn FnOnce() + Send>;
pub type FailedCallback = Box<dyn FnOnce(&str) + Send>;
type DeliveryHandler = Arc<dyn Fn(Packet, SocketAddr) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// First retransmission deadline; doubles per retry.
    pub base_timeout: Duration,
    pub max_retries: u32,
    /// Per-flow reorder buffer tuning on the receive side.
    pub buffer: MessageBufferConfig,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_millis(100),
            max_retries: 5,
            buffer: MessageBufferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReliableStats {
    pub sent: u64,
    pub acked: u64,
    pub retransmits: u64,
    pub failed: u64,
    pub nacks_sent: u64,
    pub nacks_received: u64,
}

struct PendingSend {
    packet: Packet,
    addr: SocketAddr,
    first_sent: Instant,
    next_deadline: Instant,
    retries: u32,
    on_delivered: Option<DeliveredCallback>,
    on_failed: Option<FailedCallback>,
}

struct FlowState {
    buffer: MessageBuffer,
    reassembler: Reassembler,
    addr: SocketAddr,
    last_nack: Option<Instant>,
    delivered: Arc<Mutex<Vec<Packet>>>,
    gaps: Arc<Mutex<Vec<u16>>>,
}

impl FlowState {
    fn new(config: MessageBufferConfig, addr: SocketAddr) -> Self {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let gaps = Arc::new(Mutex::new(Vec::new()));
        let mut buffer = MessageBuffer::new(config);
        let sink = Arc::clone(&delivered);
        buffer.set_on_packet_ready(move |pkt| sink.lock().expect("flow sink").push(pkt));
        let sink = Arc::clone(&gaps);
        buffer.set_on_gap_detected(move |seq| sink.lock().expect("flow sink").push(seq));
        Self {
            buffer,
            reassembler: Reassembler::new(),
            addr,
            last_nack: None,
            delivered,
            gaps,
        }
    }

    /// Pulls the buffer's ordered output through fragment reassembly.
    ///
    /// A pass that both reported gaps and delivered packets means the flow
    /// skipped sequences, which poisons any partial message.
    fn collect_ready(&mut self, gapped: bool) -> Vec<Packet> {
        let raw: Vec<Packet> = self.delivered.lock().expect("flow sink").drain(..).collect();
        if gapped && !raw.is_empty() {
            self.reassembler.reset();
        }
        let mut ready = Vec::new();
        for pkt in raw {
            let is_fragment = pkt.flags & flags::FRAGMENT != 0;
            if let Some(complete) = self.reassembler.push(&pkt.payload, is_fragment) {
                let mut out = pkt;
                out.flags &= !flags::FRAGMENT;
                out.payload = complete;
                ready.push(out);
            }
        }
        ready
    }
}

/// ACK/retry/timeout layer over [DatagramTransport] for non-real-time
/// traffic.
///
/// Senders get per-send delivery callbacks; receivers get in-order delivery
/// through a per-flow [MessageBuffer]. A NACK asks the peer to retransmit
/// the first missing sequence immediately, without burning a retry.
pub struct ReliableTransport {
    inner: Arc<ReliableInner>,
}

struct ReliableInner {
    transport: Arc<DatagramTransport>,
    config: ReliableConfig,
    local_hash: u32,
    pending: Mutex<HashMap<(u32, u16), PendingSend>>,
    flows: Mutex<HashMap<(u32, u16), FlowState>>,
    delivery: RwLock<Option<DeliveryHandler>>,
    sent: AtomicU64,
    acked: AtomicU64,
    retransmits: AtomicU64,
    failed: AtomicU64,
    nacks_sent: AtomicU64,
    nacks_received: AtomicU64,
}

impl ReliableTransport {
    pub fn new(transport: Arc<DatagramTransport>, local_hash: u32, config: ReliableConfig) -> Self {
        Self {
            inner: Arc::new(ReliableInner {
                transport,
                config,
                local_hash,
                pending: Mutex::new(HashMap::new()),
                flows: Mutex::new(HashMap::new()),
                delivery: RwLock::new(None),
                sent: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                retransmits: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                nacks_sent: AtomicU64::new(0),
                nacks_received: AtomicU64::new(0),
            }),
        }
    }

    /// Receives the in-order output of every flow.
    pub fn set_delivery_handler(&self, cb: impl Fn(Packet, SocketAddr) + Send + Sync + 'static) {
        *self.inner.delivery.write().expect("delivery lock") = Some(Arc::new(cb));
    }

    /// Sends a packet with at-least-once semantics, returning the stamped
    /// sequence. An encode failure or unstarted transport fails immediately;
    /// a lost datagram is retried by the timer until `max_retries`.
    pub async fn send(
        &self,
        mut packet: Packet,
        addr: SocketAddr,
        on_delivered: Option<DeliveredCallback>,
        on_failed: Option<FailedCallback>,
    ) -> Result<u16, TransportError> {
        packet.flags |= flags::RELIABLE;
        match self.inner.transport.send(&mut packet, addr).await {
            Ok(()) | Err(TransportError::Io(_)) => {}
            Err(e) => {
                if let Some(cb) = on_failed {
                    cb("send rejected");
                }
                return Err(e);
            }
        }

        let now = Instant::now();
        let seq = packet.sequence;
        let key = (packet.dest_hash, seq);
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().expect("pending lock").insert(
            key,
            PendingSend {
                packet,
                addr,
                first_sent: now,
                next_deadline: now + self.inner.config.base_timeout,
                retries: 0,
                on_delivered,
                on_failed,
            },
        );
        Ok(seq)
    }

    /// Abandons an in-flight send and reports it failed.
    pub fn cancel(&self, dest_hash: u32, seq: u16) {
        let entry = self
            .inner
            .pending
            .lock()
            .expect("pending lock")
            .remove(&(dest_hash, seq));
        if let Some(entry) = entry {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
            if let Some(cb) = entry.on_failed {
                cb("cancelled");
            }
        }
    }

    /// Feeds one packet from the wire through the reliable machinery.
    /// The caller routes Ack, Nack, and reliable Data packets here.
    pub async fn handle_packet(&self, packet: Packet, src: SocketAddr) {
        match packet.packet_type() {
            PacketType::Ack => self.handle_ack(&packet),
            PacketType::Nack => self.handle_nack(&packet).await,
            PacketType::Data if packet.is_reliable() => self.handle_data(packet, src).await,
            _ => debug!("reliable layer ignoring packet from {src}"),
        }
    }

    fn handle_ack(&self, packet: &Packet) {
        let key = (packet.source_hash, packet.sequence);
        let entry = self.inner.pending.lock().expect("pending lock").remove(&key);
        if let Some(entry) = entry {
            self.inner.acked.fetch_add(1, Ordering::Relaxed);
            debug!(
                "sequence {} acked after {:?}",
                packet.sequence,
                entry.first_sent.elapsed()
            );
            if let Some(cb) = entry.on_delivered {
                cb();
            }
        }
    }

    async fn handle_nack(&self, packet: &Packet) {
        self.inner.nacks_received.fetch_add(1, Ordering::Relaxed);
        let key = (packet.source_hash, packet.sequence);
        let resend = {
            let pending = self.inner.pending.lock().expect("pending lock");
            pending.get(&key).map(|e| (e.packet.clone(), e.addr))
        };
        if let Some((pkt, addr)) = resend {
            self.inner.retransmits.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.inner.transport.resend(&pkt, addr).await {
                warn!("nack-triggered retransmit failed: {e}");
            }
        }
    }

    async fn handle_data(&self, packet: Packet, src: SocketAddr) {
        let mut ack = Packet::ack(packet.sequence, self.inner.local_hash, packet.source_hash);
        if let Err(e) = self.inner.transport.send(&mut ack, src).await {
            warn!("failed to ack sequence {}: {e}", packet.sequence);
        }

        let peer_hash = packet.source_hash;
        let key = (packet.source_hash, packet.device_id);
        let (ready, nack_seq) = {
            let mut flows = self.inner.flows.lock().expect("flow lock");
            let flow = flows
                .entry(key)
                .or_insert_with(|| FlowState::new(self.inner.config.buffer.clone(), src));
            flow.addr = src;
            flow.buffer.add_packet(packet);

            let gaps: Vec<u16> = flow.gaps.lock().expect("flow sink").drain(..).collect();
            let ready = flow.collect_ready(!gaps.is_empty());

            let mut nack_seq = None;
            if !gaps.is_empty() {
                let nack_due = flow
                    .last_nack
                    .map(|t| t.elapsed() >= self.inner.config.base_timeout)
                    .unwrap_or(true);
                if nack_due {
                    nack_seq = flow.buffer.next_expected();
                    flow.last_nack = Some(Instant::now());
                }
            }
            (ready, nack_seq)
        };

        if let Some(expected) = nack_seq {
            self.inner.nacks_sent.fetch_add(1, Ordering::Relaxed);
            let mut nack = Packet::nack(expected, self.inner.local_hash, peer_hash);
            if let Err(e) = self.inner.transport.send(&mut nack, src).await {
                warn!("failed to nack sequence {expected}: {e}");
            }
        }

        self.deliver(ready, src);
    }

    fn deliver(&self, packets: Vec<Packet>, src: SocketAddr) {
        if packets.is_empty() {
            return;
        }
        let handler = self
            .inner
            .delivery
            .read()
            .expect("delivery lock")
            .as_ref()
            .cloned();
        if let Some(handler) = handler {
            for pkt in packets {
                handler(pkt, src);
            }
        }
    }

    /// Drives retransmission deadlines and per-flow delivery timeouts until
    /// shutdown flips. Tick rate is half the base timeout.
    pub async fn run_timer(&self, mut shutdown: watch::Receiver<bool>) {
        let tick = self.inner.config.base_timeout / 2;
        let mut interval = tokio::time::interval(tick.max(Duration::from_millis(5)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.on_tick(Instant::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One timer pass: retransmit or fail due sends, flush flow buffers.
    pub async fn on_tick(&self, now: Instant) {
        let mut resends: Vec<(Packet, SocketAddr)> = Vec::new();
        let mut failures: Vec<(FailedCallback, String)> = Vec::new();
        {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            let due: Vec<(u32, u16)> = pending
                .iter()
                .filter(|(_, e)| now >= e.next_deadline)
                .map(|(k, _)| *k)
                .collect();
            for key in due {
                let entry = pending.get_mut(&key).expect("due key present");
                if entry.retries >= self.inner.config.max_retries {
                    let entry = pending.remove(&key).expect("due key present");
                    self.inner.failed.fetch_add(1, Ordering::Relaxed);
                    let reason = format!(
                        "timeout after {} retries ({:?} elapsed)",
                        entry.retries,
                        now.duration_since(entry.first_sent)
                    );
                    warn!("reliable send of sequence {} failed: {reason}", key.1);
                    if let Some(cb) = entry.on_failed {
                        failures.push((cb, reason));
                    }
                } else {
                    entry.retries += 1;
                    let backoff = self
                        .inner
                        .config
                        .base_timeout
                        .saturating_mul(1 << entry.retries.min(6));
                    entry.next_deadline = now + backoff;
                    self.inner.retransmits.fetch_add(1, Ordering::Relaxed);
                    resends.push((entry.packet.clone(), entry.addr));
                }
            }
        }

        for (cb, reason) in failures {
            cb(&reason);
        }
        for (pkt, addr) in resends {
            if let Err(e) = self.inner.transport.resend(&pkt, addr).await {
                debug!("retransmit failed: {e}");
            }
        }

        // Flush flow buffers whose gaps have waited out the delivery timeout.
        let flushed: Vec<(Vec<Packet>, SocketAddr)> = {
            let mut flows = self.inner.flows.lock().expect("flow lock");
            flows
                .values_mut()
                .map(|flow| {
                    flow.buffer.check_timeouts(now);
                    let gapped = !flow.gaps.lock().expect("flow sink").is_empty();
                    flow.gaps.lock().expect("flow sink").clear();
                    (flow.collect_ready(gapped), flow.addr)
                })
                .collect()
        };
        for (ready, addr) in flushed {
            self.deliver(ready, addr);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending lock").len()
    }

    pub fn statistics(&self) -> ReliableStats {
        ReliableStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            acked: self.inner.acked.load(Ordering::Relaxed),
            retransmits: self.inner.retransmits.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            nacks_sent: self.inner.nacks_sent.load(Ordering::Relaxed),
            nacks_received: self.inner.nacks_received.load(Ordering::Relaxed),
        }
    }
}
