// routing/src/midi_router.rs

use crate::device_registry::DeviceRegistry;
use crate::route_manager::{ForwardingRule, RouteManager};
use crate::routing_table::RoutingTable;
use log::{debug, warn};
use midi_fabric_core::{midi_channel, DeviceId, MidiMessageKind, NodeId, TransportError};
use network::message_router::FabricSender;
use network::packet::{ForwardingContext, MAX_HOPS};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// Default bound on the ingress queue; overflow drops the oldest entry.
pub const DEFAULT_QUEUE_LIMIT: usize = 65536;

/// A local MIDI port the router can write to. `send` must never block; a
/// failing port is removed from the active set.
pub trait LocalPort: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;
    fn name(&self) -> &str;
    fn is_input(&self) -> bool;
    fn is_output(&self) -> bool;
}

/// Resolves a peer's transport address. Supplied by the discovery
/// collaborator; resolution may fail for unknown peers.
pub trait PeerDirectory: Send + Sync {
    fn resolve(&self, node: NodeId) -> Option<SocketAddr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Ready,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct MidiRouterStats {
    pub messages_forwarded: u64,
    pub routing_errors: u64,
    pub loops_detected: u64,
    pub queue_dropped: u64,
}

enum WorkItem {
    /// A message entering the fabric at a local source device, or chained
    /// from an earlier hop.
    Ingress {
        src_node: NodeId,
        src_dev: DeviceId,
        bytes: Vec<u8>,
        context: Option<ForwardingContext>,
    },
    /// An ordered network arrival addressed to one of our devices: written
    /// to the port, then chained through the rules with that device as the
    /// new source.
    Network {
        device: DeviceId,
        bytes: Vec<u8>,
        context: Option<ForwardingContext>,
    },
}

/// The forwarding engine: applies rules to each ingress message, fans out to
/// local ports and peer transports, and stops loops via the in-packet
/// visited set.
///
/// Ingress is queued onto a single worker so rule lookups and dispatch never
/// contend with control-plane mutation; `forward` returns as soon as the
/// work is enqueued.
pub struct MidiRouter {
    inner: Arc<RouterInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct RouterInner {
    local_node: NodeId,
    devices: Arc<DeviceRegistry>,
    routes: Arc<RoutingTable>,
    rules: Arc<RouteManager>,
    transport: RwLock<Option<Arc<dyn FabricSender>>>,
    directory: RwLock<Option<Arc<dyn PeerDirectory>>>,
    ports: RwLock<HashMap<DeviceId, Arc<dyn LocalPort>>>,
    queue: Mutex<VecDeque<WorkItem>>,
    queue_limit: usize,
    drain_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    notify: Notify,
    state: AtomicU8,
    messages_forwarded: AtomicU64,
    routing_errors: AtomicU64,
    loops_detected: AtomicU64,
    queue_dropped: AtomicU64,
}

const STATE_READY: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_STOPPED: u8 = 2;

impl MidiRouter {
    pub fn new(
        local_node: NodeId,
        devices: Arc<DeviceRegistry>,
        routes: Arc<RoutingTable>,
        rules: Arc<RouteManager>,
    ) -> Self {
        Self::with_queue_limit(local_node, devices, routes, rules, DEFAULT_QUEUE_LIMIT)
    }

    pub fn with_queue_limit(
        local_node: NodeId,
        devices: Arc<DeviceRegistry>,
        routes: Arc<RoutingTable>,
        rules: Arc<RouteManager>,
        queue_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                local_node,
                devices,
                routes,
                rules,
                transport: RwLock::new(None),
                directory: RwLock::new(None),
                ports: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                queue_limit,
                drain_waiters: Mutex::new(Vec::new()),
                notify: Notify::new(),
                state: AtomicU8::new(STATE_READY),
                messages_forwarded: AtomicU64::new(0),
                routing_errors: AtomicU64::new(0),
                loops_detected: AtomicU64::new(0),
                queue_dropped: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker task. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker lock");
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move {
            inner.run().await;
        }));
    }

    pub fn state(&self) -> RouterState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_DRAINING => RouterState::Draining,
            STATE_STOPPED => RouterState::Stopped,
            _ => RouterState::Ready,
        }
    }

    /// Queues one ingress message for forwarding. Callable from any thread;
    /// returns immediately.
    pub fn forward(
        &self,
        src_node: NodeId,
        src_dev: DeviceId,
        bytes: Vec<u8>,
        context: Option<ForwardingContext>,
    ) {
        self.enqueue(WorkItem::Ingress {
            src_node,
            src_dev,
            bytes,
            context,
        });
    }

    /// Queues an ordered network arrival addressed to a local device.
    pub fn deliver_from_network(
        &self,
        device: DeviceId,
        bytes: Vec<u8>,
        context: Option<ForwardingContext>,
    ) {
        self.enqueue(WorkItem::Network {
            device,
            bytes,
            context,
        });
    }

    fn enqueue(&self, item: WorkItem) {
        if self.inner.state.load(Ordering::Acquire) == STATE_STOPPED {
            debug!("router stopped; dropping ingress");
            return;
        }
        {
            let mut queue = self.inner.queue.lock().expect("queue lock");
            queue.push_back(item);
            if queue.len() > self.inner.queue_limit {
                queue.pop_front();
                self.inner.queue_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.notify.notify_one();
    }

    /// Waits until every message queued so far has been processed.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.state.compare_exchange(
            STATE_READY,
            STATE_DRAINING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner
            .drain_waiters
            .lock()
            .expect("drain lock")
            .push(tx);
        self.inner.notify.notify_one();
        let _ = rx.await;
        let _ = self.inner.state.compare_exchange(
            STATE_DRAINING,
            STATE_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Processes what is queued, then stops the worker.
    pub async fn shutdown(&self) {
        self.inner.state.store(STATE_STOPPED, Ordering::Release);
        self.inner.notify.notify_one();
        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn set_network_transport(&self, transport: Option<Arc<dyn FabricSender>>) {
        *self.inner.transport.write().expect("transport lock") = transport;
    }

    pub fn set_peer_directory(&self, directory: Option<Arc<dyn PeerDirectory>>) {
        *self.inner.directory.write().expect("directory lock") = directory;
    }

    /// Registers a local output port; visible to subsequent forwards from
    /// any thread.
    pub fn register_local_port(&self, device: DeviceId, port: Arc<dyn LocalPort>) {
        self.inner
            .ports
            .write()
            .expect("port lock")
            .insert(device, port);
    }

    pub fn unregister_local_port(&self, device: DeviceId) {
        self.inner.ports.write().expect("port lock").remove(&device);
    }

    pub fn statistics(&self) -> MidiRouterStats {
        MidiRouterStats {
            messages_forwarded: self.inner.messages_forwarded.load(Ordering::Relaxed),
            routing_errors: self.inner.routing_errors.load(Ordering::Relaxed),
            loops_detected: self.inner.loops_detected.load(Ordering::Relaxed),
            queue_dropped: self.inner.queue_dropped.load(Ordering::Relaxed),
        }
    }

    /// Lets collaborators attribute drops (e.g. unresolvable source hashes)
    /// to the router's error counter.
    pub fn count_routing_error(&self) {
        self.inner.routing_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl RouterInner {
    async fn run(self: Arc<Self>) {
        loop {
            let notified = self.notify.notified();
            let item = self.queue.lock().expect("queue lock").pop_front();
            match item {
                Some(item) => self.process(item).await,
                None => {
                    let waiters: Vec<oneshot::Sender<()>> = self
                        .drain_waiters
                        .lock()
                        .expect("drain lock")
                        .drain(..)
                        .collect();
                    for waiter in waiters {
                        let _ = waiter.send(());
                    }
                    if self.state.load(Ordering::Acquire) == STATE_STOPPED {
                        return;
                    }
                    notified.await;
                }
            }
        }
    }

    async fn process(&self, item: WorkItem) {
        match item {
            WorkItem::Ingress {
                src_node,
                src_dev,
                bytes,
                context,
            } => {
                self.route_message(src_node, src_dev, bytes, context).await;
            }
            WorkItem::Network {
                device,
                bytes,
                context,
            } => {
                self.write_local_port(device, &bytes);
                self.route_message(self.local_node, device, bytes, context)
                    .await;
            }
        }
    }

    /// The forwarding algorithm: context bootstrap, local ingestion, rule
    /// fan-out with filters and loop prevention.
    async fn route_message(
        &self,
        src_node: NodeId,
        src_dev: DeviceId,
        bytes: Vec<u8>,
        context: Option<ForwardingContext>,
    ) {
        let src_node = if src_node.is_local() {
            self.local_node
        } else {
            src_node
        };
        let mut ctx = context.unwrap_or_default();
        if ctx.hop_count >= MAX_HOPS || ctx.contains(src_node, src_dev) {
            self.loops_detected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !ctx.push(src_node, src_dev) {
            self.loops_detected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let rules = self.rules.get_destinations(src_node, src_dev);
        let status = bytes.first().copied().unwrap_or(0);
        let kind = MidiMessageKind::from_status(status);

        for rule in rules {
            if !channel_matches(&rule, status) {
                self.rules.update_rule_statistics(&rule.id, false);
                continue;
            }
            match kind {
                Some(kind) if rule.message_types.contains(kind) => {}
                _ => {
                    self.rules.update_rule_statistics(&rule.id, false);
                    continue;
                }
            }

            // Rules may spell this node as the all-zero sentinel; visited
            // sets always hold the real id.
            let dst_node = if rule.dst_node.is_local() {
                self.local_node
            } else {
                rule.dst_node
            };
            let dest_context = ctx.clone();
            if dest_context.contains(dst_node, rule.dst_dev) {
                self.loops_detected.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let dispatched = if dst_node == self.local_node {
                self.write_local_port(rule.dst_dev, &bytes)
            } else {
                self.dispatch_remote(&rule, dst_node, bytes.clone(), &dest_context)
                    .await
            };
            if dispatched {
                self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
                self.rules.update_rule_statistics(&rule.id, true);
            }
        }
    }

    fn write_local_port(&self, device: DeviceId, bytes: &[u8]) -> bool {
        let port = self
            .ports
            .read()
            .expect("port lock")
            .get(&device)
            .cloned();
        match port {
            Some(port) => match port.send(bytes) {
                Ok(()) => true,
                Err(e) => {
                    warn!("local port {} ({}) failed: {e}; removing", device, port.name());
                    self.ports.write().expect("port lock").remove(&device);
                    self.routing_errors.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            None => {
                self.routing_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    async fn dispatch_remote(
        &self,
        rule: &ForwardingRule,
        dst_node: NodeId,
        bytes: Vec<u8>,
        context: &ForwardingContext,
    ) -> bool {
        let transport = self.transport.read().expect("transport lock").clone();
        let Some(transport) = transport else {
            self.routing_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if self.routes.get_route(dst_node, rule.dst_dev).is_none() {
            debug!(
                "no route for {}:{}; peer inventory is stale",
                dst_node, rule.dst_dev
            );
            self.routing_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let directory = self.directory.read().expect("directory lock").clone();
        let addr = directory.and_then(|d| d.resolve(dst_node));
        let Some(addr) = addr else {
            self.routing_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match transport
            .forward_midi(bytes, rule.dst_dev, dst_node, addr, context)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!("remote dispatch to {} failed: {e}", dst_node);
                self.routing_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Channel filters apply to channel-voice messages only; system messages
/// carry no channel and pass through.
fn channel_matches(rule: &ForwardingRule, status: u8) -> bool {
    match rule.channel_filter {
        None | Some(0) => true,
        Some(filter) => match midi_channel(status) {
            Some(channel) => channel == filter,
            None => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_registry::{DeviceKind, DeviceRecord};
    use crate::route_manager::NewRule;
    use crate::routing_table::Route;
    use async_trait::async_trait;
    use midi_fabric_core::MessageTypeMask;

    struct RecordingPort {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl RecordingPort {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn taken(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl LocalPort for RecordingPort {
        fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::PortDead);
            }
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
        fn name(&self) -> &str {
            "recording"
        }
        fn is_input(&self) -> bool {
            false
        }
        fn is_output(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(Vec<u8>, DeviceId, NodeId, ForwardingContext)>>,
    }

    #[async_trait]
    impl FabricSender for RecordingSender {
        async fn forward_midi(
            &self,
            bytes: Vec<u8>,
            device: DeviceId,
            dest_node: NodeId,
            _addr: SocketAddr,
            context: &ForwardingContext,
        ) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((bytes, device, dest_node, context.clone()));
            Ok(())
        }
    }

    struct StaticDirectory;

    impl PeerDirectory for StaticDirectory {
        fn resolve(&self, _node: NodeId) -> Option<SocketAddr> {
            Some("127.0.0.1:5004".parse().unwrap())
        }
    }

    struct Fixture {
        router: MidiRouter,
        sender: Arc<RecordingSender>,
        rules: Arc<RouteManager>,
        local: NodeId,
        n1: NodeId,
        n2: NodeId,
    }

    fn remote_device(owner: NodeId, id: DeviceId) -> DeviceRecord {
        DeviceRecord {
            id,
            owner,
            name: format!("dev-{id}"),
            kind: DeviceKind::Output,
            manufacturer: "Akai".into(),
        }
    }

    fn fixture() -> Fixture {
        let local = NodeId::new_random();
        let n1 = NodeId::new_random();
        let n2 = NodeId::new_random();
        let devices = Arc::new(DeviceRegistry::new(local));
        devices.add_local_with_id(DeviceRecord {
            id: 1,
            owner: local,
            name: "local-in".into(),
            kind: DeviceKind::Input,
            manufacturer: "Akai".into(),
        });
        devices.add_local_with_id(DeviceRecord {
            id: 2,
            owner: local,
            name: "local-out".into(),
            kind: DeviceKind::Output,
            manufacturer: "Akai".into(),
        });
        devices.add_remote(n1, remote_device(n1, 10));
        devices.add_remote(n2, remote_device(n2, 20));

        let routes = Arc::new(RoutingTable::new());
        for (node, dev) in [(n1, 10), (n2, 20)] {
            routes.add_route(Route {
                node,
                device: dev,
                name: format!("dev-{dev}"),
                kind: DeviceKind::Output,
            });
        }

        let rules = Arc::new(RouteManager::new(Arc::clone(&devices)));
        let router = MidiRouter::new(local, devices, routes, Arc::clone(&rules));
        let sender = Arc::new(RecordingSender::default());
        router.set_network_transport(Some(Arc::clone(&sender) as Arc<dyn FabricSender>));
        router.set_peer_directory(Some(Arc::new(StaticDirectory)));
        Fixture {
            router,
            sender,
            rules,
            local,
            n1,
            n2,
        }
    }

    #[tokio::test]
    async fn s5_fanout_applies_filters() {
        let f = fixture();
        f.router.start();

        let r1 = f
            .rules
            .add_rule(
                NewRule::new(NodeId::LOCAL, 1, f.n1, 10)
                    .priority(100)
                    .channel(1)
                    .types(MessageTypeMask::only(&[
                        MidiMessageKind::NoteOn,
                        MidiMessageKind::NoteOff,
                    ])),
            )
            .unwrap();
        let r2 = f
            .rules
            .add_rule(
                NewRule::new(NodeId::LOCAL, 1, f.n2, 20)
                    .priority(100)
                    .types(MessageTypeMask::only(&[MidiMessageKind::ControlChange])),
            )
            .unwrap();

        // NoteOn, channel 1, note 60, velocity 100.
        f.router
            .forward(f.local, 1, vec![0x90, 60, 100], None);
        f.router.drain().await;

        let sent = f.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let (bytes, device, node, ctx) = &sent[0];
        assert_eq!(bytes, &vec![0x90, 60, 100]);
        assert_eq!(*device, 10);
        assert_eq!(*node, f.n1);
        assert!(ctx.contains(f.local, 1));
        assert_eq!(ctx.hop_count, 1);

        assert_eq!(f.rules.get_rule(&r1).unwrap().stats.forwarded, 1);
        assert_eq!(f.rules.get_rule(&r2).unwrap().stats.dropped, 1);
        assert_eq!(f.router.statistics().messages_forwarded, 1);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn channel_filter_drops_mismatched_channel() {
        let f = fixture();
        f.router.start();
        let rule = f
            .rules
            .add_rule(NewRule::new(NodeId::LOCAL, 1, f.n1, 10).channel(2))
            .unwrap();

        f.router.forward(f.local, 1, vec![0x90, 60, 100], None); // channel 1
        f.router.forward(f.local, 1, vec![0x91, 60, 100], None); // channel 2
        f.router.drain().await;

        assert_eq!(f.sender.sent.lock().unwrap().len(), 1);
        let stats = f.rules.get_rule(&rule).unwrap().stats;
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.dropped, 1);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn s6_visited_destination_is_skipped_but_others_proceed() {
        let f = fixture();
        f.router.start();
        let port2 = RecordingPort::new();
        f.router.register_local_port(2, Arc::clone(&port2) as Arc<dyn LocalPort>);

        // Chained rules from (local, 2): one back to the already-visited
        // (local, 1), one onward to n2.
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 2, NodeId::LOCAL, 1).priority(10))
            .unwrap();
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 2, f.n2, 20).priority(5))
            .unwrap();

        // Arrival from n1 addressed to our device 2, already through
        // (local, 1) and (n1, 10).
        let mut ctx = ForwardingContext::new();
        ctx.push(f.local, 1);
        ctx.push(f.n1, 10);
        f.router
            .deliver_from_network(2, vec![0x90, 60, 100], Some(ctx));
        f.router.drain().await;

        // Addressed delivery reached the port.
        assert_eq!(port2.taken(), vec![vec![0x90, 60, 100]]);

        // The dispatch back to (local, 1) was suppressed; n2 still got it.
        let sent = f.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, f.n2);
        assert!(sent[0].3.contains(f.local, 2));
        assert_eq!(sent[0].3.hop_count, 3);
        assert_eq!(f.router.statistics().loops_detected, 1);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn hop_cap_stops_forwarding() {
        let f = fixture();
        f.router.start();
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 1, f.n1, 10))
            .unwrap();

        let mut ctx = ForwardingContext::new();
        for dev in 100..100 + MAX_HOPS as u16 {
            ctx.push(NodeId::new_random(), dev);
        }
        assert_eq!(ctx.hop_count, MAX_HOPS);

        f.router
            .forward(f.local, 1, vec![0x90, 60, 100], Some(ctx));
        f.router.drain().await;

        assert!(f.sender.sent.lock().unwrap().is_empty());
        assert_eq!(f.router.statistics().loops_detected, 1);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn revisited_source_is_dropped_at_ingress() {
        let f = fixture();
        f.router.start();
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 1, f.n1, 10))
            .unwrap();

        let mut ctx = ForwardingContext::new();
        ctx.push(f.local, 1);
        f.router
            .forward(f.local, 1, vec![0x90, 60, 100], Some(ctx));
        f.router.drain().await;

        assert!(f.sender.sent.lock().unwrap().is_empty());
        assert_eq!(f.router.statistics().loops_detected, 1);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn failing_local_port_is_removed() {
        let f = fixture();
        f.router.start();
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 1, NodeId::LOCAL, 2))
            .unwrap();
        f.router
            .register_local_port(2, RecordingPort::failing() as Arc<dyn LocalPort>);

        f.router.forward(f.local, 1, vec![0x90, 60, 100], None);
        f.router.drain().await;
        assert_eq!(f.router.statistics().routing_errors, 1);

        // The port is gone now; the next forward errors on the missing port.
        f.router.forward(f.local, 1, vec![0x90, 60, 100], None);
        f.router.drain().await;
        assert_eq!(f.router.statistics().routing_errors, 2);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn missing_transport_counts_routing_errors() {
        let f = fixture();
        f.router.start();
        f.router.set_network_transport(None);
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 1, f.n1, 10))
            .unwrap();

        f.router.forward(f.local, 1, vec![0x90, 60, 100], None);
        f.router.drain().await;
        assert_eq!(f.router.statistics().routing_errors, 1);
        assert_eq!(f.router.statistics().messages_forwarded, 0);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn priority_orders_the_fanout() {
        let f = fixture();
        f.router.start();
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 1, f.n2, 20).priority(1))
            .unwrap();
        f.rules
            .add_rule(NewRule::new(NodeId::LOCAL, 1, f.n1, 10).priority(100))
            .unwrap();

        f.router.forward(f.local, 1, vec![0x90, 60, 100], None);
        f.router.drain().await;

        let sent = f.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].2, f.n1);
        assert_eq!(sent[1].2, f.n2);
        f.router.shutdown().await;
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let local = NodeId::new_random();
        let devices = Arc::new(DeviceRegistry::new(local));
        let routes = Arc::new(RoutingTable::new());
        let rules = Arc::new(RouteManager::new(Arc::clone(&devices)));
        let router = MidiRouter::with_queue_limit(local, devices, routes, rules, 4);

        for _ in 0..10 {
            router.forward(local, 1, vec![0xF8], None);
        }
        assert_eq!(router.statistics().queue_dropped, 6);
    }
}
