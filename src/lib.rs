use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use midi_fabric_core::event_bus::{Event, EventBus};
use midi_fabric_core::{node_hash, NodeId, NodeIdentity, UuidRegistry};
use network::buffer::MessageBufferConfig;
use network::packet::{Packet, PacketType};
use network::reliable::ReliableConfig;
use network::connection::ConnectionPoolStats;
use network::message_router::MessageRouterStats;
use network::reliable::ReliableStats;
use network::transport::TransportStats;
use network::{
    ConnectionPool, ConnectionState, DatagramTransport, FabricSender, MessageRouter,
    NetworkConnection, ReliableTransport,
};
use routing::midi_router::{MidiRouterStats, PeerDirectory};
use routing::{DeviceRegistry, MidiRouter, RouteManager, RoutingTable};

// --- Configuration ---

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub bind_port: u16,
    pub node_name: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub reliable: ReliableSettings,
    #[serde(default)]
    pub buffer: BufferSettings,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PeerConfig {
    pub node_id: uuid::Uuid,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReliableSettings {
    pub base_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ReliableSettings {
    fn default() -> Self {
        Self {
            base_timeout_ms: 100,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BufferSettings {
    pub max_buffer_size: usize,
    pub max_sequence_gap: u16,
    pub allow_duplicates: bool,
    pub delivery_timeout_ms: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: 64,
            max_sequence_gap: 32,
            allow_duplicates: false,
            delivery_timeout_ms: 200,
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            bind_port: 0,
            node_name: None,
            state_dir: None,
            log_level: None,
            peers: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reliable: ReliableSettings::default(),
            buffer: BufferSettings::default(),
        }
    }
}

impl FabricConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let config: FabricConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn reliable_config(&self) -> ReliableConfig {
        ReliableConfig {
            base_timeout: Duration::from_millis(self.reliable.base_timeout_ms),
            max_retries: self.reliable.max_retries,
            buffer: MessageBufferConfig {
                max_buffer_size: self.buffer.max_buffer_size,
                max_sequence_gap: self.buffer.max_sequence_gap,
                allow_duplicates: self.buffer.allow_duplicates,
                delivery_timeout: Duration::from_millis(self.buffer.delivery_timeout_ms),
            },
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(midi_fabric_core::identity::state_dir)
    }
}

// --- Peer directory over the connection pool ---

struct PoolDirectory(Arc<ConnectionPool>);

impl PeerDirectory for PoolDirectory {
    fn resolve(&self, node: NodeId) -> Option<SocketAddr> {
        self.0
            .get_connection(node)
            .filter(|c| c.state() != ConnectionState::Failed)
            .map(|c| c.addr())
    }
}

// --- The assembled node ---

/// One fabric node: transports, registries, and the router, wired together
/// and running on background tasks.
pub struct FabricNode {
    identity: NodeIdentity,
    display_name: String,
    registry: Arc<UuidRegistry>,
    pool: Arc<ConnectionPool>,
    devices: Arc<DeviceRegistry>,
    routes: Arc<RoutingTable>,
    rules: Arc<RouteManager>,
    transport: Arc<DatagramTransport>,
    reliable: Arc<ReliableTransport>,
    message_router: Arc<MessageRouter>,
    midi_router: Arc<MidiRouter>,
    events: Arc<EventBus>,
    tasks_shutdown: watch::Sender<bool>,
    rules_path: PathBuf,
}

impl FabricNode {
    /// Builds and starts every subsystem: identity, registries, transports,
    /// router worker, retransmission timer, heartbeats.
    pub async fn start(config: &FabricConfig) -> Result<Self> {
        let state_dir = config.state_dir();
        let identity = NodeIdentity::load_or_create(&state_dir.join("node-id"))?;
        let display_name = config
            .node_name
            .clone()
            .unwrap_or_else(|| identity.name().to_string());
        let local_id = identity.id();
        let local_hash = node_hash(local_id);
        info!("starting fabric node {display_name} ({local_id})");

        let registry = Arc::new(UuidRegistry::new());
        registry.register(local_id);

        let pool = Arc::new(ConnectionPool::new());
        let devices = Arc::new(DeviceRegistry::new(local_id));
        let routes = Arc::new(RoutingTable::new());
        let rules = Arc::new(RouteManager::new(Arc::clone(&devices)));
        let events = Arc::new(EventBus::new(256));

        let rules_path = state_dir.join("rules.json");
        match rules.load_from_file(&rules_path) {
            Ok(count) if count > 0 => {
                info!("loaded {count} forwarding rules");
                events.publish(Event::RulesReloaded { count });
            }
            Ok(_) => {}
            Err(e) => warn!("starting with an empty rule set: {e}"),
        }

        let transport = Arc::new(DatagramTransport::new());
        transport.start(config.bind_port).await?;
        let reliable = Arc::new(ReliableTransport::new(
            Arc::clone(&transport),
            local_hash,
            config.reliable_config(),
        ));
        let message_router = Arc::new(MessageRouter::new(
            Arc::clone(&transport),
            Arc::clone(&reliable),
            local_hash,
        ));

        let midi_router = Arc::new(MidiRouter::new(
            local_id,
            Arc::clone(&devices),
            Arc::clone(&routes),
            Arc::clone(&rules),
        ));
        midi_router.start();
        midi_router
            .set_network_transport(Some(Arc::clone(&message_router) as Arc<dyn FabricSender>));
        midi_router.set_peer_directory(Some(Arc::new(PoolDirectory(Arc::clone(&pool)))));

        let (tasks_shutdown, shutdown_rx) = watch::channel(false);

        // Ingress plumbing: the receive task pushes into a channel, the
        // dispatcher classifies and feeds the reliable layer or the router.
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        transport.set_packet_handler(move |pkt, src| {
            let _ = ingress_tx.send((pkt, src));
        });
        transport.set_error_handler(|msg| error!("transport: {msg}"));

        spawn_dispatcher(
            ingress_rx,
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&reliable),
            Arc::clone(&midi_router),
            Arc::clone(&events),
            shutdown_rx.clone(),
        );

        {
            let delivered_registry = Arc::clone(&registry);
            let delivered_router = Arc::clone(&midi_router);
            let delivered_events = Arc::clone(&events);
            reliable.set_delivery_handler(move |pkt, _src| {
                ingress_packet(
                    &delivered_registry,
                    &delivered_router,
                    &delivered_events,
                    pkt,
                );
            });
        }

        {
            let reliable = Arc::clone(&reliable);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                reliable.run_timer(shutdown).await;
            });
        }

        spawn_heartbeat(
            Duration::from_millis(config.heartbeat_interval_ms),
            local_hash,
            Arc::clone(&transport),
            Arc::clone(&pool),
            Arc::clone(&devices),
            Arc::clone(&routes),
            Arc::clone(&registry),
            Arc::clone(&events),
            shutdown_rx,
        );

        let node = Self {
            identity,
            display_name,
            registry,
            pool,
            devices,
            routes,
            rules,
            transport,
            reliable,
            message_router,
            midi_router,
            events,
            tasks_shutdown,
            rules_path,
        };

        for peer in &config.peers {
            let addr = tokio::net::lookup_host((peer.host.as_str(), peer.port))
                .await
                .with_context(|| format!("resolving peer {}:{}", peer.host, peer.port))?
                .next()
                .ok_or_else(|| {
                    anyhow::anyhow!("peer {}:{} resolved to nothing", peer.host, peer.port)
                })?;
            let name = peer.name.clone().unwrap_or_else(|| peer.node_id.to_string());
            node.add_peer(NodeId(peer.node_id), &name, addr)?;
        }

        Ok(node)
    }

    /// Registers a peer: uuid mapping plus a pooled connection in
    /// Connecting state. Duplicate node ids are rejected.
    pub fn add_peer(&self, node: NodeId, name: &str, addr: SocketAddr) -> Result<()> {
        self.registry.register(node);
        let conn = Arc::new(NetworkConnection::new(node, name, addr));
        conn.set_state(ConnectionState::Connecting);
        self.pool
            .add_connection(conn)
            .map_err(|_| anyhow::anyhow!("peer {node} already registered"))?;
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    pub fn name(&self) -> &str {
        &self.display_name
    }

    pub fn port(&self) -> u16 {
        self.transport.local_port().unwrap_or(0)
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn rules(&self) -> &Arc<RouteManager> {
        &self.rules
    }

    pub fn router(&self) -> &Arc<MidiRouter> {
        &self.midi_router
    }

    pub fn message_router(&self) -> &Arc<MessageRouter> {
        &self.message_router
    }

    pub fn connections(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn reliable(&self) -> &Arc<ReliableTransport> {
        &self.reliable
    }

    /// A point-in-time snapshot of every subsystem's counters, for CLI and
    /// diagnostic surfaces.
    pub fn status(&self) -> FabricStatus {
        FabricStatus {
            node: self.identity.id(),
            name: self.display_name.clone(),
            port: self.port(),
            transport: self.transport.statistics(),
            reliable: self.reliable.statistics(),
            message_router: self.message_router.statistics(),
            router: self.midi_router.statistics(),
            connections: self.pool.statistics(),
            local_devices: self.devices.get_local().len(),
            remote_devices: self.devices.get_remote().len(),
            rules: self.rules.rule_count(),
        }
    }

    /// Persists rules, drains the router, and stops every task.
    pub async fn shutdown(&self) {
        if let Err(e) = self.rules.save_to_file(&self.rules_path) {
            warn!("could not persist rules: {e}");
        }
        self.midi_router.drain().await;
        self.midi_router.shutdown().await;
        let _ = self.tasks_shutdown.send(true);
        self.transport.stop().await;
        info!("fabric node {} stopped", self.identity.name());
    }
}

/// Aggregated node diagnostics; see [FabricNode::status].
#[derive(Debug, Clone)]
pub struct FabricStatus {
    pub node: NodeId,
    pub name: String,
    pub port: u16,
    pub transport: TransportStats,
    pub reliable: ReliableStats,
    pub message_router: MessageRouterStats,
    pub router: MidiRouterStats,
    pub connections: ConnectionPoolStats,
    pub local_devices: usize,
    pub remote_devices: usize,
    pub rules: usize,
}

/// Routes one ordered or real-time arrival into the forwarding engine.
fn ingress_packet(
    registry: &UuidRegistry,
    router: &MidiRouter,
    events: &EventBus,
    pkt: Packet,
) {
    let Some(source) = registry.lookup(pkt.source_hash) else {
        debug!("dropping packet from unknown node hash 0x{:08X}", pkt.source_hash);
        router.count_routing_error();
        return;
    };
    let context = match pkt.forwarding_context(registry) {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!("dropping packet with unresolvable context: {e}");
            router.count_routing_error();
            return;
        }
    };
    if log::log_enabled!(log::Level::Debug) {
        if let Ok((command, _)) = midi_fabric_core::parse_midi_message(&pkt.payload) {
            debug!("{source} -> device {}: {command:?}", pkt.device_id);
        }
    }
    events.publish(Event::MidiDelivered {
        source,
        device: pkt.device_id,
        bytes: pkt.payload.clone(),
    });
    router.deliver_from_network(pkt.device_id, pkt.payload, context);
}

fn spawn_dispatcher(
    mut ingress_rx: mpsc::UnboundedReceiver<(Packet, SocketAddr)>,
    registry: Arc<UuidRegistry>,
    pool: Arc<ConnectionPool>,
    reliable: Arc<ReliableTransport>,
    router: Arc<MidiRouter>,
    events: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                item = ingress_rx.recv() => {
                    let Some((pkt, src)) = item else { return };
                    match pkt.packet_type() {
                        PacketType::Ack | PacketType::Nack => {
                            reliable.handle_packet(pkt, src).await;
                        }
                        PacketType::Data if pkt.is_reliable() => {
                            touch_peer(&registry, &pool, &events, pkt.source_hash, src);
                            reliable.handle_packet(pkt, src).await;
                        }
                        PacketType::Data => {
                            touch_peer(&registry, &pool, &events, pkt.source_hash, src);
                            ingress_packet(&registry, &router, &events, pkt);
                        }
                        PacketType::Heartbeat => {
                            touch_peer(&registry, &pool, &events, pkt.source_hash, src);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}

fn touch_peer(
    registry: &UuidRegistry,
    pool: &ConnectionPool,
    events: &EventBus,
    source_hash: u32,
    src: SocketAddr,
) {
    let Some(node) = registry.lookup(source_hash) else {
        return;
    };
    if let Some(conn) = pool.get_connection(node) {
        let was_connected = conn.state() == ConnectionState::Connected;
        conn.touch();
        if !was_connected {
            events.publish(Event::PeerConnected { node, addr: src });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_heartbeat(
    interval: Duration,
    local_hash: u32,
    transport: Arc<DatagramTransport>,
    pool: Arc<ConnectionPool>,
    devices: Arc<DeviceRegistry>,
    routes: Arc<RoutingTable>,
    registry: Arc<UuidRegistry>,
    events: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            for conn in pool.get_all_connections() {
                let mut hb = Packet::heartbeat(local_hash, node_hash(conn.node_id()));
                if let Err(e) = transport.send(&mut hb, conn.addr()).await {
                    debug!("heartbeat to {} failed: {e}", conn.node_id());
                }

                if conn.last_seen().elapsed() > interval * 3 {
                    let missed = conn.note_missed_heartbeat();
                    match conn.state() {
                        ConnectionState::Connected => {
                            conn.set_state(ConnectionState::Failing);
                            events.publish(Event::PeerFailing {
                                node: conn.node_id(),
                            });
                        }
                        ConnectionState::Failing | ConnectionState::Connecting
                            if missed > 5 =>
                        {
                            conn.set_state(ConnectionState::Failed);
                        }
                        _ => {}
                    }
                }
            }

            // A failed peer takes its devices and routes with it, atomically
            // per store.
            for dead in pool.remove_dead_connections() {
                let node = dead.node_id();
                warn!("peer {node} failed; dropping its inventory");
                devices.remove_node_devices(node);
                routes.remove_node_routes(node);
                registry.unregister(node);
                events.publish(Event::PeerLost { node });
            }
        }
    });
}

/// Runs a node until the shutdown flag flips. The binary's entry point.
pub async fn run_service_loop(config: FabricConfig, mut shutdown: watch::Receiver<bool>) {
    let node = match FabricNode::start(&config).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start fabric node: {e:#}");
            return;
        }
    };

    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    node.shutdown().await;
    info!("service has shut down gracefully");
}
