use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use midi_fabric_core::{NodeId, TransportError};
use midi_fabric_lib::{FabricConfig, FabricNode};
use routing::device_registry::{DeviceKind, DeviceRecord};
use routing::midi_router::LocalPort;
use routing::route_manager::NewRule;
use routing::routing_table::Route;

struct RecordingPort {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingPort {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn first(&self) -> Option<Vec<u8>> {
        self.sent.lock().unwrap().first().cloned()
    }
}

impl LocalPort for RecordingPort {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
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

async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn start_node(dir: &tempfile::TempDir) -> FabricNode {
    let config = FabricConfig {
        bind_port: 0,
        state_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    FabricNode::start(&config).await.unwrap()
}

fn local_device(owner: NodeId, id: u16, kind: DeviceKind) -> DeviceRecord {
    DeviceRecord {
        id,
        owner,
        name: format!("dev-{id}"),
        kind,
        manufacturer: "Akai".into(),
    }
}

/// Makes `node` aware of a device owned by `owner`, in both the registry and
/// the routing table, the way the inventory-sync collaborator would.
fn learn_remote_device(node: &FabricNode, owner: NodeId, id: u16) {
    node.devices()
        .add_remote(owner, local_device(owner, id, DeviceKind::Output));
    node.routes().add_route(Route {
        node: owner,
        device: id,
        name: format!("dev-{id}"),
        kind: DeviceKind::Output,
    });
}

fn link(a: &FabricNode, b: &FabricNode) {
    a.add_peer(b.id(), b.name(), format!("127.0.0.1:{}", b.port()).parse().unwrap())
        .unwrap();
    b.add_peer(a.id(), a.name(), format!("127.0.0.1:{}", a.port()).parse().unwrap())
        .unwrap();
}

#[tokio::test]
async fn real_time_note_crosses_the_fabric() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(&dir_a).await;
    let b = start_node(&dir_b).await;
    link(&a, &b);

    a.devices()
        .add_local_with_id(local_device(a.id(), 1, DeviceKind::Input));
    b.devices()
        .add_local_with_id(local_device(b.id(), 10, DeviceKind::Output));
    learn_remote_device(&a, b.id(), 10);

    let port = RecordingPort::new();
    b.router()
        .register_local_port(10, Arc::clone(&port) as Arc<dyn LocalPort>);

    a.rules()
        .add_rule(NewRule::new(NodeId::LOCAL, 1, b.id(), 10).priority(100))
        .unwrap();

    a.router().forward(a.id(), 1, vec![0x90, 60, 100], None);
    a.router().drain().await;

    assert!(wait_for(Duration::from_secs(2), || port.count() == 1).await);
    assert_eq!(port.first().unwrap(), vec![0x90, 60, 100]);
    assert_eq!(a.router().statistics().messages_forwarded, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn sysex_takes_the_reliable_path_and_gets_acked() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(&dir_a).await;
    let b = start_node(&dir_b).await;
    link(&a, &b);

    a.devices()
        .add_local_with_id(local_device(a.id(), 1, DeviceKind::Input));
    b.devices()
        .add_local_with_id(local_device(b.id(), 10, DeviceKind::Output));
    learn_remote_device(&a, b.id(), 10);

    let port = RecordingPort::new();
    b.router()
        .register_local_port(10, Arc::clone(&port) as Arc<dyn LocalPort>);

    a.rules()
        .add_rule(NewRule::new(NodeId::LOCAL, 1, b.id(), 10))
        .unwrap();

    let sysex = vec![0xF0, 0x47, 0x00, 0x19, 0xF7];
    a.router().forward(a.id(), 1, sysex.clone(), None);
    a.router().drain().await;

    assert!(wait_for(Duration::from_secs(2), || port.count() == 1).await);
    assert_eq!(port.first().unwrap(), sysex);
    assert!(wait_for(Duration::from_secs(2), || {
        a.reliable().statistics().acked == 1
    })
    .await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn bulk_sysex_is_fragmented_and_reassembled() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(&dir_a).await;
    let b = start_node(&dir_b).await;
    link(&a, &b);

    a.devices()
        .add_local_with_id(local_device(a.id(), 1, DeviceKind::Input));
    b.devices()
        .add_local_with_id(local_device(b.id(), 10, DeviceKind::Output));
    learn_remote_device(&a, b.id(), 10);

    let port = RecordingPort::new();
    b.router()
        .register_local_port(10, Arc::clone(&port) as Arc<dyn LocalPort>);
    a.rules()
        .add_rule(NewRule::new(NodeId::LOCAL, 1, b.id(), 10))
        .unwrap();

    // A firmware-sized dump, several times the fragment payload.
    let mut dump = vec![0xF0, 0x47, 0x00, 0x19];
    dump.extend((0..4000).map(|i| (i % 128) as u8));
    dump.push(0xF7);

    a.router().forward(a.id(), 1, dump.clone(), None);
    a.router().drain().await;

    assert!(wait_for(Duration::from_secs(3), || port.count() == 1).await);
    assert_eq!(port.first().unwrap(), dump);
    assert_eq!(a.message_router().statistics().fragments, 3);

    let status = a.status();
    assert_eq!(status.router.messages_forwarded, 1);
    assert_eq!(status.rules, 1);
    assert!(status.transport.packets_sent >= 4);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn forwarding_context_survives_the_hop_and_stops_the_loop() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(&dir_a).await;
    let b = start_node(&dir_b).await;
    link(&a, &b);

    // A owns an input (1) and an output (2); B owns an output (10).
    a.devices()
        .add_local_with_id(local_device(a.id(), 1, DeviceKind::Input));
    a.devices()
        .add_local_with_id(local_device(a.id(), 2, DeviceKind::Output));
    b.devices()
        .add_local_with_id(local_device(b.id(), 10, DeviceKind::Output));
    learn_remote_device(&a, b.id(), 10);
    learn_remote_device(&b, a.id(), 2);

    let port_b10 = RecordingPort::new();
    b.router()
        .register_local_port(10, Arc::clone(&port_b10) as Arc<dyn LocalPort>);
    let port_a2 = RecordingPort::new();
    a.router()
        .register_local_port(2, Arc::clone(&port_a2) as Arc<dyn LocalPort>);

    // A sends its input onward to B; whatever B plays on 10 is chained back
    // to A's output 2; A would chain device 2 right back to B.
    a.rules()
        .add_rule(NewRule::new(NodeId::LOCAL, 1, b.id(), 10))
        .unwrap();
    b.rules()
        .add_rule(NewRule::new(NodeId::LOCAL, 10, a.id(), 2))
        .unwrap();
    a.rules()
        .add_rule(NewRule::new(NodeId::LOCAL, 2, b.id(), 10))
        .unwrap();

    a.router().forward(a.id(), 1, vec![0x90, 60, 100], None);
    a.router().drain().await;

    // The message reaches B's port, comes back to A's port 2, and dies
    // there: (B, 10) is already in the visited set.
    assert!(wait_for(Duration::from_secs(2), || port_b10.count() == 1).await);
    assert!(wait_for(Duration::from_secs(2), || port_a2.count() == 1).await);
    assert!(wait_for(Duration::from_secs(2), || {
        a.router().statistics().loops_detected == 1
    })
    .await);

    // Nothing bounced again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(port_b10.count(), 1);
    assert_eq!(port_a2.count(), 1);

    a.shutdown().await;
    b.shutdown().await;
}
