// network/src/transport.rs

use crate::packet::{Packet, PacketType};
use log::{debug, warn};
use midi_fabric_core::TransportError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

type PacketCallback = Arc<dyn Fn(Packet, SocketAddr) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

const RECV_BUFFER_LEN: usize = 2048;

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
    invalid_packets: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub invalid_packets: u64,
}

/// Best-effort datagram transport for fabric packets.
///
/// Each send stamps a per-destination sequence (Data and Heartbeat only) and
/// a session-monotonic timestamp before encoding. Invalid ingress frames are
/// counted and dropped; they never reach the packet callback. The receive
/// callback runs on a dedicated task and must not block senders.
pub struct DatagramTransport {
    inner: Arc<Inner>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    sequences: Mutex<HashMap<u32, u16>>,
    on_packet: RwLock<Option<PacketCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    counters: Counters,
    epoch: Instant,
}

impl Default for DatagramTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                socket: RwLock::new(None),
                sequences: Mutex::new(HashMap::new()),
                on_packet: RwLock::new(None),
                on_error: RwLock::new(None),
                counters: Counters::default(),
                epoch: Instant::now(),
            }),
            recv_task: Mutex::new(None),
        }
    }

    /// Binds the socket (port 0 picks an ephemeral one) and spawns the
    /// receive task. Starting twice is a logged no-op.
    pub async fn start(&self, port: u16) -> Result<(), TransportError> {
        if self.inner.socket.read().expect("socket lock").is_some() {
            warn!("datagram transport already started");
            return Ok(());
        }
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        debug!("datagram transport bound to {}", socket.local_addr()?);
        *self.inner.socket.write().expect("socket lock") = Some(Arc::clone(&socket));

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            inner.receive_loop(socket).await;
        });
        *self.recv_task.lock().expect("recv task lock") = Some(handle);
        Ok(())
    }

    /// Tears the socket down and unblocks the receive task. Idempotent.
    pub async fn stop(&self) {
        let handle = self.recv_task.lock().expect("recv task lock").take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        *self.inner.socket.write().expect("socket lock") = None;
    }

    pub fn local_port(&self) -> Option<u16> {
        self.inner
            .socket
            .read()
            .expect("socket lock")
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Installs the ingress callback. Replaces any previous handler.
    pub fn set_packet_handler(&self, cb: impl Fn(Packet, SocketAddr) + Send + Sync + 'static) {
        *self.inner.on_packet.write().expect("handler lock") = Some(Arc::new(cb));
    }

    pub fn set_error_handler(&self, cb: impl Fn(String) + Send + Sync + 'static) {
        *self.inner.on_error.write().expect("handler lock") = Some(Arc::new(cb));
    }

    /// Stamps sequence and timestamp, encodes, and emits the datagram.
    pub async fn send(&self, packet: &mut Packet, addr: SocketAddr) -> Result<(), TransportError> {
        let socket = {
            let guard = self.inner.socket.read().expect("socket lock");
            guard.as_ref().cloned().ok_or(TransportError::NotStarted)?
        };

        if matches!(
            packet.packet_type(),
            PacketType::Data | PacketType::Heartbeat
        ) {
            let mut sequences = self.inner.sequences.lock().expect("sequence lock");
            let seq = sequences
                .entry(packet.dest_hash)
                .or_insert_with(rand::random::<u16>);
            packet.sequence = *seq;
            *seq = seq.wrapping_add(1);
        }
        packet.timestamp_micros = self.inner.epoch.elapsed().as_micros() as u32;

        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::Encode(e));
            }
        };

        match socket.send_to(&frame, addr).await {
            Ok(sent) => {
                self.inner.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.inner.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                self.inner.report_error(format!("send to {addr} failed: {e}"));
                Err(TransportError::Io(e))
            }
        }
    }

    /// Retransmits an already-stamped packet without advancing sequences.
    pub async fn resend(&self, packet: &Packet, addr: SocketAddr) -> Result<(), TransportError> {
        let socket = {
            let guard = self.inner.socket.read().expect("socket lock");
            guard.as_ref().cloned().ok_or(TransportError::NotStarted)?
        };
        let frame = packet.encode().map_err(TransportError::Encode)?;
        match socket.send_to(&frame, addr).await {
            Ok(sent) => {
                self.inner.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.inner.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    pub fn statistics(&self) -> TransportStats {
        let c = &self.inner.counters;
        TransportStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            receive_errors: c.receive_errors.load(Ordering::Relaxed),
            invalid_packets: c.invalid_packets.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        let c = &self.inner.counters;
        c.packets_sent.store(0, Ordering::Relaxed);
        c.packets_received.store(0, Ordering::Relaxed);
        c.bytes_sent.store(0, Ordering::Relaxed);
        c.bytes_received.store(0, Ordering::Relaxed);
        c.send_errors.store(0, Ordering::Relaxed);
        c.receive_errors.store(0, Ordering::Relaxed);
        c.invalid_packets.store(0, Ordering::Relaxed);
    }
}

impl Inner {
    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    self.counters
                        .bytes_received
                        .fetch_add(len as u64, Ordering::Relaxed);
                    match Packet::try_decode(&buf[..len]) {
                        Ok(packet) => {
                            self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                            let handler = self
                                .on_packet
                                .read()
                                .expect("handler lock")
                                .as_ref()
                                .cloned();
                            if let Some(handler) = handler {
                                handler(packet, src);
                            }
                        }
                        Err(e) => {
                            self.counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                            debug!("dropping invalid frame from {src}: {e}");
                        }
                    }
                }
                Err(e) => {
                    self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                    self.report_error(format!("receive failed: {e}"));
                }
            }
        }
    }

    fn report_error(&self, message: String) {
        let handler = self.on_error.read().expect("handler lock").as_ref().cloned();
        if let Some(handler) = handler {
            handler(message);
        }
    }
}
