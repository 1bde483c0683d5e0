// network/src/packet.rs

use bytes::{Buf, BufMut, Bytes, BytesMut};
use midi_fabric_core::{node_hash, DeviceId, NodeId, PacketError, UuidRegistry};

/// Wire magic, "MI" big-endian.
pub const MAGIC: u16 = 0x4D49;
pub const VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 20;

/// Conservative ceiling for an encoded datagram, extensions included.
pub const MTU_BUDGET: usize = 1200;

/// Maximum hops a message may traverse; also the visited-set capacity.
pub const MAX_HOPS: u8 = 8;

const CONTEXT_EXT_TYPE: u8 = 0x01;
const CONTEXT_ENTRY_LEN: usize = 6;
const CONTEXT_EXT_HEADER_LEN: usize = 4;

pub mod flags {
    pub const RELIABLE: u8 = 0x01;
    pub const SYSEX: u8 = 0x02;
    pub const FRAGMENT: u8 = 0x04;
    pub const HAS_CONTEXT: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const NACK: u8 = 0x20;
    pub const HEARTBEAT: u8 = 0x40;
}

/// Signed circular distance from `b` to `a` modulo 2^16.
///
/// Negative means `a` is older than `b`; sequences 65535 and 0 are adjacent.
#[inline]
pub fn seq_delta(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Exactly one of these per packet, derived from the flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Heartbeat,
    Ack,
    Nack,
}

/// Hop count plus the (node, device) pairs a message has already visited.
///
/// The in-memory form carries full NodeIds; on the wire each entry is the
/// 32-bit node hash, resolved back through the [UuidRegistry] on receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingContext {
    pub hop_count: u8,
    pub visited: Vec<(NodeId, DeviceId)>,
}

impl ForwardingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node: NodeId, device: DeviceId) -> bool {
        self.visited.iter().any(|&(n, d)| n == node && d == device)
    }

    /// Records a visit and advances the hop count. Returns false once the
    /// visited set is full, which callers treat as a loop condition.
    pub fn push(&mut self, node: NodeId, device: DeviceId) -> bool {
        if self.visited.len() >= MAX_HOPS as usize {
            return false;
        }
        self.visited.push((node, device));
        self.hop_count = self.hop_count.saturating_add(1);
        true
    }
}

/// Hash-form context as it travels inside a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireContext {
    pub hop_count: u8,
    pub visited: Vec<(u32, DeviceId)>,
}

/// A wire frame: fixed 20-byte header, MIDI payload, optional extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u8,
    pub sequence: u16,
    pub device_id: DeviceId,
    pub timestamp_micros: u32,
    pub source_hash: u32,
    pub dest_hash: u32,
    pub payload: Vec<u8>,
    context: Option<WireContext>,
}

impl Packet {
    /// A data packet carrying one MIDI message. A SysEx payload sets the
    /// SysEx flag and implies reliable delivery.
    pub fn data(device_id: DeviceId, source_hash: u32, dest_hash: u32, payload: Vec<u8>) -> Self {
        let mut flags = 0u8;
        if payload.first() == Some(&0xF0) {
            flags |= flags::SYSEX | flags::RELIABLE;
        }
        Self {
            flags,
            sequence: 0,
            device_id,
            timestamp_micros: 0,
            source_hash,
            dest_hash,
            payload,
            context: None,
        }
    }

    pub fn heartbeat(source_hash: u32, dest_hash: u32) -> Self {
        Self {
            flags: flags::HEARTBEAT,
            sequence: 0,
            device_id: 0,
            timestamp_micros: 0,
            source_hash,
            dest_hash,
            payload: Vec::new(),
            context: None,
        }
    }

    /// An acknowledgement of `sequence`. Acks are not themselves sequenced.
    pub fn ack(sequence: u16, source_hash: u32, dest_hash: u32) -> Self {
        Self {
            flags: flags::ACK,
            sequence,
            device_id: 0,
            timestamp_micros: 0,
            source_hash,
            dest_hash,
            payload: Vec::new(),
            context: None,
        }
    }

    /// A negative acknowledgement naming the first missing sequence.
    pub fn nack(sequence: u16, source_hash: u32, dest_hash: u32) -> Self {
        Self {
            flags: flags::NACK,
            sequence,
            device_id: 0,
            timestamp_micros: 0,
            source_hash,
            dest_hash,
            payload: Vec::new(),
            context: None,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        if self.flags & flags::ACK != 0 {
            PacketType::Ack
        } else if self.flags & flags::NACK != 0 {
            PacketType::Nack
        } else if self.flags & flags::HEARTBEAT != 0 {
            PacketType::Heartbeat
        } else {
            PacketType::Data
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags & flags::RELIABLE != 0
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Attaches a forwarding context, hashing each visited NodeId. The
    /// context must be internally consistent: hop count equal to the visited
    /// count, at most [MAX_HOPS] entries.
    pub fn set_forwarding_context(&mut self, ctx: &ForwardingContext) -> Result<(), PacketError> {
        if ctx.visited.len() > MAX_HOPS as usize || ctx.hop_count as usize != ctx.visited.len() {
            return Err(PacketError::MalformedExtension);
        }
        self.context = Some(WireContext {
            hop_count: ctx.hop_count,
            visited: ctx
                .visited
                .iter()
                .map(|&(node, dev)| (node_hash(node), dev))
                .collect(),
        });
        self.flags |= flags::HAS_CONTEXT;
        Ok(())
    }

    pub fn clear_forwarding_context(&mut self) {
        self.context = None;
        self.flags &= !flags::HAS_CONTEXT;
    }

    /// Resolves the in-packet context back to NodeIds.
    ///
    /// Returns `Ok(None)` when no context is present. An unknown hash means
    /// the sender knows a peer this node has never seen; callers drop the
    /// packet as stale.
    pub fn forwarding_context(
        &self,
        registry: &UuidRegistry,
    ) -> Result<Option<ForwardingContext>, PacketError> {
        let Some(wire) = &self.context else {
            return Ok(None);
        };
        if wire.hop_count as usize != wire.visited.len() {
            return Err(PacketError::MalformedExtension);
        }
        let mut visited = Vec::with_capacity(wire.visited.len());
        for &(hash, dev) in &wire.visited {
            let node = registry
                .lookup(hash)
                .ok_or(PacketError::UnknownNodeHash(hash))?;
            visited.push((node, dev));
        }
        Ok(Some(ForwardingContext {
            hop_count: wire.hop_count,
            visited,
        }))
    }

    /// Encodes header, payload, then extensions in ascending type order.
    /// Deterministic; rejects frames over the MTU budget.
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let ext_len = self
            .context
            .as_ref()
            .map(|c| CONTEXT_EXT_HEADER_LEN + c.visited.len() * CONTEXT_ENTRY_LEN)
            .unwrap_or(0);
        let total = HEADER_LEN + self.payload.len() + ext_len;
        if total > MTU_BUDGET {
            return Err(PacketError::PayloadTooLarge(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.flags);
        buf.put_u16(self.sequence);
        buf.put_u16(self.device_id);
        buf.put_u32(self.timestamp_micros);
        buf.put_u32(self.source_hash);
        buf.put_u32(self.dest_hash);
        buf.put_slice(&self.payload);

        if let Some(ctx) = &self.context {
            buf.put_u8(CONTEXT_EXT_TYPE);
            buf.put_u8((CONTEXT_EXT_HEADER_LEN + ctx.visited.len() * CONTEXT_ENTRY_LEN) as u8);
            buf.put_u8(ctx.hop_count);
            buf.put_u8(ctx.visited.len() as u8);
            for &(hash, dev) in &ctx.visited {
                buf.put_u32(hash);
                buf.put_u16(dev);
            }
        }

        Ok(buf.freeze())
    }

    /// Validates and decodes a wire frame. Never panics; every malformed
    /// input maps to a [PacketError].
    pub fn try_decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::ShortBuffer {
                got: data.len(),
                need: HEADER_LEN,
            });
        }
        let mut reader = Bytes::copy_from_slice(data);
        let magic = reader.get_u16();
        if magic != MAGIC {
            return Err(PacketError::BadMagic(magic));
        }
        let version = reader.get_u8();
        if version != VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let pkt_flags = reader.get_u8();
        let type_bits = pkt_flags & (flags::ACK | flags::NACK | flags::HEARTBEAT);
        if type_bits.count_ones() > 1 {
            return Err(PacketError::AmbiguousType(pkt_flags));
        }
        let sequence = reader.get_u16();
        let device_id = reader.get_u16();
        let timestamp_micros = reader.get_u32();
        let source_hash = reader.get_u32();
        let dest_hash = reader.get_u32();

        let (payload, context) = if pkt_flags & flags::HAS_CONTEXT != 0 {
            let (start, entries) = locate_context_extension(data)?;
            (data[HEADER_LEN..start].to_vec(), Some(entries))
        } else {
            (data[HEADER_LEN..].to_vec(), None)
        };

        Ok(Self {
            flags: pkt_flags,
            sequence,
            device_id,
            timestamp_micros,
            source_hash,
            dest_hash,
            payload,
            context,
        })
    }
}

/// Finds the context extension at the datagram tail.
///
/// Payload length is inferred as "total minus header minus extensions", so
/// the decoder anchors the extension at the end: its size is 4 + 6 x
/// deviceCount with deviceCount <= 8, and the header bytes (type, length,
/// hopCount = deviceCount) pin the one legal size.
fn locate_context_extension(data: &[u8]) -> Result<(usize, WireContext), PacketError> {
    for count in (0..=MAX_HOPS as usize).rev() {
        let ext_len = CONTEXT_EXT_HEADER_LEN + count * CONTEXT_ENTRY_LEN;
        if data.len() < HEADER_LEN + ext_len {
            continue;
        }
        let start = data.len() - ext_len;
        if data[start] != CONTEXT_EXT_TYPE
            || data[start + 1] as usize != ext_len
            || data[start + 2] as usize != count
            || data[start + 3] as usize != count
        {
            continue;
        }
        let mut reader = Bytes::copy_from_slice(&data[start + CONTEXT_EXT_HEADER_LEN..]);
        let mut visited = Vec::with_capacity(count);
        for _ in 0..count {
            let hash = reader.get_u32();
            let dev = reader.get_u16();
            visited.push((hash, dev));
        }
        return Ok((
            start,
            WireContext {
                hop_count: count as u8,
                visited,
            },
        ));
    }
    Err(PacketError::MalformedExtension)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Packet {
        let mut pkt = Packet::data(7, 0xAAAA0001, 0xBBBB0002, vec![0x90, 0x3C, 0x64]);
        pkt.sequence = 41;
        pkt.timestamp_micros = 123_456;
        pkt
    }

    #[test]
    fn data_roundtrip() {
        let pkt = sample_data();
        let decoded = Packet::try_decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.packet_type(), PacketType::Data);
    }

    #[test]
    fn roundtrip_with_context() {
        let registry = UuidRegistry::new();
        let a = NodeId::new_random();
        let b = NodeId::new_random();
        registry.register(a);
        registry.register(b);

        let mut ctx = ForwardingContext::new();
        assert!(ctx.push(a, 1));
        assert!(ctx.push(b, 10));

        let mut pkt = sample_data();
        pkt.set_forwarding_context(&ctx).unwrap();
        let decoded = Packet::try_decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.payload, vec![0x90, 0x3C, 0x64]);

        let resolved = decoded.forwarding_context(&registry).unwrap().unwrap();
        assert_eq!(resolved, ctx);

        pkt.clear_forwarding_context();
        assert!(!pkt.has_context());
        assert_eq!(pkt.flags & flags::HAS_CONTEXT, 0);
        assert_eq!(pkt.forwarding_context(&registry).unwrap(), None);
    }

    #[test]
    fn empty_visited_context_roundtrips() {
        let mut pkt = sample_data();
        pkt.set_forwarding_context(&ForwardingContext::new()).unwrap();
        let decoded = Packet::try_decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn unknown_hash_resolves_to_error() {
        let registry = UuidRegistry::new();
        let stranger = NodeId::new_random();
        let mut ctx = ForwardingContext::new();
        ctx.push(stranger, 3);

        let mut pkt = sample_data();
        pkt.set_forwarding_context(&ctx).unwrap();
        let decoded = Packet::try_decode(&pkt.encode().unwrap()).unwrap();
        assert!(matches!(
            decoded.forwarding_context(&registry),
            Err(PacketError::UnknownNodeHash(_))
        ));
    }

    #[test]
    fn sysex_payload_implies_reliable() {
        let pkt = Packet::data(1, 1, 2, vec![0xF0, 0x47, 0xF7]);
        assert!(pkt.is_reliable());
        assert!(pkt.flags & flags::SYSEX != 0);
    }

    #[test]
    fn ack_nack_heartbeat_types() {
        assert_eq!(Packet::ack(5, 1, 2).packet_type(), PacketType::Ack);
        assert_eq!(Packet::nack(5, 1, 2).packet_type(), PacketType::Nack);
        assert_eq!(Packet::heartbeat(1, 2).packet_type(), PacketType::Heartbeat);
    }

    #[test]
    fn rejects_bad_magic_version_and_short_frames() {
        let good = sample_data().encode().unwrap();

        let mut bad_magic = good.to_vec();
        bad_magic[0] = 0x00;
        assert_eq!(
            Packet::try_decode(&bad_magic),
            Err(PacketError::BadMagic(0x0049))
        );

        let mut bad_version = good.to_vec();
        bad_version[2] = 0x7F;
        assert_eq!(
            Packet::try_decode(&bad_version),
            Err(PacketError::BadVersion(0x7F))
        );

        assert!(matches!(
            Packet::try_decode(&good[..10]),
            Err(PacketError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn rejects_ambiguous_type_flags() {
        let mut pkt = Packet::ack(1, 1, 2);
        pkt.flags |= flags::NACK;
        let encoded = pkt.encode().unwrap();
        assert!(matches!(
            Packet::try_decode(&encoded),
            Err(PacketError::AmbiguousType(_))
        ));
    }

    #[test]
    fn rejects_truncated_extension() {
        let mut ctx = ForwardingContext::new();
        ctx.push(NodeId::new_random(), 1);
        let mut pkt = sample_data();
        pkt.set_forwarding_context(&ctx).unwrap();
        let encoded = pkt.encode().unwrap();
        // Chop the last visited entry; the flag still claims a context.
        let truncated = &encoded[..encoded.len() - CONTEXT_ENTRY_LEN];
        assert_eq!(
            Packet::try_decode(truncated),
            Err(PacketError::MalformedExtension)
        );
    }

    #[test]
    fn context_over_capacity_is_rejected() {
        let mut ctx = ForwardingContext::new();
        for dev in 0..MAX_HOPS as u16 {
            assert!(ctx.push(NodeId::new_random(), dev));
        }
        assert!(!ctx.push(NodeId::new_random(), 99));

        // A hand-built oversized context cannot be attached either.
        let oversized = ForwardingContext {
            hop_count: 9,
            visited: (0..9).map(|d| (NodeId::new_random(), d)).collect(),
        };
        let mut pkt = sample_data();
        assert_eq!(
            pkt.set_forwarding_context(&oversized),
            Err(PacketError::MalformedExtension)
        );
    }

    #[test]
    fn oversized_frame_is_refused() {
        let pkt = Packet::data(1, 1, 2, vec![0x42; MTU_BUDGET]);
        assert!(matches!(
            pkt.encode(),
            Err(PacketError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn seq_delta_is_modular() {
        assert_eq!(seq_delta(5, 3), 2);
        assert_eq!(seq_delta(3, 5), -2);
        assert_eq!(seq_delta(0, 65535), 1);
        assert_eq!(seq_delta(65535, 0), -1);
        assert_eq!(seq_delta(1, 65534), 3);
    }
}
