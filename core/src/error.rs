use thiserror::Error;

/// Wire-level packet decode/encode failures.
///
/// Decode never panics and never unwinds across the API; every malformed
/// input maps to one of these variants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("bad magic: 0x{0:04X}")]
    BadMagic(u16),
    #[error("unsupported version: 0x{0:02X}")]
    BadVersion(u8),
    #[error("buffer too short: {got} bytes, need {need}")]
    ShortBuffer { got: usize, need: usize },
    #[error("malformed forwarding-context extension")]
    MalformedExtension,
    #[error("flags select more than one packet type: 0x{0:02X}")]
    AmbiguousType(u8),
    #[error("encoded packet exceeds MTU budget: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("unknown node hash: 0x{0:08X}")]
    UnknownNodeHash(u32),
}

/// Forwarding-rule validation and persistence failures.
///
/// The one error family that crosses the API boundary as a structured value,
/// so a CLI/REST surface can translate it into a diagnostic.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("source node {0} is not known")]
    UnknownSourceNode(String),
    #[error("source device {device} does not exist on node {node}")]
    UnknownSourceDevice { node: String, device: u16 },
    #[error("destination node {0} is not known")]
    UnknownDestNode(String),
    #[error("destination device {device} does not exist on node {node}")]
    UnknownDestDevice { node: String, device: u16 },
    #[error("channel filter {0} out of range (0-16)")]
    InvalidChannelFilter(u8),
    #[error("no rule with id {0}")]
    NoSuchRule(String),
    #[error("rule persistence failed: {0}")]
    Persistence(String),
}

/// Transport-level send/receive failures surfaced as values.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not started")]
    NotStarted,
    #[error("encode failed: {0}")]
    Encode(#[from] PacketError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local port is dead")]
    PortDead,
}
