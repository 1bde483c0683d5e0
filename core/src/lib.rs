pub mod classifier;
pub mod error;
pub mod event_bus;
pub mod identity;
pub mod uuid_registry;

pub use classifier::{classify, MessageClass};
pub use error::{PacketError, RuleError, TransportError};
pub use identity::NodeIdentity;
pub use uuid_registry::{node_hash, UuidRegistry};

use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable 128-bit identifier of a fabric node.
///
/// The all-zero value stands for "this node" in in-memory rules; on the wire
/// every node-id slot is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Reserved value meaning "this node" in rules and routes.
    pub const LOCAL: NodeId = NodeId(Uuid::nil());

    pub fn new_random() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "local")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Per-node 16-bit device handle.
pub type DeviceId = u16;

/// The ten MIDI message families the fabric filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MidiMessageKind {
    NoteOff,
    NoteOn,
    PolyAftertouch,
    ControlChange,
    ProgramChange,
    ChannelAftertouch,
    PitchBend,
    SystemCommon,
    SystemRealTime,
    SysEx,
}

impl MidiMessageKind {
    /// Derives the message family from a status byte.
    pub fn from_status(status: u8) -> Option<Self> {
        match status & 0xF0 {
            0x80 => Some(MidiMessageKind::NoteOff),
            0x90 => Some(MidiMessageKind::NoteOn),
            0xA0 => Some(MidiMessageKind::PolyAftertouch),
            0xB0 => Some(MidiMessageKind::ControlChange),
            0xC0 => Some(MidiMessageKind::ProgramChange),
            0xD0 => Some(MidiMessageKind::ChannelAftertouch),
            0xE0 => Some(MidiMessageKind::PitchBend),
            0xF0 => match status {
                0xF0 => Some(MidiMessageKind::SysEx),
                0xF1..=0xF7 => Some(MidiMessageKind::SystemCommon),
                _ => Some(MidiMessageKind::SystemRealTime),
            },
            _ => None,
        }
    }

    fn bit(self) -> u16 {
        match self {
            MidiMessageKind::NoteOff => 1 << 0,
            MidiMessageKind::NoteOn => 1 << 1,
            MidiMessageKind::PolyAftertouch => 1 << 2,
            MidiMessageKind::ControlChange => 1 << 3,
            MidiMessageKind::ProgramChange => 1 << 4,
            MidiMessageKind::ChannelAftertouch => 1 << 5,
            MidiMessageKind::PitchBend => 1 << 6,
            MidiMessageKind::SystemCommon => 1 << 7,
            MidiMessageKind::SystemRealTime => 1 << 8,
            MidiMessageKind::SysEx => 1 << 9,
        }
    }
}

/// Bitset over [MidiMessageKind], used by forwarding-rule filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTypeMask(pub u16);

impl MessageTypeMask {
    pub const ALL: MessageTypeMask = MessageTypeMask(0x03FF);
    pub const NONE: MessageTypeMask = MessageTypeMask(0);

    pub fn only(kinds: &[MidiMessageKind]) -> Self {
        let mut mask = 0u16;
        for kind in kinds {
            mask |= kind.bit();
        }
        MessageTypeMask(mask)
    }

    pub fn contains(&self, kind: MidiMessageKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn with(mut self, kind: MidiMessageKind) -> Self {
        self.0 |= kind.bit();
        self
    }

    pub fn without(mut self, kind: MidiMessageKind) -> Self {
        self.0 &= !kind.bit();
        self
    }
}

impl Default for MessageTypeMask {
    fn default() -> Self {
        MessageTypeMask::ALL
    }
}

/// 1-based MIDI channel of a status byte, `None` for system messages.
pub fn midi_channel(status: u8) -> Option<u8> {
    if (0x80..0xF0).contains(&status) {
        Some((status & 0x0F) + 1)
    } else {
        None
    }
}

/// Byte length of a MIDI message, derived from its status byte.
///
/// SysEx (0xF0) reports 1; callers consume up to the trailing 0xF7.
pub fn midi_command_length(status: u8) -> Result<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Ok(3),
        0xC0 | 0xD0 => Ok(2),
        0xF0 => match status {
            0xF0 => Ok(1),
            0xF1 | 0xF3 => Ok(2),
            0xF2 => Ok(3),
            0xF6 | 0xF7 => Ok(1),
            0xF8 | 0xFA | 0xFB | 0xFC | 0xFE | 0xFF => Ok(1),
            _ => Err(anyhow!("Unknown system message: 0x{:02X}", status)),
        },
        _ => Err(anyhow!("Unknown MIDI status byte: 0x{:02X}", status)),
    }
}

/// A decoded MIDI message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MidiCommand {
    NoteOff { channel: u8, key: u8, velocity: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    PolyAftertouch { channel: u8, key: u8, value: u8 },
    ControlChange { channel: u8, control: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelAftertouch { channel: u8, value: u8 },
    PitchBend { channel: u8, value: u16 },
    SystemCommon { status: u8, data: Vec<u8> },
    SystemRealTime { status: u8 },
    SysEx(Vec<u8>),
}

impl MidiCommand {
    pub fn kind(&self) -> MidiMessageKind {
        match self {
            MidiCommand::NoteOff { .. } => MidiMessageKind::NoteOff,
            MidiCommand::NoteOn { .. } => MidiMessageKind::NoteOn,
            MidiCommand::PolyAftertouch { .. } => MidiMessageKind::PolyAftertouch,
            MidiCommand::ControlChange { .. } => MidiMessageKind::ControlChange,
            MidiCommand::ProgramChange { .. } => MidiMessageKind::ProgramChange,
            MidiCommand::ChannelAftertouch { .. } => MidiMessageKind::ChannelAftertouch,
            MidiCommand::PitchBend { .. } => MidiMessageKind::PitchBend,
            MidiCommand::SystemCommon { .. } => MidiMessageKind::SystemCommon,
            MidiCommand::SystemRealTime { .. } => MidiMessageKind::SystemRealTime,
            MidiCommand::SysEx(_) => MidiMessageKind::SysEx,
        }
    }
}

/// Parses the first MIDI message in `data`, returning it and its byte length.
pub fn parse_midi_message(data: &[u8]) -> Result<(MidiCommand, usize)> {
    if data.is_empty() {
        return Err(anyhow!("Empty MIDI data"));
    }
    let status = data[0];
    if status < 0x80 {
        return Err(anyhow!("Running status not supported"));
    }

    if status == 0xF0 {
        // SysEx runs to the trailing 0xF7.
        let end = data
            .iter()
            .position(|&b| b == 0xF7)
            .ok_or_else(|| anyhow!("Unterminated SysEx message"))?;
        return Ok((MidiCommand::SysEx(data[..=end].to_vec()), end + 1));
    }

    let len = midi_command_length(status)?;
    if data.len() < len {
        return Err(anyhow!(
            "Incomplete MIDI message: expected {} bytes, got {}",
            len,
            data.len()
        ));
    }

    let mut reader = Bytes::copy_from_slice(&data[..len]);
    let status = reader.get_u8();
    let channel = status & 0x0F;
    let command = match status & 0xF0 {
        0x80 => MidiCommand::NoteOff {
            channel,
            key: reader.get_u8(),
            velocity: reader.get_u8(),
        },
        0x90 => MidiCommand::NoteOn {
            channel,
            key: reader.get_u8(),
            velocity: reader.get_u8(),
        },
        0xA0 => MidiCommand::PolyAftertouch {
            channel,
            key: reader.get_u8(),
            value: reader.get_u8(),
        },
        0xB0 => MidiCommand::ControlChange {
            channel,
            control: reader.get_u8(),
            value: reader.get_u8(),
        },
        0xC0 => MidiCommand::ProgramChange {
            channel,
            program: reader.get_u8(),
        },
        0xD0 => MidiCommand::ChannelAftertouch {
            channel,
            value: reader.get_u8(),
        },
        0xE0 => {
            let lsb = reader.get_u8();
            let msb = reader.get_u8();
            MidiCommand::PitchBend {
                channel,
                value: ((msb as u16) << 7) | (lsb as u16),
            }
        }
        0xF0 => {
            if status >= 0xF8 {
                MidiCommand::SystemRealTime { status }
            } else {
                MidiCommand::SystemCommon {
                    status,
                    data: reader.copy_to_bytes(reader.remaining()).to_vec(),
                }
            }
        }
        _ => unreachable!("status validated above"),
    };
    Ok((command, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_note_on() {
        let (cmd, len) = parse_midi_message(&[0x91, 0x3C, 0x64]).unwrap();
        assert_eq!(len, 3);
        assert_eq!(
            cmd,
            MidiCommand::NoteOn {
                channel: 1,
                key: 0x3C,
                velocity: 0x64
            }
        );
        assert_eq!(cmd.kind(), MidiMessageKind::NoteOn);
    }

    #[test]
    fn parses_pitch_bend_14bit() {
        let (cmd, _) = parse_midi_message(&[0xE0, 0x01, 0x40]).unwrap();
        assert_eq!(
            cmd,
            MidiCommand::PitchBend {
                channel: 0,
                value: (0x40 << 7) | 0x01
            }
        );
    }

    #[test]
    fn parses_sysex_to_terminator() {
        let (cmd, len) = parse_midi_message(&[0xF0, 0x47, 0x01, 0xF7, 0x90]).unwrap();
        assert_eq!(len, 4);
        assert_eq!(cmd, MidiCommand::SysEx(vec![0xF0, 0x47, 0x01, 0xF7]));
    }

    #[test]
    fn rejects_running_status_and_empty() {
        assert!(parse_midi_message(&[]).is_err());
        assert!(parse_midi_message(&[0x3C, 0x64]).is_err());
        assert!(parse_midi_message(&[0xF0, 0x47]).is_err());
    }

    #[test]
    fn channel_is_one_based() {
        assert_eq!(midi_channel(0x90), Some(1));
        assert_eq!(midi_channel(0x9F), Some(16));
        assert_eq!(midi_channel(0xF8), None);
    }

    #[test]
    fn mask_default_accepts_everything() {
        let mask = MessageTypeMask::default();
        assert!(mask.contains(MidiMessageKind::NoteOn));
        assert!(mask.contains(MidiMessageKind::SysEx));
        let only_cc = MessageTypeMask::only(&[MidiMessageKind::ControlChange]);
        assert!(only_cc.contains(MidiMessageKind::ControlChange));
        assert!(!only_cc.contains(MidiMessageKind::NoteOn));
    }
}
