/// Delivery class of a MIDI message.
///
/// RealTime traffic rides the best-effort datagram path; NonRealTime traffic
/// goes through the reliable ACK/NACK path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    RealTime,
    NonRealTime,
}

/// Classifies a raw MIDI message by its status byte.
///
/// Channel voice (0x80..=0xEF) and system real-time (0xF8..=0xFF) messages
/// tolerate loss and want low latency. SysEx and system common messages must
/// arrive intact and in order. Empty or invalid input takes the reliable
/// path, the safe default.
#[inline]
pub fn classify(data: &[u8]) -> MessageClass {
    match data.first() {
        Some(&status) if (0x80..0xF0).contains(&status) => MessageClass::RealTime,
        Some(&status) if status >= 0xF8 => MessageClass::RealTime,
        _ => MessageClass::NonRealTime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_voice_is_real_time() {
        assert_eq!(classify(&[0x90, 0x3C, 0x64]), MessageClass::RealTime);
        assert_eq!(classify(&[0x80, 0x3C, 0x00]), MessageClass::RealTime);
        assert_eq!(classify(&[0xEF, 0x00, 0x40]), MessageClass::RealTime);
    }

    #[test]
    fn system_real_time_is_real_time() {
        for status in 0xF8u8..=0xFF {
            assert_eq!(classify(&[status]), MessageClass::RealTime);
        }
    }

    #[test]
    fn sysex_and_common_are_reliable() {
        assert_eq!(classify(&[0xF0, 0x47, 0xF7]), MessageClass::NonRealTime);
        for status in 0xF1u8..=0xF7 {
            assert_eq!(classify(&[status]), MessageClass::NonRealTime);
        }
    }

    #[test]
    fn total_over_all_inputs() {
        // Every byte string classifies; data bytes and empty input fall back
        // to the reliable path.
        assert_eq!(classify(&[]), MessageClass::NonRealTime);
        for b in 0u8..=0xFF {
            let _ = classify(&[b]);
        }
        assert_eq!(classify(&[0x3C]), MessageClass::NonRealTime);
    }
}
