// network/src/fragment.rs

use log::warn;

/// Largest MIDI payload carried in one frame; leaves headroom for the
/// header and a full forwarding-context extension under the MTU budget.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1024;

/// Upper bound on a reassembled message. Bulk dumps beyond this are
/// something the fabric refuses to buffer.
pub const MAX_REASSEMBLED_LEN: usize = 64 * 1024;

/// Splits a payload into fragment-sized chunks. A payload that already fits
/// comes back as a single chunk.
pub fn split_payload(bytes: &[u8]) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return vec![bytes];
    }
    bytes.chunks(MAX_FRAGMENT_PAYLOAD).collect()
}

/// Receive-side fragment accumulator for one flow.
///
/// Fragments arrive in order (the reorder buffer runs first); each fragment
/// frame is appended until the final frame, which completes the message. A
/// gap declared lost mid-message poisons the partial state, so the owner
/// calls `reset` when the flow skips sequences.
#[derive(Default)]
pub struct Reassembler {
    partial: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one ordered frame. Returns the complete message when this
    /// frame finishes one, `None` while more fragments are outstanding.
    pub fn push(&mut self, payload: &[u8], is_fragment: bool) -> Option<Vec<u8>> {
        if self.partial.len() + payload.len() > MAX_REASSEMBLED_LEN {
            warn!(
                "reassembled message exceeds {} bytes; discarding partial",
                MAX_REASSEMBLED_LEN
            );
            self.partial.clear();
            return None;
        }

        if is_fragment {
            self.partial.extend_from_slice(payload);
            return None;
        }

        if self.partial.is_empty() {
            return Some(payload.to_vec());
        }
        let mut complete = std::mem::take(&mut self.partial);
        complete.extend_from_slice(payload);
        Some(complete)
    }

    /// Drops any partial message; used when the flow skipped sequences.
    pub fn reset(&mut self) {
        if !self.partial.is_empty() {
            warn!("dropping {} bytes of partial message", self.partial.len());
            self.partial.clear();
        }
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_stay_whole() {
        let bytes = vec![0xF0, 0x47, 0xF7];
        assert_eq!(split_payload(&bytes), vec![&bytes[..]]);
    }

    #[test]
    fn split_then_reassemble_restores_the_message() {
        let mut bytes = vec![0xF0];
        bytes.extend(std::iter::repeat(0x42u8).take(3000));
        bytes.push(0xF7);

        let chunks = split_payload(&bytes);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[..2].iter().all(|c| c.len() == MAX_FRAGMENT_PAYLOAD));

        let mut reassembler = Reassembler::new();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let result = reassembler.push(chunk, i != last);
            if i != last {
                assert!(result.is_none());
                assert!(reassembler.has_partial());
            } else {
                assert_eq!(result.unwrap(), bytes);
            }
        }
        assert!(!reassembler.has_partial());
    }

    #[test]
    fn unfragmented_frames_pass_straight_through() {
        let mut reassembler = Reassembler::new();
        assert_eq!(
            reassembler.push(&[0xF1, 0x00], false),
            Some(vec![0xF1, 0x00])
        );
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&[1, 2, 3], true).is_none());
        reassembler.reset();
        assert!(!reassembler.has_partial());
        assert_eq!(reassembler.push(&[9], false), Some(vec![9]));
    }

    #[test]
    fn oversized_messages_are_discarded() {
        let mut reassembler = Reassembler::new();
        let chunk = vec![0u8; MAX_FRAGMENT_PAYLOAD];
        for _ in 0..(MAX_REASSEMBLED_LEN / MAX_FRAGMENT_PAYLOAD) {
            let _ = reassembler.push(&chunk, true);
        }
        // The next fragment tips it over; everything is dropped.
        assert!(reassembler.push(&chunk, true).is_none());
        assert!(!reassembler.has_partial());
    }
}
