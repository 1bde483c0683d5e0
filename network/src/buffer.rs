// network/src/buffer.rs

use crate::packet::{seq_delta, Packet};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Tuning for one receive-side flow.
#[derive(Debug, Clone)]
pub struct MessageBufferConfig {
    pub max_buffer_size: usize,
    pub max_sequence_gap: u16,
    pub allow_duplicates: bool,
    pub delivery_timeout: Duration,
}

impl Default for MessageBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 64,
            max_sequence_gap: 32,
            allow_duplicates: false,
            delivery_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageBufferStats {
    pub packets_received: u64,
    pub packets_delivered: u64,
    pub packets_reordered: u64,
    pub packets_dropped: u64,
    pub duplicates: u64,
    pub gaps_detected: u64,
    pub current_buffer_size: usize,
    pub max_buffer_size_reached: usize,
}

type ReadyCallback = Box<dyn FnMut(Packet) + Send>;
type SeqCallback = Box<dyn FnMut(u16) + Send>;

/// How many delivered sequences are remembered for duplicate detection.
const DELIVERED_HISTORY_LIMIT: usize = 4096;

struct Buffered {
    packet: Packet,
    arrived: Instant,
}

/// Per-flow reorder/dedup buffer restoring in-order exactly-once delivery.
///
/// Sequence comparison is circular modulo 2^16, so 65535 and 0 are adjacent
/// and a sender may wrap freely. `next_expected` only ever moves forward in
/// the modular sense, by delivery or by skip; a delivered sequence is never
/// re-delivered unless duplicates are explicitly allowed.
pub struct MessageBuffer {
    config: MessageBufferConfig,
    next_expected: Option<u16>,
    buffered: HashMap<u16, Buffered>,
    observed_missing: HashSet<u16>,
    delivered_history: HashSet<u16>,
    stats: MessageBufferStats,
    on_packet_ready: Option<ReadyCallback>,
    on_gap_detected: Option<SeqCallback>,
    on_duplicate_detected: Option<SeqCallback>,
}

impl MessageBuffer {
    /// A buffer that latches `next_expected` from the first packet it sees.
    pub fn new(config: MessageBufferConfig) -> Self {
        Self {
            config,
            next_expected: None,
            buffered: HashMap::new(),
            observed_missing: HashSet::new(),
            delivered_history: HashSet::new(),
            stats: MessageBufferStats::default(),
            on_packet_ready: None,
            on_gap_detected: None,
            on_duplicate_detected: None,
        }
    }

    /// A buffer expecting a known first sequence.
    pub fn with_next_expected(config: MessageBufferConfig, next: u16) -> Self {
        let mut buffer = Self::new(config);
        buffer.next_expected = Some(next);
        buffer
    }

    pub fn set_on_packet_ready(&mut self, cb: impl FnMut(Packet) + Send + 'static) {
        self.on_packet_ready = Some(Box::new(cb));
    }

    pub fn set_on_gap_detected(&mut self, cb: impl FnMut(u16) + Send + 'static) {
        self.on_gap_detected = Some(Box::new(cb));
    }

    pub fn set_on_duplicate_detected(&mut self, cb: impl FnMut(u16) + Send + 'static) {
        self.on_duplicate_detected = Some(Box::new(cb));
    }

    pub fn next_expected(&self) -> Option<u16> {
        self.next_expected
    }

    pub fn stats(&self) -> MessageBufferStats {
        let mut stats = self.stats.clone();
        stats.current_buffer_size = self.buffered.len();
        stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats = MessageBufferStats::default();
        self.stats.current_buffer_size = self.buffered.len();
    }

    /// Feeds one arrived packet through the reorder machinery.
    pub fn add_packet(&mut self, packet: Packet) {
        self.stats.packets_received += 1;
        let seq = packet.sequence;
        let next = *self.next_expected.get_or_insert(seq);

        if seq == next {
            self.deliver(packet);
            self.next_expected = Some(next.wrapping_add(1));
            self.drain_contiguous();
            return;
        }

        let delta = seq_delta(seq, next);
        if delta < 0 {
            // Older than expected; never re-delivered, even with duplicates
            // allowed.
            self.stats.packets_dropped += 1;
            if self.delivered_history.contains(&seq) {
                self.stats.duplicates += 1;
                if let Some(cb) = self.on_duplicate_detected.as_mut() {
                    cb(seq);
                }
            }
            return;
        }

        if self.buffered.contains_key(&seq) {
            self.stats.duplicates += 1;
            if let Some(cb) = self.on_duplicate_detected.as_mut() {
                cb(seq);
            }
            if self.config.allow_duplicates {
                // Not older than next_expected, so a second copy goes out.
                self.stats.packets_delivered += 1;
                if let Some(cb) = self.on_packet_ready.as_mut() {
                    cb(packet);
                }
            }
            return;
        }

        let gap = delta as u16;
        if gap > self.config.max_sequence_gap {
            debug!("sequence jump of {gap} from {next}; resyncing at {seq}");
            let mut s = next;
            while s != seq {
                if self.buffered.remove(&s).is_some() {
                    self.stats.packets_dropped += 1;
                } else {
                    self.observed_missing.remove(&s);
                    self.emit_gap(s);
                }
                s = s.wrapping_add(1);
            }
            self.next_expected = Some(seq);
            self.deliver(packet);
            self.next_expected = Some(seq.wrapping_add(1));
            self.drain_contiguous();
            return;
        }

        self.buffered.insert(
            seq,
            Buffered {
                packet,
                arrived: Instant::now(),
            },
        );
        if self.buffered.len() > self.config.max_buffer_size {
            let oldest = self
                .buffered
                .keys()
                .copied()
                .min_by_key(|&k| seq_delta(k, next))
                .expect("buffer is non-empty");
            self.buffered.remove(&oldest);
            self.stats.packets_dropped += 1;
        }
        self.note_buffer_size();

        let mut s = next;
        while s != seq {
            if !self.buffered.contains_key(&s) && self.observed_missing.insert(s) {
                self.emit_gap(s);
            }
            s = s.wrapping_add(1);
        }
    }

    /// Declares gaps lost once buffered packets have waited out the delivery
    /// timeout, skipping `next_expected` forward to the lowest buffered key.
    /// The owner calls this every `delivery_timeout / 2`.
    pub fn check_timeouts(&mut self, now: Instant) {
        loop {
            if self.buffered.is_empty() {
                return;
            }
            let expired = self
                .buffered
                .values()
                .any(|b| now.duration_since(b.arrived) >= self.config.delivery_timeout);
            if !expired {
                return;
            }
            let next = self.next_expected.expect("buffered implies latched");
            let lowest = self
                .buffered
                .keys()
                .copied()
                .min_by_key(|&k| seq_delta(k, next))
                .expect("buffer is non-empty");
            let mut s = next;
            while s != lowest {
                self.observed_missing.remove(&s);
                self.emit_gap(s);
                s = s.wrapping_add(1);
            }
            self.next_expected = Some(lowest);
            self.drain_contiguous();
        }
    }

    fn drain_contiguous(&mut self) {
        let mut next = self.next_expected.expect("drain requires a latched flow");
        while let Some(buffered) = self.buffered.remove(&next) {
            self.stats.packets_reordered += 1;
            self.deliver(buffered.packet);
            next = next.wrapping_add(1);
        }
        self.next_expected = Some(next);
        self.observed_missing.retain(|&s| seq_delta(s, next) >= 0);
        self.note_buffer_size();
    }

    fn deliver(&mut self, packet: Packet) {
        self.stats.packets_delivered += 1;
        self.delivered_history.insert(packet.sequence);
        if self.delivered_history.len() > DELIVERED_HISTORY_LIMIT {
            let next = self.next_expected.unwrap_or(packet.sequence);
            self.delivered_history
                .retain(|&s| seq_delta(s, next) > -(DELIVERED_HISTORY_LIMIT as i16));
        }
        if let Some(cb) = self.on_packet_ready.as_mut() {
            cb(packet);
        }
    }

    fn emit_gap(&mut self, seq: u16) {
        self.stats.gaps_detected += 1;
        if let Some(cb) = self.on_gap_detected.as_mut() {
            cb(seq);
        }
    }

    fn note_buffer_size(&mut self) {
        self.stats.current_buffer_size = self.buffered.len();
        if self.buffered.len() > self.stats.max_buffer_size_reached {
            self.stats.max_buffer_size_reached = self.buffered.len();
        }
    }
}
