//! Sender-side window machinery.
//!
//! [`SendWindow`] owns the retransmit buffer and the sequence arithmetic of
//! the sending half of a connection: `snd_una`, `snd_nxt`, per-segment
//! retry counters, duplicate-ACK counting, and the latched peer window.
//! It is sans-IO; the client engine decides when to transmit, retransmit,
//! and time out.
//!
//! Sequence numbers count payload bytes and wrap at 2^32, so the buffer is
//! kept in send order (a deque) rather than keyed by sequence; the oldest
//! unacknowledged segment is always at the front, which is also the only
//! segment the single retransmission timer covers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::transport::segment::{seq_le, seq_lt};

/// One transmitted-but-unacknowledged segment.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Sequence number of the first payload byte.
    pub seq: u32,
    /// Plaintext payload; sealed again on every (re)transmission.
    pub payload: Bytes,
    /// Last transmission time, used for the timer and RTT sampling.
    pub sent_at: Instant,
    /// Times this segment has been retransmitted.
    pub retries: u32,
    /// Set once retransmitted; disqualifies the RTT sample (Karn).
    pub retransmitted: bool,
}

impl InFlight {
    /// Sequence number one past this segment's last byte.
    pub fn seq_end(&self) -> u32 {
        self.seq.wrapping_add(self.payload.len() as u32)
    }
}

/// Outcome of processing one inbound acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// The left edge advanced; segments were freed.
    Advanced {
        /// Segments removed from the retransmit buffer.
        freed: u32,
        /// Round-trip sample, when a freed segment was never retransmitted.
        rtt_sample: Option<Duration>,
    },
    /// Same left edge again while data is outstanding.
    Duplicate {
        /// Consecutive duplicate count, after this one.
        count: u32,
    },
    /// Below the left edge, or nothing outstanding: no effect.
    Stale,
}

/// The sending half of one connection.
#[derive(Debug)]
pub struct SendWindow {
    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// Next sequence number to assign.
    snd_nxt: u32,
    /// Transmitted, unacknowledged segments in send order.
    in_flight: VecDeque<InFlight>,
    /// Segmented payloads not yet transmitted.
    pending: VecDeque<Bytes>,
    /// Consecutive duplicate ACKs for `snd_una`.
    dup_ack_count: u32,
    /// Most recently advertised peer window, in segments.
    peer_rwnd: u16,
    /// Segment size used by `enqueue`.
    payload_size: usize,
}

impl SendWindow {
    /// Create a window whose first data byte will carry `initial_seq`.
    pub fn new(initial_seq: u32, initial_peer_rwnd: u16, payload_size: usize) -> Self {
        Self {
            snd_una: initial_seq,
            snd_nxt: initial_seq,
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
            dup_ack_count: 0,
            peer_rwnd: initial_peer_rwnd,
            payload_size,
        }
    }

    /// Oldest unacknowledged sequence number.
    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    /// Next sequence number to assign.
    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    /// Latched peer window, in segments.
    pub fn peer_rwnd(&self) -> u16 {
        self.peer_rwnd
    }

    /// Latch the peer window from an inbound segment.
    pub fn set_peer_rwnd(&mut self, rwnd: u16) {
        self.peer_rwnd = rwnd;
    }

    /// Segments transmitted but not yet acknowledged.
    pub fn outstanding(&self) -> u32 {
        self.in_flight.len() as u32
    }

    /// Whether segmented payloads await their first transmission.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Everything enqueued has been transmitted and acknowledged.
    pub fn is_fully_acked(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty()
    }

    /// Oldest unacknowledged segment; the retransmission timer covers it.
    pub fn oldest(&self) -> Option<&InFlight> {
        self.in_flight.front()
    }

    /// Split a byte stream into payload-sized chunks awaiting transmission.
    pub fn enqueue(&mut self, data: &[u8]) {
        for chunk in data.chunks(self.payload_size) {
            self.pending.push_back(Bytes::copy_from_slice(chunk));
        }
    }

    /// Move pending segments into flight, up to `window` segments
    /// outstanding. Returns the segments to transmit now.
    pub fn next_burst(&mut self, window: u32, now: Instant) -> Vec<(u32, Bytes)> {
        let mut burst = Vec::new();

        while self.outstanding() < window {
            let Some(payload) = self.pending.pop_front() else {
                break;
            };
            let seq = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(payload.len() as u32);

            self.in_flight.push_back(InFlight {
                seq,
                payload: payload.clone(),
                sent_at: now,
                retries: 0,
                retransmitted: false,
            });
            burst.push((seq, payload));
        }

        burst
    }

    /// Process one cumulative acknowledgment.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> AckEvent {
        if seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt) {
            let mut freed = 0u32;
            let mut rtt_sample = None;

            while let Some(front) = self.in_flight.front() {
                if !seq_le(front.seq_end(), ack) {
                    break;
                }
                let acked = self.in_flight.pop_front().expect("front exists");
                if !acked.retransmitted {
                    rtt_sample = Some(now.duration_since(acked.sent_at));
                }
                freed += 1;
            }

            self.snd_una = ack;
            self.dup_ack_count = 0;
            return AckEvent::Advanced { freed, rtt_sample };
        }

        if ack == self.snd_una && !self.in_flight.is_empty() {
            self.dup_ack_count += 1;
            return AckEvent::Duplicate {
                count: self.dup_ack_count,
            };
        }

        AckEvent::Stale
    }

    /// Retransmit the oldest unacknowledged segment: bump its retry count,
    /// mark it ineligible for RTT sampling, restamp its clock. Returns the
    /// segment to put back on the wire and its retry count so far.
    pub fn retransmit_oldest(&mut self, now: Instant) -> Option<(u32, Bytes, u32)> {
        let front = self.in_flight.front_mut()?;
        front.retries += 1;
        front.retransmitted = true;
        front.sent_at = now;
        Some((front.seq, front.payload.clone(), front.retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(initial_seq: u32, data_len: usize) -> SendWindow {
        let mut w = SendWindow::new(initial_seq, 64, 4);
        w.enqueue(&vec![0xaa; data_len]);
        w
    }

    #[test]
    fn test_enqueue_segments_payloads() {
        let w = window_with(100, 10);
        // 10 bytes at payload_size 4 -> 4 + 4 + 2
        assert_eq!(w.pending.len(), 3);
        assert!(w.has_pending());
        assert!(!w.is_fully_acked());
    }

    #[test]
    fn test_burst_respects_window() {
        let mut w = window_with(100, 40);
        let now = Instant::now();

        let burst = w.next_burst(3, now);
        assert_eq!(burst.len(), 3);
        assert_eq!(w.outstanding(), 3);
        assert_eq!(burst[0].0, 100);
        assert_eq!(burst[1].0, 104);
        assert_eq!(burst[2].0, 108);
        assert_eq!(w.snd_nxt(), 112);
        assert_eq!(w.oldest().unwrap().seq, 100);

        // Window unchanged, nothing more may enter flight.
        assert!(w.next_burst(3, now).is_empty());
    }

    #[test]
    fn test_cumulative_ack_frees_segments() {
        let mut w = window_with(100, 12);
        let now = Instant::now();
        w.next_burst(3, now);

        let event = w.on_ack(108, now);
        match event {
            AckEvent::Advanced { freed, rtt_sample } => {
                assert_eq!(freed, 2);
                assert!(rtt_sample.is_some());
            }
            other => panic!("expected Advanced, got {other:?}"),
        }
        assert_eq!(w.snd_una(), 108);
        assert_eq!(w.outstanding(), 1);
    }

    #[test]
    fn test_duplicate_ack_counting() {
        let mut w = window_with(100, 12);
        let now = Instant::now();
        w.next_burst(3, now);

        assert_eq!(w.on_ack(100, now), AckEvent::Duplicate { count: 1 });
        assert_eq!(w.on_ack(100, now), AckEvent::Duplicate { count: 2 });
        assert_eq!(w.on_ack(100, now), AckEvent::Duplicate { count: 3 });

        // An advance resets the streak.
        assert!(matches!(w.on_ack(104, now), AckEvent::Advanced { .. }));
        assert_eq!(w.on_ack(104, now), AckEvent::Duplicate { count: 1 });
    }

    #[test]
    fn test_stale_ack_ignored() {
        let mut w = window_with(100, 12);
        let now = Instant::now();
        w.next_burst(3, now);
        w.on_ack(108, now);

        // Below the left edge: reordered old ACK.
        assert_eq!(w.on_ack(104, now), AckEvent::Stale);
        assert_eq!(w.snd_una(), 108);

        // Beyond snd_nxt: nonsense, ignored.
        assert_eq!(w.on_ack(200, now), AckEvent::Stale);
    }

    #[test]
    fn test_idle_ack_is_not_duplicate() {
        let mut w = window_with(100, 4);
        let now = Instant::now();
        w.next_burst(1, now);
        w.on_ack(104, now);

        // Window-probe replies re-ack snd_una with nothing outstanding.
        assert_eq!(w.on_ack(104, now), AckEvent::Stale);
        assert_eq!(w.on_ack(104, now), AckEvent::Stale);
    }

    #[test]
    fn test_retransmission_disqualifies_rtt_sample() {
        let mut w = window_with(100, 4);
        let now = Instant::now();
        w.next_burst(1, now);

        let (seq, payload, retries) = w.retransmit_oldest(now).unwrap();
        assert_eq!(seq, 100);
        assert_eq!(payload.len(), 4);
        assert_eq!(retries, 1);

        match w.on_ack(104, now) {
            AckEvent::Advanced { rtt_sample, .. } => assert!(rtt_sample.is_none()),
            other => panic!("expected Advanced, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_counter_accumulates_per_segment() {
        let mut w = window_with(100, 8);
        let now = Instant::now();
        w.next_burst(2, now);

        w.retransmit_oldest(now);
        w.retransmit_oldest(now);
        let (_, _, retries) = w.retransmit_oldest(now).unwrap();
        assert_eq!(retries, 3);

        // Freeing the front segment discards its counter; the next front
        // starts from its own count.
        w.on_ack(104, now);
        let (seq, _, retries) = w.retransmit_oldest(now).unwrap();
        assert_eq!(seq, 104);
        assert_eq!(retries, 1);
    }

    #[test]
    fn test_sequence_wraparound() {
        let initial = u32::MAX - 5;
        let mut w = window_with(initial, 12);
        let now = Instant::now();

        let burst = w.next_burst(3, now);
        assert_eq!(burst[0].0, initial);
        assert_eq!(burst[1].0, initial.wrapping_add(4));
        assert_eq!(burst[2].0, initial.wrapping_add(8)); // wrapped past zero
        assert_eq!(w.snd_nxt(), initial.wrapping_add(12));

        // A cumulative ACK across the wrap point frees everything.
        match w.on_ack(initial.wrapping_add(12), now) {
            AckEvent::Advanced { freed, .. } => assert_eq!(freed, 3),
            other => panic!("expected Advanced, got {other:?}"),
        }
        assert!(w.is_fully_acked());
    }

    #[test]
    fn test_full_drain() {
        let mut w = window_with(0, 16);
        let now = Instant::now();

        w.next_burst(64, now);
        assert_eq!(w.outstanding(), 4);
        assert!(!w.has_pending());

        w.on_ack(16, now);
        assert!(w.is_fully_acked());
    }
}
