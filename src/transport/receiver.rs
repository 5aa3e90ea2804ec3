//! Receiver-side reassembly.
//!
//! [`Reassembly`] owns `rcv_nxt`, the out-of-order buffer, and the ready
//! queue of in-order payloads not yet drained by the application. The
//! advertised window is `rwnd_max` minus everything still buffered, ready
//! queue included, so a stalled application drain closes the window.
//!
//! Sans-IO: the server engine decodes, authenticates, and emits the ACKs;
//! this type only answers "what does this payload do to the stream".

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::transport::segment::seq_lt;

/// What a DATA payload did to the receive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// In order: delivered, possibly draining buffered successors.
    Delivered {
        /// Segments moved to the ready queue, drained successors included.
        segments: u32,
        /// Stream bytes moved to the ready queue.
        bytes: u64,
    },
    /// Ahead of `rcv_nxt`: parked in the out-of-order buffer.
    Buffered,
    /// Already delivered, or already parked: dropped.
    Duplicate,
    /// Beyond the receive window: dropped.
    OutOfWindow,
    /// Buffer at capacity: dropped; the shrunken window says why.
    Exhausted,
    /// Zero-length segment at `rcv_nxt`: a window probe, no state change.
    Probe,
}

/// The receiving half of one connection.
#[derive(Debug)]
pub struct Reassembly {
    /// Next expected sequence number.
    rcv_nxt: u32,
    /// Payloads ahead of `rcv_nxt`, keyed by their first sequence number.
    /// Probed only by exact key, so map order is irrelevant under wrap.
    out_of_order: BTreeMap<u32, Bytes>,
    /// In-order payloads awaiting the application drain.
    ready: VecDeque<Bytes>,
    /// Window ceiling, in segments.
    rwnd_max: u16,
    /// Window width in sequence space.
    window_bytes: u32,
}

impl Reassembly {
    /// Create a reassembler expecting `initial_seq` first, with a window
    /// of `rwnd_max` segments of at most `payload_size` bytes.
    pub fn new(initial_seq: u32, rwnd_max: u16, payload_size: usize) -> Self {
        Self {
            rcv_nxt: initial_seq,
            out_of_order: BTreeMap::new(),
            ready: VecDeque::new(),
            rwnd_max,
            window_bytes: rwnd_max as u32 * payload_size as u32,
        }
    }

    /// Next expected sequence number; every emitted ACK carries it.
    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// Segments buffered and not yet drained by the application.
    pub fn buffered(&self) -> usize {
        self.ready.len() + self.out_of_order.len()
    }

    /// Window to advertise: the ceiling minus everything buffered.
    pub fn rwnd(&self) -> u16 {
        self.rwnd_max.saturating_sub(self.buffered() as u16)
    }

    /// Pop one in-order payload for the application.
    pub fn pop_ready(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }

    /// Whether in-order payloads await the application.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Put a popped payload back at the head of the ready queue, when the
    /// application hand-off could not take it yet.
    pub fn requeue_ready(&mut self, payload: Bytes) {
        self.ready.push_front(payload);
    }

    /// Apply one authenticated DATA payload with sequence `seq`.
    pub fn on_data(&mut self, seq: u32, payload: Bytes) -> DataOutcome {
        if seq == self.rcv_nxt {
            if payload.is_empty() {
                return DataOutcome::Probe;
            }

            let mut segments = 1u32;
            let mut bytes = payload.len() as u64;
            self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
            self.ready.push_back(payload);

            // Drain every buffered successor that is now contiguous.
            while let Some(next) = self.out_of_order.remove(&self.rcv_nxt) {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(next.len() as u32);
                segments += 1;
                bytes += next.len() as u64;
                self.ready.push_back(next);
            }

            return DataOutcome::Delivered { segments, bytes };
        }

        if seq_lt(seq, self.rcv_nxt) {
            return DataOutcome::Duplicate;
        }

        // Ahead of the stream: park it if the window allows. A segment
        // already parked is a duplicate even when the buffer is full.
        let window_end = self.rcv_nxt.wrapping_add(self.window_bytes);
        if !seq_lt(seq, window_end) {
            return DataOutcome::OutOfWindow;
        }
        if self.out_of_order.contains_key(&seq) {
            return DataOutcome::Duplicate;
        }
        if self.buffered() >= self.rwnd_max as usize {
            return DataOutcome::Exhausted;
        }

        self.out_of_order.insert(seq, payload);
        DataOutcome::Buffered
    }

    /// Whether a FIN at `seq` closes the stream cleanly (no data missing).
    pub fn fin_in_order(&self, seq: u32) -> bool {
        seq == self.rcv_nxt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn test_in_order_delivery() {
        let mut r = Reassembly::new(100, 64, 4);

        assert_eq!(
            r.on_data(100, payload(b'a', 4)),
            DataOutcome::Delivered { segments: 1, bytes: 4 }
        );
        assert_eq!(r.rcv_nxt(), 104);

        assert_eq!(
            r.on_data(104, payload(b'b', 2)),
            DataOutcome::Delivered { segments: 1, bytes: 2 }
        );
        assert_eq!(r.rcv_nxt(), 106);

        assert_eq!(r.pop_ready().unwrap(), payload(b'a', 4));
        assert_eq!(r.pop_ready().unwrap(), payload(b'b', 2));
        assert!(r.pop_ready().is_none());
    }

    #[test]
    fn test_out_of_order_held_until_gap_fills() {
        let mut r = Reassembly::new(0, 64, 4);

        // Segment N+1 arrives first and must not be delivered.
        assert_eq!(r.on_data(4, payload(b'b', 4)), DataOutcome::Buffered);
        assert!(!r.has_ready());
        assert_eq!(r.rcv_nxt(), 0);

        // Segment N fills the gap; both drain in order.
        assert_eq!(
            r.on_data(0, payload(b'a', 4)),
            DataOutcome::Delivered { segments: 2, bytes: 8 }
        );
        assert_eq!(r.rcv_nxt(), 8);
        assert_eq!(r.pop_ready().unwrap(), payload(b'a', 4));
        assert_eq!(r.pop_ready().unwrap(), payload(b'b', 4));
    }

    #[test]
    fn test_drain_stops_at_next_gap() {
        let mut r = Reassembly::new(0, 64, 4);

        r.on_data(4, payload(b'b', 4));
        r.on_data(12, payload(b'd', 4)); // gap at 8 remains

        assert_eq!(
            r.on_data(0, payload(b'a', 4)),
            DataOutcome::Delivered { segments: 2, bytes: 8 }
        );
        assert_eq!(r.rcv_nxt(), 8);
        assert_eq!(r.buffered(), 3); // two ready + one still parked
    }

    #[test]
    fn test_stale_segment_dropped() {
        let mut r = Reassembly::new(100, 64, 4);
        r.on_data(100, payload(b'a', 4));

        assert_eq!(r.on_data(100, payload(b'a', 4)), DataOutcome::Duplicate);
        assert_eq!(r.on_data(96, payload(b'z', 4)), DataOutcome::Duplicate);
        assert_eq!(r.rcv_nxt(), 104);
    }

    #[test]
    fn test_duplicate_out_of_order_dropped() {
        let mut r = Reassembly::new(0, 64, 4);

        assert_eq!(r.on_data(8, payload(b'c', 4)), DataOutcome::Buffered);
        assert_eq!(r.on_data(8, payload(b'c', 4)), DataOutcome::Duplicate);
        assert_eq!(r.buffered(), 1);
    }

    #[test]
    fn test_window_edge_dropped() {
        let mut r = Reassembly::new(0, 64, 1024);

        // Exactly rcv_nxt + RWND_MAX * PAYLOAD_SIZE: outside the window.
        assert_eq!(
            r.on_data(64 * 1024, payload(b'x', 4)),
            DataOutcome::OutOfWindow
        );
        // One byte inside is accepted.
        assert_eq!(
            r.on_data(64 * 1024 - 1, payload(b'x', 1)),
            DataOutcome::Buffered
        );
    }

    #[test]
    fn test_capacity_exhaustion_shrinks_window() {
        let mut r = Reassembly::new(0, 4, 10);
        assert_eq!(r.rwnd(), 4);

        // Fill with out-of-order segments, leaving the gap at zero open.
        for i in 1..=4u32 {
            r.on_data(i * 10, payload(b'x', 10));
        }
        assert_eq!(r.rwnd(), 0);

        assert_eq!(r.on_data(50, payload(b'x', 10)), DataOutcome::Exhausted);

        // A retransmit of something already parked is a duplicate, not a
        // capacity drop, even with the buffer at its ceiling.
        assert_eq!(r.on_data(10, payload(b'x', 10)), DataOutcome::Duplicate);
    }

    #[test]
    fn test_stalled_drain_closes_window() {
        let mut r = Reassembly::new(0, 1, 10);

        r.on_data(0, payload(b'a', 10));
        // Delivered but not drained: the window must stay closed.
        assert_eq!(r.rwnd(), 0);

        r.pop_ready();
        assert_eq!(r.rwnd(), 1);
    }

    #[test]
    fn test_probe_leaves_state_unchanged() {
        let mut r = Reassembly::new(42, 64, 4);

        assert_eq!(r.on_data(42, Bytes::new()), DataOutcome::Probe);
        assert_eq!(r.rcv_nxt(), 42);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_sequence_wraparound() {
        let initial = u32::MAX - 3;
        let mut r = Reassembly::new(initial, 64, 4);

        // Successor past the wrap point parks, then drains.
        assert_eq!(r.on_data(1, payload(b'b', 4)), DataOutcome::Buffered);
        assert_eq!(
            r.on_data(initial, payload(b'a', 4)),
            DataOutcome::Delivered { segments: 2, bytes: 8 }
        );
        assert_eq!(r.rcv_nxt(), 5);
    }

    #[test]
    fn test_fin_ordering() {
        let mut r = Reassembly::new(0, 64, 4);
        r.on_data(0, payload(b'a', 4));

        assert!(r.fin_in_order(4));
        assert!(!r.fin_in_order(8));
    }
}
