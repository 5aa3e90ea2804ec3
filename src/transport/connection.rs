//! Per-connection state: lifecycle label, RTT estimation, metrics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::transport::{MAX_RTO, MIN_RTO};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, or torn down.
    Closed,
    /// Client sent SYN, awaiting SYN-ACK.
    SynSent,
    /// Server received SYN and replied SYN-ACK, awaiting the final ACK.
    SynRcvd,
    /// Handshake complete; data may flow.
    Established,
    /// FIN sent, awaiting its ACK.
    FinSent,
    /// FIN received and acknowledged; draining before close.
    CloseWait,
}

impl ConnectionState {
    /// Short uppercase label for logs and errors.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynRcvd => "SYN_RCVD",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinSent => "FIN_SENT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Smoothed round-trip estimator driving the retransmission timeout.
///
/// Follows the standard recursion: `srtt ← 7/8·srtt + 1/8·sample`,
/// `rttvar ← 3/4·rttvar + 1/4·|sample − srtt|`, `rto ← srtt + 4·rttvar`,
/// clamped to [200 ms, 60 s]. Samples must come only from segments that
/// were never retransmitted (Karn's rule); the callers enforce that.
#[derive(Debug)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    rto: Duration,
    seeded: bool,
}

impl RttEstimator {
    /// Start with the configured initial RTO and no samples.
    pub fn new(initial_rto: Duration) -> Self {
        Self {
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            rto: initial_rto.clamp(MIN_RTO, MAX_RTO),
            seeded: false,
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, once at least one sample has arrived.
    pub fn srtt(&self) -> Option<Duration> {
        self.seeded.then(|| Duration::from_secs_f64(self.srtt_ms / 1000.0))
    }

    /// Fold in an RTT sample from a never-retransmitted segment.
    pub fn on_sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if self.seeded {
            self.rttvar_ms = 0.75 * self.rttvar_ms + 0.25 * (sample_ms - self.srtt_ms).abs();
            self.srtt_ms = 0.875 * self.srtt_ms + 0.125 * sample_ms;
        } else {
            self.srtt_ms = sample_ms;
            self.rttvar_ms = sample_ms / 2.0;
            self.seeded = true;
        }

        let rto_ms = self.srtt_ms + 4.0 * self.rttvar_ms;
        self.rto = Duration::from_secs_f64(rto_ms / 1000.0).clamp(MIN_RTO, MAX_RTO);
    }

    /// Exponential backoff after a retransmission timeout.
    pub fn on_backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}

/// Per-connection counters, shared between the engine and its embedder.
///
/// All counters are relaxed atomics: they are monotone tallies read for
/// reporting, never for synchronization.
#[derive(Debug)]
pub struct ConnectionMetrics {
    started: Instant,
    bytes_delivered: AtomicU64,
    segments_sent: AtomicU64,
    segments_received: AtomicU64,
    retransmissions: AtomicU64,
    timeouts: AtomicU64,
    duplicate_acks: AtomicU64,
    invalid_segments: AtomicU64,
}

impl ConnectionMetrics {
    /// Start the clock for a new connection.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes_delivered: AtomicU64::new(0),
            segments_sent: AtomicU64::new(0),
            segments_received: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            duplicate_acks: AtomicU64::new(0),
            invalid_segments: AtomicU64::new(0),
        }
    }

    /// Record in-order bytes handed to the application.
    pub fn add_bytes_delivered(&self, bytes: u64) {
        self.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one transmitted segment.
    pub fn add_segment_sent(&self) {
        self.segments_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one received segment.
    pub fn add_segment_received(&self) {
        self.segments_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retransmission (timer- or dup-ACK-driven).
    pub fn add_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retransmission-timer expiry.
    pub fn add_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one duplicate ACK observed.
    pub fn add_duplicate_ack(&self) {
        self.duplicate_acks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dropped segment (checksum or authentication failure).
    pub fn add_invalid_segment(&self) {
        self.invalid_segments.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture all counters at a point in time.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            segments_sent: self.segments_sent.load(Ordering::Relaxed),
            segments_received: self.segments_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            duplicate_acks: self.duplicate_acks.load(Ordering::Relaxed),
            invalid_segments: self.invalid_segments.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one connection's counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// In-order stream bytes handed to the application.
    pub bytes_delivered: u64,
    /// Segments put on the wire, retransmissions included.
    pub segments_sent: u64,
    /// Segments received and decoded.
    pub segments_received: u64,
    /// Segments sent more than once.
    pub retransmissions: u64,
    /// Retransmission-timer expiries.
    pub timeouts: u64,
    /// Duplicate cumulative ACKs observed.
    pub duplicate_acks: u64,
    /// Segments dropped for checksum or authentication failure.
    pub invalid_segments: u64,
    /// Wall-clock time since the connection started.
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Delivered throughput in kilobytes per second.
    pub fn throughput_kbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_delivered as f64 / 1024.0 / secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::Established.to_string(), "ESTABLISHED");
        assert_eq!(ConnectionState::SynRcvd.label(), "SYN_RCVD");
    }

    #[test]
    fn test_rtt_first_sample_seeds_estimator() {
        let mut rtt = RttEstimator::new(Duration::from_millis(1000));
        assert_eq!(rtt.rto(), Duration::from_millis(1000));
        assert!(rtt.srtt().is_none());

        rtt.on_sample(Duration::from_millis(100));

        // srtt = 100, rttvar = 50, rto = 100 + 200 = 300ms
        assert_eq!(rtt.srtt().unwrap(), Duration::from_millis(100));
        assert_eq!(rtt.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimator::new(Duration::from_millis(1000));

        rtt.on_sample(Duration::from_millis(100));
        rtt.on_sample(Duration::from_millis(200));

        // srtt = 7/8*100 + 1/8*200 = 112.5ms
        let srtt = rtt.srtt().unwrap();
        assert!(srtt > Duration::from_millis(112) && srtt < Duration::from_millis(113));
    }

    #[test]
    fn test_rto_clamps() {
        let mut rtt = RttEstimator::new(Duration::from_millis(1000));

        // A tiny RTT must not push the RTO under the floor.
        rtt.on_sample(Duration::from_millis(1));
        assert_eq!(rtt.rto(), MIN_RTO);

        // Backoff doubles but never exceeds the ceiling.
        for _ in 0..12 {
            rtt.on_backoff();
        }
        assert_eq!(rtt.rto(), MAX_RTO);
    }

    #[test]
    fn test_backoff_doubles() {
        let mut rtt = RttEstimator::new(Duration::from_millis(1000));
        rtt.on_backoff();
        assert_eq!(rtt.rto(), Duration::from_millis(2000));
        rtt.on_backoff();
        assert_eq!(rtt.rto(), Duration::from_millis(4000));
    }

    #[test]
    fn test_metrics_counting() {
        let metrics = ConnectionMetrics::new();

        metrics.add_bytes_delivered(1024);
        metrics.add_segment_sent();
        metrics.add_segment_sent();
        metrics.add_retransmission();
        metrics.add_timeout();
        metrics.add_duplicate_ack();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_delivered, 1024);
        assert_eq!(snapshot.segments_sent, 2);
        assert_eq!(snapshot.retransmissions, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.duplicate_acks, 1);
    }

    #[test]
    fn test_throughput_calculation() {
        let snapshot = MetricsSnapshot {
            bytes_delivered: 10 * 1024,
            segments_sent: 0,
            segments_received: 0,
            retransmissions: 0,
            timeouts: 0,
            duplicate_acks: 0,
            invalid_segments: 0,
            elapsed: Duration::from_secs(2),
        };
        assert!((snapshot.throughput_kbps() - 5.0).abs() < f64::EPSILON);
    }
}
