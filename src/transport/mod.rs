//! RUDP transport core.
//!
//! The protocol engines are built from four sans-IO state machines:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │            Client / Server engines             │
//! ├───────────────────────┬────────────────────────┤
//! │  SendWindow           │  Reassembly            │
//! │  (retransmit buffer,  │  (ordered delivery,    │
//! │   window arithmetic)  │   rwnd accounting)     │
//! ├───────────────────────┴────────────────────────┤
//! │  RenoController (cwnd / ssthresh)              │
//! │  RttEstimator   (srtt / rttvar / rto)          │
//! ├────────────────────────────────────────────────┤
//! │  Segment codec (framing, checksum)             │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Everything in this module is deterministic and synchronous; sockets and
//! timers live in [`crate::client`] and [`crate::server`].

pub mod congestion;
pub mod connection;
pub mod receiver;
pub mod segment;
pub mod sender;

pub use congestion::{CongestionPhase, RenoController};
pub use connection::{ConnectionMetrics, ConnectionState, MetricsSnapshot, RttEstimator};
pub use receiver::{DataOutcome, Reassembly};
pub use segment::{flags, Segment, HEADER_SIZE};
pub use sender::{AckEvent, SendWindow};

use std::time::Duration;

/// Maximum plaintext payload per DATA segment.
pub const PAYLOAD_SIZE: usize = 1024;

/// Receive window ceiling, in segments.
pub const RWND_MAX: u16 = 64;

/// Retry budget for SYN, SYN-ACK, DATA, and FIN retransmissions.
pub const MAX_RETRIES: u32 = 5;

/// Retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Lower clamp on the retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(200);

/// Upper clamp on the retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Initial congestion window, in segments.
pub const INITIAL_CWND: f64 = 1.0;

/// Initial slow-start threshold, in segments.
pub const INITIAL_SSTHRESH: f64 = 64.0;

/// Duplicate-ACK count that triggers fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// How long a receiver lingers after FIN before discarding the connection.
pub const FIN_DRAIN: Duration = Duration::from_millis(200);

/// Per-connection options.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Encrypt payloads after the handshake.
    pub use_crypto: bool,
    /// Run the Reno congestion controller. When off, only the peer's
    /// advertised window bounds transmission.
    pub cc_enabled: bool,
    /// Receive window ceiling advertised to the peer, in segments.
    pub rwnd_max: u16,
    /// Retry budget for every retransmitted segment kind.
    pub max_retries: u32,
    /// RTO used before the estimator has a sample.
    pub initial_rto: Duration,
    /// Overall deadline applied to `connect`, `send_bytes`, and `close`.
    pub op_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            use_crypto: true,
            cc_enabled: true,
            rwnd_max: RWND_MAX,
            max_retries: MAX_RETRIES,
            initial_rto: INITIAL_RTO,
            op_timeout: None,
        }
    }
}
