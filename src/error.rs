//! Error types for the RUDP transport.

use thiserror::Error;

/// Result type alias for RUDP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during RUDP operations.
///
/// Ordinary packet loss is never an error: it is absorbed by the
/// retransmission machinery. Only retry exhaustion, cancellation, or a
/// fatal local condition surfaces to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Header, checksum, or authentication failure on an inbound segment.
    ///
    /// Never surfaced to the application; the engines count the drop and
    /// carry on.
    #[error("invalid segment")]
    InvalidSegment,

    /// SYN or SYN-ACK was not acknowledged within the retry budget.
    #[error("handshake failed after {attempts} attempts")]
    Handshake { attempts: u32 },

    /// A data segment was retransmitted past the retry budget without an ACK.
    #[error("peer unreachable: seq {seq} retransmitted {retries} times without ack")]
    PeerUnreachable { seq: u32, retries: u32 },

    /// FIN was not acknowledged within the retry budget.
    #[error("shutdown failed: FIN unacknowledged after {attempts} attempts")]
    Shutdown { attempts: u32 },

    /// Caller-driven cancellation or operation deadline expiry.
    #[error("operation cancelled or deadline expired")]
    Cancelled,

    /// Out-of-order reassembly buffer is full.
    ///
    /// Handled internally by advertising a zero window; never an
    /// application-visible failure.
    #[error("reassembly buffer exhausted")]
    BufferExhausted,

    /// Cryptographic setup failure (bad key material, derivation error).
    #[error("cryptographic error: {0}")]
    Crypto(&'static str),

    /// Operation requires an established connection.
    #[error("connection not established (state: {0})")]
    NotConnected(&'static str),

    /// Network I/O error from the datagram socket.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check whether this error tears down the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Handshake { .. }
                | Error::PeerUnreachable { .. }
                | Error::Shutdown { .. }
                | Error::Cancelled
                | Error::Io(_)
        )
    }
}
