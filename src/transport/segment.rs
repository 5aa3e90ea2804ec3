//! Segment framing and serialization.
//!
//! Defines the wire format for protocol segments. One segment is one UDP
//! datagram payload:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Seq (4)      │ Ack (4)      │ Flags (2) │ Rwnd (2)      │
//! ├─────────────────────────────────────────────────────────┤
//! │ Length (2)   │ Checksum (2) │ Payload (variable)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All multi-byte fields are big-endian. The checksum is the 16-bit
//! one's-complement sum over the header (checksum field zeroed) and the
//! payload as present on the wire, ciphertext included.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Segment flag bits.
pub mod flags {
    /// Connection open request; payload carries key material.
    pub const SYN: u16 = 0x1;
    /// Cumulative acknowledgment field is meaningful.
    pub const ACK: u16 = 0x2;
    /// Connection close request.
    pub const FIN: u16 = 0x4;
    /// Payload carries stream bytes.
    pub const DATA: u16 = 0x8;
}

/// The flag combinations the protocol emits. Anything else is rejected at
/// decode time.
const LEGAL_FLAGS: [u16; 5] = [
    flags::SYN,
    flags::SYN | flags::ACK,
    flags::ACK,
    flags::DATA | flags::ACK,
    flags::FIN | flags::ACK,
];

/// A protocol segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number of the first payload byte, or the handshake slot
    /// for SYN/FIN.
    pub seq: u32,
    /// Cumulative acknowledgment: next expected sequence at the peer.
    pub ack: u32,
    /// Flag bitset, see [`flags`].
    pub flags: u16,
    /// Receive window advertisement, in segments.
    pub rwnd: u16,
    /// Opaque payload: key material during the handshake, ciphertext (or
    /// plaintext when encryption is off) afterwards.
    pub payload: Bytes,
}

impl Segment {
    /// Connection request carrying key material.
    pub fn syn(seq: u32, key_material: Bytes) -> Self {
        Self {
            seq,
            ack: 0,
            flags: flags::SYN,
            rwnd: 0,
            payload: key_material,
        }
    }

    /// Handshake reply acknowledging the SYN.
    pub fn syn_ack(seq: u32, ack: u32, rwnd: u16) -> Self {
        Self {
            seq,
            ack,
            flags: flags::SYN | flags::ACK,
            rwnd,
            payload: Bytes::new(),
        }
    }

    /// Pure cumulative acknowledgment.
    pub fn ack(seq: u32, ack: u32, rwnd: u16) -> Self {
        Self {
            seq,
            ack,
            flags: flags::ACK,
            rwnd,
            payload: Bytes::new(),
        }
    }

    /// Stream data segment. A zero-length payload is legal and serves as a
    /// window probe.
    pub fn data(seq: u32, ack: u32, rwnd: u16, payload: Bytes) -> Self {
        Self {
            seq,
            ack,
            flags: flags::DATA | flags::ACK,
            rwnd,
            payload,
        }
    }

    /// Connection close request.
    pub fn fin(seq: u32, ack: u32, payload: Bytes) -> Self {
        Self {
            seq,
            ack,
            flags: flags::FIN | flags::ACK,
            rwnd: 0,
            payload,
        }
    }

    /// Check if a flag bit is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Exact flag-set comparison.
    pub fn is(&self, flag_set: u16) -> bool {
        self.flags == flag_set
    }

    /// Total datagram size of this segment.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the segment to a datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());

        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.flags);
        buf.put_u16(self.rwnd);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u16(0); // checksum placeholder
        buf.put_slice(&self.payload);

        let checksum = checksum(&buf);
        buf[14..16].copy_from_slice(&checksum.to_be_bytes());

        buf.freeze()
    }

    /// Parse a datagram into a segment.
    ///
    /// Truncation, length mismatch, unknown flag combinations, and
    /// checksum failure all collapse into [`Error::InvalidSegment`]; the
    /// engines treat each the same way, as a silent drop.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < HEADER_SIZE {
            return Err(Error::InvalidSegment);
        }
        if !verify(datagram) {
            return Err(Error::InvalidSegment);
        }

        let mut header = &datagram[..HEADER_SIZE];
        let seq = header.get_u32();
        let ack = header.get_u32();
        let flag_bits = header.get_u16();
        let rwnd = header.get_u16();
        let length = header.get_u16() as usize;

        if !LEGAL_FLAGS.contains(&flag_bits) {
            return Err(Error::InvalidSegment);
        }
        if datagram.len() != HEADER_SIZE + length {
            return Err(Error::InvalidSegment);
        }

        Ok(Self {
            seq,
            ack,
            flags: flag_bits,
            rwnd,
            payload: Bytes::copy_from_slice(&datagram[HEADER_SIZE..]),
        })
    }
}

/// One's-complement sum of 16-bit big-endian words; a trailing odd byte is
/// padded with zero.
fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u16::from_be_bytes([*last, 0]) as u32);
    }

    sum
}

/// Fold the carries and complement, RFC 1071 style.
fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute the header checksum over a datagram whose checksum field is
/// zeroed.
fn checksum(datagram: &[u8]) -> u16 {
    fold(ones_complement_sum(datagram))
}

/// Verify a received datagram. Summing the datagram including its stored
/// checksum folds to zero exactly when the checksum is intact.
fn verify(datagram: &[u8]) -> bool {
    fold(ones_complement_sum(datagram)) == 0
}

/// Serial-number comparison: `a < b` in a sequence space that wraps at
/// 2^32. Valid while the true distance stays under 2^31, which the window
/// bounds guarantee.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Serial-number comparison: `a <= b` with wrap-around.
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}
