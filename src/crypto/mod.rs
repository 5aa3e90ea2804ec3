//! Cryptographic envelope for RUDP payloads.
//!
//! This module provides:
//! - Session key installation from the key material carried in the SYN
//!   (HKDF-SHA256 expansion)
//! - ChaCha20-Poly1305 AEAD protection of every post-handshake payload,
//!   with a fresh random nonce embedded in each envelope
//!
//! Key material and nonces come straight from the OS entropy source;
//! secret material is zeroized on drop.
//!
//! The key-exchange model is deliberately minimal: the client ships fresh
//! key material in the cleartext SYN payload. This trusts the first
//! datagram and offers no resistance to an active man-in-the-middle.

mod envelope;

pub use envelope::{Envelope, SessionKey};

/// Size of the key material carried in the SYN payload.
pub const KEY_MATERIAL_SIZE: usize = 32;

/// Size of the derived session key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Wire expansion of an encrypted payload: embedded nonce plus tag.
pub const ENVELOPE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_to_shared_envelope() {
        // Client draws material, server receives it from the SYN; both
        // ends must arrive at the same session key.
        let material = SessionKey::generate_material();

        let client = Envelope::sealed(SessionKey::from_material(&material).unwrap());
        let server = Envelope::sealed(SessionKey::from_material(&material).unwrap());

        let wire = client.seal(b"reliable bytes");
        assert_eq!(wire.len(), 14 + ENVELOPE_OVERHEAD);

        let plain = server.open(&wire).unwrap();
        assert_eq!(plain.as_slice(), b"reliable bytes");
    }
}
