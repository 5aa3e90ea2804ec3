//! Per-segment payload envelope.
//!
//! Uses ChaCha20-Poly1305 for symmetric encryption with authentication.
//! Each sealed payload carries its own fresh random nonce:
//!
//! ```text
//! ┌───────────┬──────────────────────┬──────────┐
//! │ nonce (12)│ ciphertext (len)     │ tag (16) │
//! └───────────┴──────────────────────┴──────────┘
//! ```
//!
//! The segment header is never encrypted and never enters the AEAD; it is
//! covered by the header checksum only. An open failure is reported as
//! [`Error::InvalidSegment`], indistinguishable at the engine level from a
//! checksum failure.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use hkdf::Hkdf;
use rand::RngCore;
use rand_core::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{ENVELOPE_OVERHEAD, KEY_MATERIAL_SIZE, KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};

/// A symmetric session key, derived from the key material in the SYN.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Draw fresh key material for a new connection from OS entropy.
    ///
    /// This is what the client places, in cleartext, in the SYN payload.
    pub fn generate_material() -> [u8; KEY_MATERIAL_SIZE] {
        let mut material = [0u8; KEY_MATERIAL_SIZE];
        OsRng.fill_bytes(&mut material);
        material
    }

    /// Derive the session key from SYN key material.
    ///
    /// Both ends run the same derivation, so a single SYN payload yields a
    /// single shared key.
    pub fn from_material(material: &[u8]) -> Result<Self> {
        if material.len() != KEY_MATERIAL_SIZE {
            return Err(Error::Crypto("key material must be 32 bytes"));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(b"rudp v1"), material);
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(b"session key", &mut key)
            .map_err(|_| Error::Crypto("HKDF expansion failed"))?;

        Ok(Self(key))
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Payload protection for one connection.
///
/// Sealed after a handshake that carried key material, plaintext when the
/// encryption toggle is off. The wire format (header + opaque payload) is
/// identical either way.
pub struct Envelope {
    cipher: Option<ChaCha20Poly1305>,
}

impl Envelope {
    /// Passthrough envelope: payloads travel as plaintext.
    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    /// Sealing envelope bound to a session key.
    pub fn sealed(key: SessionKey) -> Self {
        Self {
            cipher: Some(ChaCha20Poly1305::new(key.as_bytes().into())),
        }
    }

    /// Whether payloads are encrypted on the wire.
    pub fn is_sealed(&self) -> bool {
        self.cipher.is_some()
    }

    /// Wire expansion per payload: 0 when plaintext, nonce + tag otherwise.
    pub fn overhead(&self) -> usize {
        if self.cipher.is_some() {
            ENVELOPE_OVERHEAD
        } else {
            0
        }
    }

    /// Protect a plaintext payload for the wire.
    ///
    /// Infallible: ChaCha20-Poly1305 encryption cannot fail for any
    /// payload this protocol produces.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let Some(cipher) = &self.cipher else {
            return plaintext.to_vec();
        };

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt((&nonce).into(), plaintext)
            .expect("ChaCha20-Poly1305 encryption is infallible for in-memory payloads");

        let mut wire = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        wire
    }

    /// Recover and authenticate a wire payload.
    ///
    /// Any tampering, truncation, or key mismatch yields
    /// [`Error::InvalidSegment`].
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(wire.to_vec());
        };

        if wire.len() < ENVELOPE_OVERHEAD {
            return Err(Error::InvalidSegment);
        }

        let (nonce, ciphertext) = wire.split_at(NONCE_SIZE);
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().expect("split_at yields NONCE_SIZE bytes");

        cipher
            .decrypt((&nonce).into(), ciphertext)
            .map_err(|_| Error::InvalidSegment)
    }
}
