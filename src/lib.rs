//! # RUDP: Reliable UDP Byte-Stream Transport
//!
//! A reliable, ordered, flow-controlled, congestion-controlled, and
//! encrypted point-to-point byte-stream transport layered on UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Application Layer                       │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Client engine             │  Server engine             │
//! │  (handshake, send window,  │  (accept loop, reassembly, │
//! │   retransmit timer, Reno)  │   cumulative ACKs, rwnd)   │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Crypto Envelope (ChaCha20-Poly1305 per segment)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Segment Codec (16-byte header, 1's-complement checksum)│
//! ├─────────────────────────────────────────────────────────┤
//! │  UDP (lossy, reordering datagram service)               │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Exactness**: the receiver reconstructs the sender's byte stream
//!    byte-for-byte, in order, across loss and reordering
//! 2. **TCP-shaped recovery**: cumulative ACKs, a single retransmission
//!    timer, fast retransmit on triple duplicate ACKs, Reno congestion
//!    control
//! 3. **Authenticated payloads**: every post-handshake payload travels in
//!    an AEAD envelope; tampering is indistinguishable from loss
//!
//! ## Known Weaknesses (by construction)
//!
//! The session key material rides in the cleartext SYN payload, so the
//! scheme trusts the first datagram and does not resist an active
//! man-in-the-middle. Sequence numbers count bytes in DATA segments but
//! occupy single slots for SYN and FIN, mirroring TCP.
//!
//! ## Example
//!
//! ```no_run
//! use rudp::{Client, ConnectionConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> rudp::Result<()> {
//!     let mut server = Server::bind("127.0.0.1", 9000, 0.0).await?;
//!     tokio::spawn(async move {
//!         if let Some(transfer) = server.accept().await {
//!             let (data, metrics) = transfer.collect().await;
//!             println!("{} bytes in {:?}", data.len(), metrics.elapsed);
//!         }
//!     });
//!
//!     let mut client = Client::connect("127.0.0.1", 9000, ConnectionConfig::default()).await?;
//!     client.send_bytes(b"ola, mundo confiavel").await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod crypto;
pub mod error;
pub mod server;
pub mod transport;

pub use client::Client;
pub use error::{Error, Result};
pub use server::{Server, Transfer};
pub use transport::{ConnectionConfig, ConnectionState, MetricsSnapshot};
