//! Server engine: the receiving side.
//!
//! One UDP socket serves every peer. A demultiplexer task reads datagrams,
//! applies the simulated-loss lottery, and routes segments to independent
//! per-connection tasks keyed by peer address. Each connection task owns
//! its [`Reassembly`] state machine, emits one cumulative ACK per received
//! segment, and hands the ordered byte stream to the application through a
//! bounded channel whose occupancy is reflected in the advertised window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use rand_core::OsRng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;

use crate::crypto::{Envelope, SessionKey, KEY_MATERIAL_SIZE};
use crate::error::Result;
use crate::transport::segment::{flags, Segment};
use crate::transport::{
    ConnectionConfig, ConnectionMetrics, ConnectionState, DataOutcome, MetricsSnapshot,
    Reassembly, FIN_DRAIN, MAX_RTO, PAYLOAD_SIZE,
};

/// Scratch buffer size for inbound datagrams.
const RECV_BUF: usize = 65536;

/// A listening RUDP server.
///
/// Binding spawns the demultiplexer; [`Server::accept`] yields one
/// [`Transfer`] per established connection. Dropping the server stops the
/// listener and every in-flight connection.
pub struct Server {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Transfer>,
    demux_task: JoinHandle<()>,
}

impl Server {
    /// Bind and start accepting. Each received datagram is independently
    /// dropped with probability `drop_rate` before any processing, so the
    /// sender observes authentic loss signals.
    pub async fn bind(bind_addr: &str, port: u16, drop_rate: f64) -> Result<Self> {
        Self::bind_with_config(bind_addr, port, drop_rate, ConnectionConfig::default()).await
    }

    /// Bind with explicit per-connection options.
    pub async fn bind_with_config(
        bind_addr: &str,
        port: u16,
        drop_rate: f64,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind((bind_addr, port)).await?);
        let local_addr = socket.local_addr()?;
        let (incoming_tx, incoming) = mpsc::channel(64);

        let demux = Demux {
            socket,
            drop_rate,
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
            incoming_tx,
        };
        let demux_task = tokio::spawn(demux.run());

        tracing::info!(%local_addr, drop_rate, "server listening");
        Ok(Self {
            local_addr,
            incoming,
            demux_task,
        })
    }

    /// Bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next connection to complete its handshake.
    pub async fn accept(&mut self) -> Option<Transfer> {
        self.incoming.recv().await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.demux_task.abort();
    }
}

/// The application's view of one accepted connection.
pub struct Transfer {
    peer: SocketAddr,
    data_rx: mpsc::Receiver<Bytes>,
    metrics: Arc<ConnectionMetrics>,
}

impl Transfer {
    /// Peer address of this connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Receive the next ordered chunk; `None` signals end of stream.
    ///
    /// Chunks left unread count against the advertised window, so a
    /// stalled consumer eventually closes the peer's window.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }

    /// Drain the whole stream into memory and return it with the final
    /// connection counters.
    pub async fn collect(mut self) -> (Vec<u8>, MetricsSnapshot) {
        let mut data = Vec::new();
        while let Some(chunk) = self.recv().await {
            data.extend_from_slice(&chunk);
        }
        (data, self.metrics.snapshot())
    }

    /// Snapshot of this connection's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Routing entry for one live connection.
struct ConnEntry {
    /// Client ISN, to tell a duplicate SYN from a fresh attempt.
    isn: u32,
    tx: mpsc::Sender<Segment>,
}

/// Reads the shared socket and routes segments to connection tasks.
struct Demux {
    socket: Arc<UdpSocket>,
    drop_rate: f64,
    config: ConnectionConfig,
    connections: Arc<Mutex<HashMap<SocketAddr, ConnEntry>>>,
    incoming_tx: mpsc::Sender<Transfer>,
}

impl Demux {
    async fn run(self) {
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "socket receive error");
                    continue;
                }
            };

            if should_drop(self.drop_rate) {
                tracing::trace!(%peer, "simulated loss, datagram dropped");
                continue;
            }

            let seg = match Segment::decode(&buf[..n]) {
                Ok(seg) => seg,
                Err(_) => {
                    tracing::debug!(%peer, "invalid segment dropped");
                    continue;
                }
            };

            self.route(seg, peer).await;
        }
    }

    async fn route(&self, seg: Segment, peer: SocketAddr) {
        let existing = {
            let conns = self.connections.lock();
            conns.get(&peer).map(|e| (e.isn, e.tx.clone()))
        };

        match existing {
            Some((isn, _)) if seg.is(flags::SYN) && seg.seq != isn => {
                // A different ISN from the same address is a fresh
                // connection attempt; the old record is superseded.
                tracing::info!(%peer, "new SYN supersedes existing connection");
                self.connections.lock().remove(&peer);
                self.open_connection(seg, peer);
            }
            Some((_, tx)) => {
                // A full queue sheds the segment; the protocol absorbs
                // that as ordinary loss.
                if tx.try_send(seg).is_err() {
                    tracing::trace!(%peer, "connection queue full, segment shed");
                }
            }
            None if seg.is(flags::SYN) => self.open_connection(seg, peer),
            None if seg.is(flags::FIN | flags::ACK) => {
                // The connection already drained away but the peer still
                // awaits its FIN ACK; answer so its close can finish.
                let ack = Segment::ack(0, seg.seq.wrapping_add(1), 0);
                if self.socket.send_to(&ack.encode(), peer).await.is_err() {
                    tracing::debug!(%peer, "failed to ack late FIN");
                }
            }
            None => {
                tracing::debug!(%peer, seg_flags = seg.flags, "segment for unknown connection dropped");
            }
        }
    }

    fn open_connection(&self, syn: Segment, peer: SocketAddr) {
        let Some(conn) = Connection::from_syn(
            &syn,
            peer,
            Arc::clone(&self.socket),
            self.config.clone(),
        ) else {
            tracing::warn!(%peer, payload_len = syn.payload.len(), "SYN with malformed key material ignored");
            return;
        };

        let isn = syn.seq;
        let (tx, rx) = mpsc::channel(128);
        self.connections.lock().insert(peer, ConnEntry { isn, tx });

        let connections = Arc::clone(&self.connections);
        let incoming_tx = self.incoming_tx.clone();
        tokio::spawn(async move {
            conn.run(rx, incoming_tx).await;
            // Only reap our own entry; a superseding SYN may have
            // installed a new one under the same address.
            let mut conns = connections.lock();
            if conns.get(&peer).is_some_and(|e| e.isn == isn) {
                conns.remove(&peer);
            }
        });
    }
}

/// Event driving one connection task's loop.
enum Event {
    Segment(Segment),
    SynAckTimer,
    Detached,
}

/// The receiving half of one connection, owned by its task.
struct Connection {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    config: ConnectionConfig,
    state: ConnectionState,
    envelope: Envelope,
    reassembly: Reassembly,
    /// Server ISN carried in the SYN-ACK.
    isn: u32,
    /// Encoded SYN-ACK, kept for retransmission.
    syn_ack: Bytes,
    syn_ack_sent_at: Instant,
    metrics: Arc<ConnectionMetrics>,
    /// Hand-off to the application; dropped to signal end of stream.
    app_tx: Option<mpsc::Sender<Bytes>>,
    /// Pending [`Transfer`] until the handshake completes.
    transfer: Option<Transfer>,
}

impl Connection {
    /// Build connection state from an inbound SYN. Returns `None` when the
    /// SYN payload is neither empty (plaintext mode) nor key material.
    fn from_syn(
        syn: &Segment,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        config: ConnectionConfig,
    ) -> Option<Self> {
        let envelope = if syn.payload.len() == KEY_MATERIAL_SIZE {
            let key = SessionKey::from_material(&syn.payload).ok()?;
            Envelope::sealed(key)
        } else if syn.payload.is_empty() {
            Envelope::plaintext()
        } else {
            return None;
        };

        let isn = OsRng.next_u32();
        let rcv_nxt = syn.seq.wrapping_add(1);
        let reassembly = Reassembly::new(rcv_nxt, config.rwnd_max, PAYLOAD_SIZE);
        let syn_ack = Segment::syn_ack(isn, rcv_nxt, reassembly.rwnd()).encode();

        let metrics = Arc::new(ConnectionMetrics::new());
        let (app_tx, data_rx) = mpsc::channel(config.rwnd_max.max(1) as usize);
        let transfer = Transfer {
            peer,
            data_rx,
            metrics: Arc::clone(&metrics),
        };

        Some(Self {
            peer,
            socket,
            config,
            state: ConnectionState::SynRcvd,
            envelope,
            reassembly,
            isn,
            syn_ack,
            syn_ack_sent_at: Instant::now(),
            metrics,
            app_tx: Some(app_tx),
            transfer: Some(transfer),
        })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Segment>, incoming_tx: mpsc::Sender<Transfer>) {
        self.metrics.add_segment_received(); // the SYN itself
        if self.send(&self.syn_ack.clone()).await.is_err() {
            return;
        }
        tracing::info!(
            peer = %self.peer,
            isn = self.isn,
            rcv_nxt = self.reassembly.rcv_nxt(),
            crypto = self.envelope.is_sealed(),
            "SYN received, SYN-ACK sent"
        );

        let mut syn_ack_rto = self.config.initial_rto;
        let mut syn_ack_retries: u32 = 0;

        loop {
            let event = if self.state == ConnectionState::SynRcvd {
                let deadline = self.syn_ack_sent_at + syn_ack_rto;
                tokio::select! {
                    seg = rx.recv() => seg.map_or(Event::Detached, Event::Segment),
                    _ = sleep_until(deadline.into()) => Event::SynAckTimer,
                }
            } else {
                rx.recv().await.map_or(Event::Detached, Event::Segment)
            };

            match event {
                Event::Detached => return,
                Event::SynAckTimer => {
                    syn_ack_retries += 1;
                    if syn_ack_retries > self.config.max_retries {
                        tracing::warn!(
                            peer = %self.peer,
                            retries = syn_ack_retries - 1,
                            "handshake abandoned, final ACK never arrived"
                        );
                        return;
                    }
                    self.metrics.add_timeout();
                    self.metrics.add_retransmission();
                    if self.send(&self.syn_ack.clone()).await.is_err() {
                        return;
                    }
                    tracing::debug!(peer = %self.peer, attempt = syn_ack_retries, "SYN-ACK retransmitted");
                    syn_ack_rto = (syn_ack_rto * 2).min(MAX_RTO);
                    self.syn_ack_sent_at = Instant::now();
                }
                Event::Segment(seg) => {
                    self.metrics.add_segment_received();
                    if self.handle_segment(seg, &incoming_tx).await {
                        self.linger(&mut rx).await;
                        return;
                    }
                }
            }
        }
    }

    /// Process one routed segment. Returns true when the connection is
    /// finished and should linger briefly before its record is dropped.
    async fn handle_segment(&mut self, seg: Segment, incoming_tx: &mpsc::Sender<Transfer>) -> bool {
        if seg.is(flags::SYN) {
            // Duplicate SYN: our SYN-ACK was lost.
            let _ = self.send(&self.syn_ack.clone()).await;
            self.syn_ack_sent_at = Instant::now();
            return false;
        }

        if seg.is(flags::ACK) {
            if self.state == ConnectionState::SynRcvd && seg.ack == self.isn.wrapping_add(1) {
                self.establish(incoming_tx).await;
            }
            return false;
        }

        if seg.is(flags::DATA | flags::ACK) {
            self.on_data(seg, incoming_tx).await;
            return false;
        }

        if seg.is(flags::FIN | flags::ACK) {
            return self.on_fin(seg).await;
        }

        false
    }

    async fn establish(&mut self, incoming_tx: &mpsc::Sender<Transfer>) {
        self.state = ConnectionState::Established;
        tracing::info!(peer = %self.peer, "connection established");
        if let Some(transfer) = self.transfer.take() {
            // The embedder may have dropped the accept side; the stream
            // then drains into the void.
            let _ = incoming_tx.send(transfer).await;
        }
    }

    async fn on_data(&mut self, seg: Segment, incoming_tx: &mpsc::Sender<Transfer>) {
        let payload = match self.envelope.open(&seg.payload) {
            Ok(plain) => plain,
            Err(_) => {
                // Authentication failure is indistinguishable from
                // corruption: drop silently, no ACK, no state change.
                self.metrics.add_invalid_segment();
                tracing::debug!(peer = %self.peer, seq = seg.seq, "authentication failed, segment dropped");
                return;
            }
        };

        // An authenticated DATA segment while still in SYN_RCVD means the
        // final handshake ACK was lost; the data itself completes it.
        if self.state == ConnectionState::SynRcvd {
            self.establish(incoming_tx).await;
        }

        match self.reassembly.on_data(seg.seq, Bytes::from(payload)) {
            DataOutcome::Delivered { segments, bytes } => {
                self.metrics.add_bytes_delivered(bytes);
                tracing::trace!(
                    peer = %self.peer,
                    seq = seg.seq,
                    segments,
                    bytes,
                    rcv_nxt = self.reassembly.rcv_nxt(),
                    "delivered in order"
                );
            }
            DataOutcome::Buffered => {
                tracing::trace!(peer = %self.peer, seq = seg.seq, "buffered out of order");
            }
            DataOutcome::Duplicate => {
                tracing::trace!(peer = %self.peer, seq = seg.seq, "duplicate segment dropped");
            }
            DataOutcome::OutOfWindow => {
                tracing::debug!(peer = %self.peer, seq = seg.seq, "segment beyond window dropped");
            }
            DataOutcome::Exhausted => {
                tracing::debug!(peer = %self.peer, seq = seg.seq, "reassembly buffer full, segment dropped");
            }
            DataOutcome::Probe => {
                tracing::trace!(peer = %self.peer, "window probe");
            }
        }

        self.flush_ready();

        // Every received DATA segment is answered with a cumulative ACK;
        // repeats of the same rcv_nxt are what drive fast retransmit.
        let ack = Segment::ack(0, self.reassembly.rcv_nxt(), self.reassembly.rwnd());
        let _ = self.send(&ack.encode()).await;
    }

    async fn on_fin(&mut self, seg: Segment) -> bool {
        if self.envelope.open(&seg.payload).is_err() {
            self.metrics.add_invalid_segment();
            tracing::debug!(peer = %self.peer, "unauthenticated FIN dropped");
            return false;
        }

        if !self.reassembly.fin_in_order(seg.seq) {
            // Data is still missing ahead of the FIN; the duplicate ACK
            // asks the peer to retransmit the gap first.
            let ack = Segment::ack(0, self.reassembly.rcv_nxt(), self.reassembly.rwnd());
            let _ = self.send(&ack.encode()).await;
            return false;
        }

        let ack = Segment::ack(0, seg.seq.wrapping_add(1), self.reassembly.rwnd());
        let _ = self.send(&ack.encode()).await;
        self.state = ConnectionState::CloseWait;

        // Hand the tail of the stream to the application, then signal end
        // of stream by dropping the channel.
        self.flush_remaining().await;
        self.app_tx = None;

        let summary = self.metrics.snapshot();
        tracing::info!(
            peer = %self.peer,
            bytes = summary.bytes_delivered,
            segments = summary.segments_received,
            invalid = summary.invalid_segments,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "FIN received, connection closing"
        );
        true
    }

    /// Answer retransmitted FINs for a short drain interval so the peer's
    /// close can complete even when our first FIN ACK was lost.
    async fn linger(&mut self, rx: &mut mpsc::Receiver<Segment>) {
        let until = Instant::now() + FIN_DRAIN;
        loop {
            let seg = tokio::select! {
                seg = rx.recv() => match seg {
                    Some(seg) => seg,
                    None => return,
                },
                _ = sleep_until(until.into()) => return,
            };
            if seg.is(flags::FIN | flags::ACK) {
                let ack = Segment::ack(0, seg.seq.wrapping_add(1), 0);
                let _ = self.send(&ack.encode()).await;
            }
        }
    }

    /// Move ready payloads into the application channel without blocking;
    /// whatever does not fit stays buffered and shrinks the window.
    fn flush_ready(&mut self) {
        let Some(app_tx) = &self.app_tx else {
            // Transfer was dropped by the embedder; discard the stream but
            // keep the window open so the sender can finish.
            while self.reassembly.pop_ready().is_some() {}
            return;
        };

        while let Some(chunk) = self.reassembly.pop_ready() {
            match app_tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    self.reassembly.requeue_ready(chunk);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.app_tx = None;
                    while self.reassembly.pop_ready().is_some() {}
                    break;
                }
            }
        }
    }

    /// Blocking variant of [`Self::flush_ready`] used at FIN time: every
    /// remaining in-order byte must reach the application.
    async fn flush_remaining(&mut self) {
        let Some(app_tx) = &self.app_tx else {
            while self.reassembly.pop_ready().is_some() {}
            return;
        };
        while let Some(chunk) = self.reassembly.pop_ready() {
            if app_tx.send(chunk).await.is_err() {
                self.app_tx = None;
                while self.reassembly.pop_ready().is_some() {}
                return;
            }
        }
    }

    async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        self.metrics.add_segment_sent();
        Ok(())
    }
}

/// Simulated-loss lottery: drop with probability `p` in [0, 1].
fn should_drop(p: f64) -> bool {
    p > 0.0 && (p >= 1.0 || rand::random::<f64>() < p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_lottery_extremes() {
        assert!(!should_drop(0.0));
        assert!(!should_drop(-1.0));
        assert!(should_drop(1.0));

        // p = 0.5 must eventually produce both outcomes.
        let drops = (0..1000).filter(|_| should_drop(0.5)).count();
        assert!(drops > 0 && drops < 1000);
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server = Server::bind("127.0.0.1", 0, 0.0).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }
}
