//! Client engine: the sending side of a connection.
//!
//! Drives the three-way handshake, the windowed send loop with its single
//! retransmission timer, zero-window probing, and the FIN exchange. Each
//! public operation runs as a single-task event loop: it waits on the
//! socket and the nearest timer deadline at once, so there is no busy
//! waiting and no shared mutable state to lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::RngCore;
use rand_core::OsRng;
use tokio::net::UdpSocket;
use tokio::time::sleep_until;

use crate::crypto::{Envelope, SessionKey};
use crate::error::{Error, Result};
use crate::transport::segment::{flags, Segment};
use crate::transport::{
    AckEvent, ConnectionConfig, ConnectionMetrics, ConnectionState, MetricsSnapshot,
    RenoController, RttEstimator, SendWindow, DUP_ACK_THRESHOLD, MAX_RTO, PAYLOAD_SIZE,
};

/// Scratch buffer size for inbound datagrams.
const RECV_BUF: usize = 65536;

/// What woke the event loop.
enum Wake {
    Datagram(usize),
    Timer,
}

/// A connected RUDP client.
///
/// Created by [`Client::connect`], which completes the handshake before
/// returning. `send_bytes` returns once every byte has been acknowledged;
/// `close` runs the FIN exchange.
pub struct Client {
    socket: UdpSocket,
    peer: SocketAddr,
    config: ConnectionConfig,
    state: ConnectionState,
    envelope: Envelope,
    window: SendWindow,
    cc: RenoController,
    rtt: RttEstimator,
    /// Next expected sequence from the peer (`ISN_s + 1`; the server
    /// originates no stream data).
    rcv_nxt: u32,
    metrics: Arc<ConnectionMetrics>,
    buf: Vec<u8>,
}

impl Client {
    /// Connect to a server, performing the three-way handshake.
    ///
    /// The SYN carries fresh key material when encryption is enabled and
    /// is retransmitted at the current RTO, doubling per attempt. Fails
    /// with [`Error::Handshake`] once the retry budget is spent.
    pub async fn connect(host: &str, port: u16, config: ConnectionConfig) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;
        let peer = socket.peer_addr()?;

        let metrics = Arc::new(ConnectionMetrics::new());
        // ISNs are drawn from the full sequence space, so the window
        // machinery runs on wrapping arithmetic from the first byte.
        let isn = OsRng.next_u32();

        let (envelope, syn_payload) = if config.use_crypto {
            let material = SessionKey::generate_material();
            let key = SessionKey::from_material(&material)?;
            (Envelope::sealed(key), Bytes::copy_from_slice(&material))
        } else {
            (Envelope::plaintext(), Bytes::new())
        };

        let deadline = config.op_timeout.map(|t| Instant::now() + t);
        let syn = Segment::syn(isn, syn_payload).encode();
        let mut rto = config.initial_rto;
        let mut buf = vec![0u8; RECV_BUF];

        'attempt: for attempt in 1..=config.max_retries {
            socket.send(&syn).await?;
            metrics.add_segment_sent();
            if attempt == 1 {
                tracing::debug!(seq = isn, %peer, "SYN sent");
            } else {
                metrics.add_retransmission();
                tracing::debug!(seq = isn, attempt, "SYN retransmitted");
            }

            let retry_at = Instant::now() + rto;
            loop {
                let wake = earliest(retry_at, deadline);
                let event = tokio::select! {
                    r = socket.recv(&mut buf) => Wake::Datagram(r?),
                    _ = sleep_until(wake.into()) => Wake::Timer,
                };

                if expired(deadline) {
                    tracing::warn!(%peer, "connect deadline expired");
                    return Err(Error::Cancelled);
                }

                let n = match event {
                    Wake::Datagram(n) => n,
                    Wake::Timer => {
                        metrics.add_timeout();
                        rto = (rto * 2).min(MAX_RTO);
                        continue 'attempt;
                    }
                };

                let seg = match Segment::decode(&buf[..n]) {
                    Ok(seg) => seg,
                    Err(_) => {
                        metrics.add_invalid_segment();
                        continue;
                    }
                };
                metrics.add_segment_received();

                if seg.is(flags::SYN | flags::ACK) && seg.ack == isn.wrapping_add(1) {
                    let snd_nxt = isn.wrapping_add(1);
                    let rcv_nxt = seg.seq.wrapping_add(1);

                    let ack = Segment::ack(snd_nxt, rcv_nxt, config.rwnd_max);
                    socket.send(&ack.encode()).await?;
                    metrics.add_segment_sent();

                    tracing::info!(
                        %peer,
                        isn,
                        peer_isn = seg.seq,
                        rwnd = seg.rwnd,
                        crypto = envelope.is_sealed(),
                        "connection established"
                    );

                    let window = SendWindow::new(snd_nxt, seg.rwnd, PAYLOAD_SIZE);
                    let cc = RenoController::new(config.cc_enabled);
                    let rtt = RttEstimator::new(config.initial_rto);

                    return Ok(Self {
                        socket,
                        peer,
                        state: ConnectionState::Established,
                        envelope,
                        window,
                        cc,
                        rtt,
                        rcv_nxt,
                        metrics,
                        buf,
                        config,
                    });
                }
                // Anything else is a stray; keep waiting for the SYN-ACK.
            }
        }

        tracing::warn!(%peer, attempts = config.max_retries, "handshake failed");
        Err(Error::Handshake {
            attempts: config.max_retries,
        })
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Snapshot of this connection's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Deliver a byte stream reliably and in order.
    ///
    /// Returns once every byte has been cumulatively acknowledged. Fails
    /// with [`Error::PeerUnreachable`] when a segment exhausts its retry
    /// budget, or [`Error::Cancelled`] on deadline expiry.
    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Err(Error::NotConnected(self.state.label()));
        }

        self.window.enqueue(data);
        let deadline = self.config.op_timeout.map(|t| Instant::now() + t);
        // The single retransmission timer covering snd_una, restarted on
        // every cumulative advance and on every retransmission.
        let mut rtx_deadline: Option<Instant> = None;
        let mut next_probe: Option<Instant> = None;

        loop {
            // Inject new segments up to min(cwnd, peer_rwnd).
            let allowance = self.cc.window(self.window.peer_rwnd());
            for (seq, payload) in self.window.next_burst(allowance, Instant::now()) {
                self.transmit_data(seq, payload).await?;
            }

            if self.window.is_fully_acked() {
                return Ok(());
            }

            if self.window.outstanding() > 0 {
                if rtx_deadline.is_none() {
                    rtx_deadline = Some(Instant::now() + self.rtt.rto());
                }
            } else {
                rtx_deadline = None;
            }

            // Zero-window probing: nothing in flight, data waiting, and
            // the peer has closed its window.
            let probing = self.window.outstanding() == 0
                && self.window.has_pending()
                && self.window.peer_rwnd() == 0;
            if probing {
                if next_probe.is_none() {
                    self.send_probe().await?;
                    next_probe = Some(Instant::now() + self.rtt.rto());
                }
            } else {
                next_probe = None;
            }

            let timer = rtx_deadline
                .or(next_probe)
                .expect("in-flight data or an armed probe implies a timer");

            let wake = earliest(timer, deadline);
            let event = tokio::select! {
                r = self.socket.recv(&mut self.buf) => Wake::Datagram(r?),
                _ = sleep_until(wake.into()) => Wake::Timer,
            };

            if expired(deadline) {
                self.state = ConnectionState::Closed;
                tracing::warn!(peer = %self.peer, "send deadline expired");
                return Err(Error::Cancelled);
            }

            match event {
                Wake::Datagram(n) => match self.handle_inbound(n).await? {
                    Some(AckEvent::Advanced { .. }) => {
                        rtx_deadline = (self.window.outstanding() > 0)
                            .then(|| Instant::now() + self.rtt.rto());
                    }
                    Some(AckEvent::Duplicate { count }) if count == DUP_ACK_THRESHOLD => {
                        // Fast retransmit just went out; give it a full RTO.
                        rtx_deadline = Some(Instant::now() + self.rtt.rto());
                    }
                    _ => {}
                },
                Wake::Timer => {
                    if self.window.outstanding() > 0 {
                        self.on_retransmission_timeout().await?;
                        rtx_deadline = Some(Instant::now() + self.rtt.rto());
                    } else if probing {
                        self.send_probe().await?;
                        next_probe = Some(Instant::now() + self.rtt.rto());
                    }
                }
            }
        }
    }

    /// Close the connection with a FIN exchange.
    ///
    /// The FIN occupies one sequence slot and, like data, its (empty)
    /// payload is sealed when encryption is on. Fails with
    /// [`Error::Shutdown`] if the peer never acknowledges.
    pub async fn close(&mut self) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Err(Error::NotConnected(self.state.label()));
        }

        let fin_seq = self.window.snd_nxt();
        let expected_ack = fin_seq.wrapping_add(1);
        let fin = Segment::fin(fin_seq, self.rcv_nxt, Bytes::from(self.envelope.seal(&[])));
        let encoded = fin.encode();

        let deadline = self.config.op_timeout.map(|t| Instant::now() + t);
        let mut rto = self.rtt.rto();
        self.state = ConnectionState::FinSent;

        'attempt: for attempt in 1..=self.config.max_retries {
            self.socket.send(&encoded).await?;
            self.metrics.add_segment_sent();
            if attempt == 1 {
                tracing::debug!(seq = fin_seq, "FIN sent");
            } else {
                self.metrics.add_retransmission();
                tracing::debug!(seq = fin_seq, attempt, "FIN retransmitted");
            }

            let retry_at = Instant::now() + rto;
            loop {
                let wake = earliest(retry_at, deadline);
                let event = tokio::select! {
                    r = self.socket.recv(&mut self.buf) => Wake::Datagram(r?),
                    _ = sleep_until(wake.into()) => Wake::Timer,
                };

                if expired(deadline) {
                    self.state = ConnectionState::Closed;
                    return Err(Error::Cancelled);
                }

                let n = match event {
                    Wake::Datagram(n) => n,
                    Wake::Timer => {
                        self.metrics.add_timeout();
                        rto = (rto * 2).min(MAX_RTO);
                        continue 'attempt;
                    }
                };

                let seg = match Segment::decode(&self.buf[..n]) {
                    Ok(seg) => seg,
                    Err(_) => {
                        self.metrics.add_invalid_segment();
                        continue;
                    }
                };
                self.metrics.add_segment_received();

                if seg.is(flags::ACK) && seg.ack == expected_ack {
                    self.state = ConnectionState::Closed;
                    tracing::info!(peer = %self.peer, "connection closed");
                    return Ok(());
                }
                // Stale data ACKs may still trickle in; keep waiting.
            }
        }

        self.state = ConnectionState::Closed;
        tracing::warn!(peer = %self.peer, "FIN never acknowledged; forcing close");
        Err(Error::Shutdown {
            attempts: self.config.max_retries,
        })
    }

    /// Seal and transmit one data segment.
    async fn transmit_data(&mut self, seq: u32, payload: Bytes) -> Result<()> {
        let wire = Bytes::from(self.envelope.seal(&payload));
        let seg = Segment::data(seq, self.rcv_nxt, self.config.rwnd_max, wire);
        self.socket.send(&seg.encode()).await?;
        self.metrics.add_segment_sent();
        tracing::trace!(seq, len = payload.len(), "DATA sent");
        Ok(())
    }

    /// Transmit a zero-length window probe at `snd_nxt`.
    async fn send_probe(&mut self) -> Result<()> {
        let wire = Bytes::from(self.envelope.seal(&[]));
        let seg = Segment::data(
            self.window.snd_nxt(),
            self.rcv_nxt,
            self.config.rwnd_max,
            wire,
        );
        self.socket.send(&seg.encode()).await?;
        self.metrics.add_segment_sent();
        tracing::debug!(seq = self.window.snd_nxt(), "zero-window probe sent");
        Ok(())
    }

    /// Process one inbound datagram during the send loop. Returns the ACK
    /// event, if the datagram carried one, so the caller can manage the
    /// retransmission timer.
    async fn handle_inbound(&mut self, n: usize) -> Result<Option<AckEvent>> {
        let seg = match Segment::decode(&self.buf[..n]) {
            Ok(seg) => seg,
            Err(_) => {
                self.metrics.add_invalid_segment();
                return Ok(None);
            }
        };
        self.metrics.add_segment_received();

        // A retransmitted SYN-ACK means our final handshake ACK was lost.
        if seg.is(flags::SYN | flags::ACK) {
            let ack = Segment::ack(self.window.snd_una(), self.rcv_nxt, self.config.rwnd_max);
            self.socket.send(&ack.encode()).await?;
            self.metrics.add_segment_sent();
            return Ok(None);
        }

        if !seg.is(flags::ACK) {
            return Ok(None);
        }

        self.window.set_peer_rwnd(seg.rwnd);

        let event = self.window.on_ack(seg.ack, Instant::now());
        match event {
            AckEvent::Advanced { freed, rtt_sample } => {
                if let Some(sample) = rtt_sample {
                    self.rtt.on_sample(sample);
                }
                self.cc.on_new_ack();
                tracing::trace!(
                    ack = seg.ack,
                    freed,
                    cwnd = self.cc.cwnd_segments(),
                    rwnd = seg.rwnd,
                    "ACK advanced window"
                );
            }
            AckEvent::Duplicate { count } => {
                self.metrics.add_duplicate_ack();
                if count == DUP_ACK_THRESHOLD {
                    tracing::debug!(
                        seq = self.window.snd_una(),
                        "triple duplicate ACK, fast retransmit"
                    );
                    self.cc.on_fast_retransmit();
                    self.retransmit_oldest().await?;
                }
            }
            AckEvent::Stale => {}
        }

        Ok(Some(event))
    }

    /// The retransmission timer for `snd_una` expired.
    async fn on_retransmission_timeout(&mut self) -> Result<()> {
        self.metrics.add_timeout();
        self.rtt.on_backoff();
        self.cc.on_timeout();
        tracing::debug!(
            seq = self.window.snd_una(),
            rto_ms = self.rtt.rto().as_millis() as u64,
            "retransmission timeout"
        );
        self.retransmit_oldest().await
    }

    /// Retransmit the oldest unacknowledged segment, aborting the
    /// connection once its retry budget is spent.
    async fn retransmit_oldest(&mut self) -> Result<()> {
        let Some((seq, payload, retries)) = self.window.retransmit_oldest(Instant::now()) else {
            return Ok(());
        };

        if retries > self.config.max_retries {
            self.state = ConnectionState::Closed;
            tracing::warn!(seq, retries, "retry budget exhausted, peer unreachable");
            return Err(Error::PeerUnreachable { seq, retries });
        }

        self.metrics.add_retransmission();
        self.transmit_data(seq, payload).await
    }
}

/// The earlier of a timer deadline and an optional operation deadline.
fn earliest(timer: Instant, deadline: Option<Instant>) -> Instant {
    match deadline {
        Some(d) => timer.min(d),
        None => timer,
    }
}

/// Whether the operation deadline has passed.
fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
