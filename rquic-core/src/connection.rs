//! The top-level connection state machine (spec.md Section 4.6)
//!
//! Composes the TLS driver, per-epoch crypto keys, connection IDs, streams,
//! loss recovery, and network paths the way `nssl::connection::SslConnection`
//! composes handshake/record/session state, minus its C-ABI surface. Entirely
//! sans-I/O: `receive_datagram` pushes bytes in, `datagrams_to_send` pulls
//! datagrams out, and `handle_timer`/`get_timer` drive time externally.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::warn;
use rand::RngCore;

use crate::buffer::Reader;
use crate::builder::{DatagramBuilder, MAX_DATAGRAM_LEN, MIN_INITIAL_DATAGRAM_LEN};
use crate::cid::{CidManager, ConnectionId};
use crate::config::{Config, Event, TransportParams};
use crate::crypto::pair::{CryptoContext, CryptoPair, Epoch, Side};
use crate::error::{Error, Misuse, Result, TransportError, TransportErrorDetail};
use crate::frame::{self, AckRange, Frame, NewConnectionIdFrame, StreamFrame};
use crate::packet::{self, DecodedLongHeader, LongPacketType, RetryPacket, VersionNegotiationPacket};
use crate::path::NetworkPath;
use crate::recovery::{self, Recovery, SentFrame, SentPacket};
use crate::stream::{self, RecvBuffer, SendBuffer, Stream, StreamIdAllocator};
use crate::tls::{Driver, KeyDirection, TlsConfig, TlsEvent};
use crate::tp;

/// Length used for CIDs this endpoint issues itself.
const HOST_CID_LEN: usize = 8;
/// How many additional connection IDs to hand the peer once the handshake
/// completes, beyond the one used during the handshake (spec.md Section 8).
const EXTRA_CIDS_ON_HANDSHAKE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshaking,
    Connected,
    Closing,
    Draining,
    Closed,
}

#[derive(Clone)]
struct LocalClose {
    error_code: u64,
    frame_type: Option<u64>,
    reason: String,
}

/// A single QUIC connection: client or server side, driven entirely by
/// `receive_datagram`/`datagrams_to_send`/`handle_timer`.
pub struct Connection {
    config: Config,
    is_client: bool,
    version: u32,

    tls: Driver,
    crypto: CryptoPair,
    pending_secrets: HashMap<Epoch, (Option<Vec<u8>>, Option<Vec<u8>>)>,
    handshake_confirmed: bool,
    key_phase: bool,
    key_update_requested: bool,

    cids: CidManager,
    scid: ConnectionId,
    dcid: ConnectionId,
    original_dcid: ConnectionId,
    token: Vec<u8>,

    streams: HashMap<u64, Stream>,
    stream_alloc: StreamIdAllocator,
    local_max_data: u64,
    peer_max_data: u64,

    local_transport_params: TransportParams,
    peer_transport_params: Option<TransportParams>,

    crypto_send: [SendBuffer; 4],
    crypto_recv: [RecvBuffer; 4],

    recovery: Recovery,
    paths: Vec<NetworkPath>,
    active_path: usize,

    events: VecDeque<Event>,

    state: State,
    local_close: Option<LocalClose>,
    idle_timeout: Duration,
    last_activity: Instant,
    draining_deadline: Option<Instant>,

    pending_version_negotiation: Option<(ConnectionId, ConnectionId)>,
    pending_max_data: bool,
    pending_max_streams_bidi: bool,
    pending_max_streams_uni: bool,
    pending_max_stream_data: Vec<u64>,
    pending_new_cids: Vec<u64>,
    pending_retire_cids: Vec<u64>,
    pending_ping: Vec<u64>,
    pending_handshake_done: bool,
    pending_path_challenge: Option<(usize, [u8; 8])>,
    pending_path_response: Option<[u8; 8]>,
}

impl Connection {
    /// Begins a client-side connection to `peer_addr`, queuing the initial
    /// ClientHello for the next `datagrams_to_send` call.
    pub fn connect(config: Config, peer_addr: SocketAddr, now: Instant) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let provider = config.crypto_provider.clone();
        let version = config.supported_versions.first().copied().unwrap_or(crate::config::VERSION_DRAFT_20);

        let mut cids = CidManager::new();
        let scid = cids.issue_host_cid(&mut rng, HOST_CID_LEN).cid;
        let original_dcid = ConnectionId::random(&mut rng, HOST_CID_LEN);

        let own_tp = tp::encode(&config.transport, &scid);
        let tls_config = tls_config_from(&config);
        let tls = Driver::new_client(provider.clone(), tls_config, own_tp)?;

        let mut conn = Self::new_shared(config, true, version, scid, original_dcid, cids, tls, peer_addr, now);
        let initial_ctx = CryptoContext::initial(provider.as_ref(), Side::Client, original_dcid.as_slice());
        conn.crypto.set(Epoch::Initial, initial_ctx);
        conn.drain_tls_outbound();
        // Installs the 0-RTT key synchronously if `send_client_hello` queued
        // one, so an optimistic PSK attempt is ready before the first
        // `datagrams_to_send()` call rather than only after a round trip.
        conn.process_tls_events(now);
        Ok(conn)
    }

    /// Begins a server-side connection expecting the client's first Initial
    /// datagram from `peer_addr`.
    pub fn accept(config: Config, peer_addr: SocketAddr, now: Instant) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let provider = config.crypto_provider.clone();
        let version = config.supported_versions.first().copied().unwrap_or(crate::config::VERSION_DRAFT_20);

        let mut cids = CidManager::new();
        let scid = cids.issue_host_cid(&mut rng, HOST_CID_LEN).cid;

        let own_tp = tp::encode(&config.transport, &scid);
        let tls_config = tls_config_from(&config);
        let tls = Driver::new_server(provider, tls_config, own_tp);

        Ok(Self::new_shared(config, false, version, scid, ConnectionId::empty(), cids, tls, peer_addr, now))
    }

    #[allow(clippy::too_many_arguments)]
    fn new_shared(
        config: Config,
        is_client: bool,
        version: u32,
        scid: ConnectionId,
        dcid: ConnectionId,
        cids: CidManager,
        tls: Driver,
        peer_addr: SocketAddr,
        now: Instant,
    ) -> Self {
        let idle_timeout = Duration::from_millis(config.transport.idle_timeout_ms);
        let local_transport_params = config.transport;
        let local_max_data = local_transport_params.initial_max_data;
        Self {
            is_client,
            version,
            tls,
            crypto: CryptoPair::new(),
            pending_secrets: HashMap::new(),
            handshake_confirmed: false,
            key_phase: false,
            key_update_requested: false,
            cids,
            scid,
            dcid,
            original_dcid: dcid,
            token: Vec::new(),
            streams: HashMap::new(),
            stream_alloc: StreamIdAllocator::new(is_client),
            local_max_data,
            peer_max_data: 0,
            local_transport_params,
            peer_transport_params: None,
            crypto_send: [
                SendBuffer::new(u64::MAX),
                SendBuffer::new(u64::MAX),
                SendBuffer::new(u64::MAX),
                SendBuffer::new(u64::MAX),
            ],
            crypto_recv: [
                RecvBuffer::new(u64::MAX),
                RecvBuffer::new(u64::MAX),
                RecvBuffer::new(u64::MAX),
                RecvBuffer::new(u64::MAX),
            ],
            recovery: Recovery::new(),
            paths: vec![NetworkPath::new_validated(peer_addr)],
            active_path: 0,
            events: VecDeque::new(),
            state: State::Handshaking,
            local_close: None,
            idle_timeout,
            last_activity: now,
            draining_deadline: None,
            pending_version_negotiation: None,
            pending_max_data: false,
            pending_max_streams_bidi: false,
            pending_max_streams_uni: false,
            pending_max_stream_data: Vec::new(),
            pending_new_cids: Vec::new(),
            pending_retire_cids: Vec::new(),
            pending_ping: Vec::new(),
            pending_handshake_done: false,
            pending_path_challenge: None,
            pending_path_response: None,
            config,
        }
    }

    /// Next externally-visible event, if any are queued.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Allocates the next stream ID of the requested directionality for
    /// this endpoint, per the draft-19/20 stream ID numbering scheme.
    pub fn get_next_available_stream_id(&mut self, is_unidirectional: bool) -> u64 {
        self.stream_alloc.next(is_unidirectional)
    }

    /// Queues `data` on `stream_id`, creating the stream if this endpoint
    /// is its initiator and it has not been opened yet.
    pub fn send_stream_data(&mut self, stream_id: u64, data: &[u8], end_stream: bool) -> Result<()> {
        if self.local_close.is_some() {
            return Err(Misuse::ConnectionClosed.into());
        }
        stream::check_send_direction(self.is_client, stream_id).map_err(Error::from)?;
        if !self.streams.contains_key(&stream_id) {
            if !stream::is_local(self.is_client, stream_id) {
                return Err(Misuse::UnknownStream.into());
            }
            self.create_local_stream(stream_id);
        }
        let s = self.streams.get_mut(&stream_id).expect("just ensured present");
        let send = s.send.as_mut().ok_or(Misuse::StreamReceiveOnly)?;
        send.write(data, end_stream).map_err(Error::from)
    }

    /// Queues a PING frame carrying `uid`; `PingAcknowledged(uid)` fires
    /// once the packet it rides in is acknowledged.
    pub fn send_ping(&mut self, uid: u64) {
        self.pending_ping.push(uid);
    }

    /// Queues a CONNECTION_CLOSE and moves the connection into the closing
    /// state. Idempotent: later calls are ignored once a close is pending.
    pub fn close(&mut self, error_code: u64, frame_type: Option<u64>, reason: &str) {
        if self.local_close.is_some() {
            return;
        }
        self.local_close = Some(LocalClose {
            error_code,
            frame_type,
            reason: reason.to_string(),
        });
        if self.state == State::Handshaking || self.state == State::Connected {
            self.state = State::Closing;
        }
    }

    /// Retires the currently active peer connection ID and activates the
    /// next spare one, returning an error if the peer has not issued a
    /// spare ID yet.
    pub fn change_connection_id(&mut self) -> Result<()> {
        let old_seq = self.cids.rotate_peer_cid().ok_or(Misuse::NoSpareConnectionId)?;
        self.pending_retire_cids.push(old_seq);
        if let Some(active) = self.cids.active_peer_cid() {
            self.dcid = active.cid;
        }
        Ok(())
    }

    /// Requests a 1-RTT key update on the next datagram built. Only valid
    /// once the handshake has been confirmed.
    pub fn request_key_update(&mut self) -> Result<()> {
        if !self.handshake_confirmed {
            return Err(Misuse::HandshakeNotConfirmed.into());
        }
        self.key_update_requested = true;
        Ok(())
    }

    /// Earliest instant `handle_timer` should next be called.
    pub fn get_timer(&self) -> Option<Instant> {
        let mut deadlines = Vec::new();
        for epoch in [Epoch::Initial, Epoch::Handshake, Epoch::ZeroRtt, Epoch::OneRtt] {
            if let Some(t) = self.recovery.space(epoch).ack_timer() {
                deadlines.push(t);
            }
        }
        if let Some(t) = self.recovery.earliest_loss_time() {
            deadlines.push(t);
        }
        if let Some(t) = self
            .recovery
            .pto_deadline(Duration::from_millis(self.local_transport_params.max_ack_delay_ms))
        {
            deadlines.push(t);
        }
        if self.state != State::Closed {
            deadlines.push(self.last_activity + self.idle_timeout);
        }
        if let Some(t) = self.draining_deadline {
            deadlines.push(t);
        }
        deadlines.into_iter().min()
    }

    /// Drives time-based transitions: idle timeout, draining expiry, loss
    /// detection, and PTO probes.
    pub fn handle_timer(&mut self, now: Instant) {
        if self.state == State::Closed {
            return;
        }
        if now.duration_since(self.last_activity) >= self.idle_timeout {
            self.terminate(TransportError::NoError, None, "idle timeout");
            return;
        }
        if let Some(deadline) = self.draining_deadline {
            if now >= deadline {
                // A peer-initiated close already pushed `ConnectionTerminated`
                // from `on_connection_close` when it entered `Draining`. A
                // self-initiated `close()` only reached `Closing`, so this is
                // the first and only place that side learns the drain timer
                // expired; emit the event here, mirroring `on_connection_close`.
                if self.state == State::Closing {
                    if let Some(close) = self.local_close.clone() {
                        let code = if close.frame_type.is_none() {
                            TransportError::ApplicationError
                        } else {
                            TransportError::from_u64(close.error_code)
                        };
                        self.events.push_back(Event::ConnectionTerminated {
                            error_code: code,
                            frame_type: close.frame_type,
                            reason: close.reason,
                        });
                    }
                }
                self.state = State::Closed;
                return;
            }
        }
        if let Some(loss_time) = self.recovery.earliest_loss_time() {
            if now >= loss_time {
                self.on_loss_detected(now);
            }
        }
        if let Some(pto) = self
            .recovery
            .pto_deadline(Duration::from_millis(self.local_transport_params.max_ack_delay_ms))
        {
            if now >= pto {
                self.recovery.pto_count += 1;
                self.pending_ping.push(0);
            }
        }
    }

    /// Parses and processes one received datagram, which may contain
    /// several coalesced long-header packets followed by at most one
    /// short-header packet.
    pub fn receive_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> Result<()> {
        self.last_activity = now;
        let path_idx = self.path_for(from, now);
        self.paths[path_idx].on_received(data.len());

        let mut remaining = data;
        while !remaining.is_empty() {
            if !packet::peek_is_long_header(remaining)? {
                if let Err(e) = self.process_short_packet(remaining, path_idx, now) {
                    self.fail(e);
                }
                break;
            }
            if remaining.len() < 5 {
                return Err(Error::Malformed("short long-header prefix"));
            }
            let version = u32::from_be_bytes([remaining[1], remaining[2], remaining[3], remaining[4]]);
            if version == 0 {
                if let Err(e) = self.handle_version_negotiation(remaining, now) {
                    self.fail(e);
                }
                break;
            }
            let packet_type = packet::peek_long_packet_type(remaining)?;
            if packet_type == LongPacketType::Retry {
                if let Err(e) = self.handle_retry(remaining) {
                    self.fail(e);
                }
                break;
            }
            match self.process_long_packet(remaining, path_idx, now) {
                Ok(consumed) => remaining = &remaining[consumed..],
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Builds as many datagrams as the congestion window, anti-amplification
    /// budget, and pending work allow.
    pub fn datagrams_to_send(&mut self, now: Instant) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut out = Vec::new();

        if let Some((dcid, scid)) = self.pending_version_negotiation.take() {
            let vn = VersionNegotiationPacket {
                dcid,
                scid,
                supported_versions: self.config.supported_versions.clone(),
            };
            let addr = self.paths[self.active_path].addr;
            out.push((vn.encode(), addr));
            return out;
        }

        if self.key_update_requested {
            self.perform_key_update();
        }

        if let Some((path_idx, challenge)) = self.pending_path_challenge {
            if let Some(datagram) = self.build_path_challenge_datagram(path_idx, challenge, now) {
                let addr = self.paths[path_idx].addr;
                self.paths[path_idx].on_sent(datagram.len());
                out.push((datagram, addr));
                self.pending_path_challenge = None;
            }
        }

        loop {
            if out.len() >= 32 {
                break;
            }
            let addr = self.paths[self.active_path].addr;
            let amp_budget = self.paths[self.active_path].amplification_budget();
            if amp_budget == 0 {
                break;
            }
            let in_flight = self.recovery.total_bytes_in_flight();
            let cwnd = self.recovery.congestion.cwnd();
            let probing = self.recovery.pto_count > 0 || !self.pending_ping.is_empty();
            if in_flight >= cwnd && !probing {
                break;
            }

            let datagram_cap = (MAX_DATAGRAM_LEN as u64).min(amp_budget) as usize;
            let mut builder = DatagramBuilder::new();
            let mut wrote_any = false;
            let mut is_initial = false;

            for epoch in [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::OneRtt] {
                if epoch == Epoch::ZeroRtt && !self.is_client {
                    // A server never sends 0-RTT packets; it only ever
                    // decrypts them (its `zero_rtt` context exists solely to
                    // hold the receive-direction key installed by the TLS
                    // driver's PSK acceptance path).
                    continue;
                }
                let Some(ctx) = self.crypto.get(epoch).cloned() else {
                    continue;
                };
                let remaining = builder.remaining(datagram_cap);
                if remaining < 32 {
                    break;
                }
                let items = self.build_frames(epoch, now, remaining.saturating_sub(24));
                if items.is_empty() {
                    continue;
                }
                let frames: Vec<Frame> = items.iter().map(|(f, _)| f.clone()).collect();
                let ack_eliciting = items.iter().any(|(f, _)| !matches!(f, Frame::Padding | Frame::Ack { .. }));
                let sent_frames: Vec<SentFrame> = items.into_iter().map(|(_, s)| s).collect();

                let pn_space = self.recovery.space_mut(epoch);
                let pn = pn_space.next_packet_number();
                let largest_acked = pn_space.largest_acked_by_peer();
                let size_before = builder.len();

                let built = if epoch == Epoch::OneRtt {
                    builder.push_short_packet(
                        self.config.crypto_provider.as_ref(),
                        &ctx,
                        &self.dcid,
                        false,
                        self.key_phase,
                        pn,
                        largest_acked,
                        &frames,
                    )
                } else {
                    let packet_type = match epoch {
                        Epoch::Initial => LongPacketType::Initial,
                        Epoch::ZeroRtt => LongPacketType::ZeroRtt,
                        _ => LongPacketType::Handshake,
                    };
                    is_initial |= epoch == Epoch::Initial;
                    let token: &[u8] = if epoch == Epoch::Initial { &self.token } else { &[] };
                    builder.push_long_packet(
                        self.config.crypto_provider.as_ref(),
                        &ctx,
                        packet_type,
                        self.version,
                        &self.dcid,
                        &self.scid,
                        token,
                        pn,
                        largest_acked,
                        &frames,
                    )
                };
                if built.is_err() {
                    continue;
                }
                let size = builder.len() - size_before;
                self.recovery.space_mut(epoch).on_packet_sent(SentPacket {
                    packet_number: pn,
                    time_sent: now,
                    ack_eliciting,
                    in_flight: true,
                    size,
                    frames: sent_frames,
                });
                wrote_any = true;
            }

            if !wrote_any {
                break;
            }
            if is_initial && self.is_client {
                builder.pad_to(MIN_INITIAL_DATAGRAM_LEN);
            }
            let datagram = builder.take();
            self.paths[self.active_path].on_sent(datagram.len());
            out.push((datagram, addr));
        }
        out
    }

    // --- construction helpers -------------------------------------------------

    fn create_local_stream(&mut self, id: u64) {
        let bidi = stream::directionality(id) == stream::Directionality::Bidi;
        let recv_limit = if bidi {
            self.local_transport_params.initial_max_stream_data_bidi_local
        } else {
            0
        };
        let send_limit = if bidi {
            self.peer_transport_params
                .as_ref()
                .map(|p| p.initial_max_stream_data_bidi_local)
                .unwrap_or(self.local_transport_params.initial_max_stream_data_bidi_local)
        } else {
            self.peer_transport_params
                .as_ref()
                .map(|p| p.initial_max_stream_data_uni)
                .unwrap_or(self.local_transport_params.initial_max_stream_data_uni)
        };
        self.streams.insert(id, Stream::new(id, self.is_client, recv_limit, send_limit));
    }

    fn ensure_remote_stream(&mut self, id: u64) -> Result<()> {
        if self.streams.contains_key(&id) {
            return Ok(());
        }
        if stream::is_local(self.is_client, id) {
            return Err(Misuse::UnknownStream.into());
        }
        let bidi = stream::directionality(id) == stream::Directionality::Bidi;
        let recv_limit = if bidi {
            self.local_transport_params.initial_max_stream_data_bidi_remote
        } else {
            self.local_transport_params.initial_max_stream_data_uni
        };
        let send_limit = if bidi {
            self.peer_transport_params
                .as_ref()
                .map(|p| p.initial_max_stream_data_bidi_remote)
                .unwrap_or(0)
        } else {
            0
        };
        self.streams.insert(id, Stream::new(id, self.is_client, recv_limit, send_limit));
        Ok(())
    }

    // --- receive path ----------------------------------------------------------

    fn path_for(&mut self, addr: SocketAddr, _now: Instant) -> usize {
        if let Some(idx) = self.paths.iter().position(|p| p.addr == addr) {
            return idx;
        }
        let mut path = NetworkPath::new(addr);
        let challenge = path.start_challenge(&mut rand::thread_rng());
        self.paths.push(path);
        let new_idx = self.paths.len() - 1;
        self.pending_path_challenge = Some((new_idx, challenge));
        new_idx
    }

    fn process_short_packet(&mut self, data: &[u8], path_idx: usize, now: Instant) -> Result<()> {
        let mut r = Reader::new(data);
        let decoded = packet::decode_short_header(&mut r, self.scid.len())?;
        let Some(ctx) = self.crypto.get(Epoch::OneRtt).cloned() else {
            return Ok(());
        };
        let mut buf = data.to_vec();
        let largest_pn = self.recovery.space(Epoch::OneRtt).largest_received_pn().unwrap_or(0);
        let (pn, plaintext) = match crate::crypto::pair::decrypt_packet(
            self.config.crypto_provider.as_ref(),
            &ctx.remote.keys,
            &mut buf,
            decoded.pn_offset,
            false,
            largest_pn,
        ) {
            Ok(v) => v,
            Err(_) => {
                warn!("dropping undecryptable 1-RTT packet");
                return Ok(());
            }
        };
        if self.recovery.space(Epoch::OneRtt).already_received(pn) {
            return Ok(());
        }
        self.dispatch_payload(Epoch::OneRtt, pn, &plaintext, path_idx, now)
    }

    fn process_long_packet(&mut self, data: &[u8], path_idx: usize, now: Instant) -> Result<usize> {
        let mut r = Reader::new(data);
        let decoded = packet::decode_long_header(&mut r)?;
        let total = decoded.pn_offset + decoded.payload_len;
        if data.len() < total {
            return Err(Error::Malformed("coalesced packet length exceeds datagram"));
        }
        let Some(epoch) = decoded.packet_type.epoch() else {
            return Ok(total);
        };

        if !self.is_client && epoch == Epoch::Initial && self.crypto.get(Epoch::Initial).is_none() {
            if !self.config.supported_versions.contains(&decoded.version) {
                self.pending_version_negotiation = Some((decoded.scid, decoded.dcid));
                return Ok(total);
            }
            self.on_first_client_initial(&decoded);
        }

        let Some(ctx) = self.crypto.get(epoch).cloned() else {
            return Ok(total);
        };
        let mut buf = data[..total].to_vec();
        let largest_pn = self.recovery.space(epoch).largest_received_pn().unwrap_or(0);
        let (pn, plaintext) = match crate::crypto::pair::decrypt_packet(
            self.config.crypto_provider.as_ref(),
            &ctx.remote.keys,
            &mut buf,
            decoded.pn_offset,
            true,
            largest_pn,
        ) {
            Ok(v) => v,
            Err(_) => {
                warn!("dropping undecryptable packet in epoch {epoch:?}");
                return Ok(total);
            }
        };
        if self.recovery.space(epoch).already_received(pn) {
            return Ok(total);
        }
        if self.is_client && epoch == Epoch::Initial && self.dcid != decoded.scid {
            self.dcid = decoded.scid;
        }
        self.dispatch_payload(epoch, pn, &plaintext, path_idx, now)?;
        Ok(total)
    }

    fn on_first_client_initial(&mut self, decoded: &DecodedLongHeader) {
        self.dcid = decoded.scid;
        self.original_dcid = decoded.dcid;
        let ctx = CryptoContext::initial(self.config.crypto_provider.as_ref(), Side::Server, decoded.dcid.as_slice());
        self.crypto.set(Epoch::Initial, ctx);
    }

    fn handle_version_negotiation(&mut self, data: &[u8], _now: Instant) -> Result<()> {
        if !self.is_client || self.state != State::Handshaking {
            return Ok(());
        }
        let vn = VersionNegotiationPacket::decode(data)?;
        let common = self
            .config
            .supported_versions
            .iter()
            .find(|v| vn.supported_versions.contains(v))
            .copied();
        match common {
            Some(v) if v != self.version => {
                self.version = v;
                self.crypto_send[recovery::epoch_index(Epoch::Initial)].retransmit(0);
                self.recovery.space_mut(Epoch::Initial).reset();
            }
            _ => self.terminate(
                TransportError::InternalError,
                None,
                "Could not find a common protocol version",
            ),
        }
        Ok(())
    }

    fn handle_retry(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_client || self.state != State::Handshaking {
            return Ok(());
        }
        let retry = RetryPacket::decode(self.config.crypto_provider.as_ref(), data, &self.original_dcid)?;
        self.dcid = retry.scid;
        self.token = retry.retry_token;
        let ctx = CryptoContext::initial(self.config.crypto_provider.as_ref(), Side::Client, retry.scid.as_slice());
        self.crypto.set(Epoch::Initial, ctx);
        self.crypto_send[recovery::epoch_index(Epoch::Initial)].retransmit(0);
        self.recovery.space_mut(Epoch::Initial).reset();
        Ok(())
    }

    fn dispatch_payload(&mut self, epoch: Epoch, pn: u64, plaintext: &[u8], path_idx: usize, now: Instant) -> Result<()> {
        let mut r = Reader::new(plaintext);
        let mut ack_eliciting = false;
        let mut frames = Vec::new();
        while !r.is_empty() {
            if frame::is_unknown_frame_type(&mut r)? {
                return Err(TransportErrorDetail::new(TransportError::FrameEncodingError, None, "unknown frame type").into());
            }
            let f = Frame::decode(&mut r)?;
            if !f.allowed_in(epoch) {
                return Err(TransportErrorDetail::new(
                    TransportError::ProtocolViolation,
                    Some(f.wire_type()),
                    "frame not permitted in this packet's encryption level",
                )
                .into());
            }
            if !matches!(f, Frame::Padding | Frame::Ack { .. }) {
                ack_eliciting = true;
            }
            frames.push(f);
        }
        self.recovery.space_mut(epoch).on_packet_received(pn, ack_eliciting, now);
        for f in frames {
            self.handle_frame(epoch, f, path_idx, now)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, epoch: Epoch, f: Frame, path_idx: usize, now: Instant) -> Result<()> {
        match f {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack { ranges, ack_delay, .. } => self.on_ack(epoch, &ranges, ack_delay, now)?,
            Frame::Crypto { offset, data } => self.on_crypto(epoch, offset, &data, now)?,
            Frame::Stream(sf) => self.on_stream_frame(sf)?,
            Frame::ResetStream { stream_id, error_code, .. } => self.on_reset_stream(stream_id, error_code)?,
            Frame::StopSending { stream_id, .. } => {
                if let Some(s) = self.streams.get_mut(&stream_id) {
                    s.stop_sending_received = true;
                }
            }
            Frame::NewToken { .. } => {}
            Frame::MaxData(v) => self.peer_max_data = self.peer_max_data.max(v),
            Frame::MaxStreamData { stream_id, max_data } => {
                if let Some(s) = self.streams.get_mut(&stream_id) {
                    if let Some(send) = s.send.as_mut() {
                        send.set_max_stream_data(max_data);
                    }
                }
            }
            Frame::MaxStreamsBidi(_) | Frame::MaxStreamsUni(_) => {}
            Frame::DataBlocked(_) | Frame::StreamDataBlocked { .. } | Frame::StreamsBlockedBidi(_) | Frame::StreamsBlockedUni(_) => {}
            Frame::NewConnectionId(ncid) => {
                self.cids.learn_peer_cid(ncid.connection_id, ncid.seq, Some(ncid.stateless_reset_token));
            }
            Frame::RetireConnectionId(seq) => {
                self.cids.retire_host_cid(seq);
                if let Some(hc) = self.cids.host_cids().find(|h| h.seq == seq) {
                    self.events.push_back(Event::ConnectionIdRetired(hc.cid));
                }
            }
            Frame::PathChallenge(data) => self.pending_path_response = Some(data),
            Frame::PathResponse(data) => {
                if self.paths[path_idx].on_path_response(&data) {
                    self.active_path = path_idx;
                }
            }
            Frame::ConnectionClose { error_code, reason, is_application, .. } => {
                self.on_connection_close(error_code, reason, is_application, now);
            }
            Frame::HandshakeDone => {
                self.handshake_confirmed = true;
                self.crypto.drop_epoch(Epoch::Handshake);
                self.recovery.space_mut(Epoch::Handshake).reset();
            }
        }
        Ok(())
    }

    fn on_crypto(&mut self, epoch: Epoch, offset: u64, data: &[u8], now: Instant) -> Result<()> {
        let idx = recovery::epoch_index(epoch);
        let contiguous = self.crypto_recv[idx].receive(offset, data, false)?;
        if !contiguous.is_empty() {
            self.tls.receive(epoch, &contiguous)?;
            self.process_tls_events(now);
            self.drain_tls_outbound();
        }
        Ok(())
    }

    fn on_stream_frame(&mut self, sf: StreamFrame) -> Result<()> {
        stream::check_recv_direction(self.is_client, sf.stream_id).map_err(Error::from)?;
        self.ensure_remote_stream(sf.stream_id)?;
        let s = self.streams.get_mut(&sf.stream_id).expect("just ensured present");
        let recv = s.recv.as_mut().ok_or(Misuse::StreamSendOnly)?;
        let data = recv.receive(sf.offset, &sf.data, sf.fin)?;
        if !data.is_empty() || sf.fin {
            let end_stream = recv.is_complete();
            self.events.push_back(Event::StreamDataReceived {
                stream_id: sf.stream_id,
                data,
                end_stream,
            });
        }
        Ok(())
    }

    fn on_reset_stream(&mut self, stream_id: u64, error_code: u64) -> Result<()> {
        stream::check_recv_direction(self.is_client, stream_id).map_err(Error::from)?;
        if let Some(s) = self.streams.get_mut(&stream_id) {
            s.reset_received = true;
        }
        self.events.push_back(Event::StreamReset { stream_id, error_code });
        Ok(())
    }

    fn on_ack(&mut self, epoch: Epoch, ranges: &[AckRange], ack_delay_raw: u64, now: Instant) -> Result<()> {
        let acked = self.recovery.space_mut(epoch).on_ack_received(ranges);
        if acked.is_empty() {
            return Ok(());
        }
        let largest_pn = ranges.iter().map(|r| r.largest).max().unwrap_or(0);
        if let Some(newest) = acked.iter().find(|p| p.packet_number == largest_pn) {
            let exponent = self
                .peer_transport_params
                .as_ref()
                .map(|p| p.ack_delay_exponent as u32)
                .unwrap_or(3);
            let ack_delay = Duration::from_micros(ack_delay_raw << exponent);
            let rtt_sample = now.saturating_duration_since(newest.time_sent);
            self.recovery.rtt.update(rtt_sample, ack_delay);
        }
        for pkt in &acked {
            self.recovery.congestion.on_packet_acked(pkt.time_sent, pkt.size as u64);
            for sf in &pkt.frames {
                if let SentFrame::Ping { uid: Some(uid) } = sf {
                    self.events.push_back(Event::PingAcknowledged(*uid));
                }
            }
        }
        let loss_delay = self.recovery.rtt.loss_delay();
        let lost = self.recovery.space_mut(epoch).detect_lost(now, loss_delay);
        if let Some(largest_lost) = lost.iter().map(|p| p.time_sent).max() {
            self.recovery.congestion.on_packets_lost(now, largest_lost);
        }
        for pkt in lost {
            self.requeue_lost(epoch, pkt);
        }
        self.recovery.pto_count = 0;
        Ok(())
    }

    fn on_connection_close(&mut self, error_code: u64, reason: String, is_application: bool, now: Instant) {
        if self.state == State::Closed || self.state == State::Draining {
            return;
        }
        let code = if is_application {
            TransportError::ApplicationError
        } else {
            TransportError::from_u64(error_code)
        };
        self.events.push_back(Event::ConnectionTerminated {
            error_code: code,
            frame_type: None,
            reason,
        });
        self.state = State::Draining;
        let max_ack_delay = Duration::from_millis(self.local_transport_params.max_ack_delay_ms);
        self.draining_deadline = Some(now + self.recovery.rtt.pto_duration(max_ack_delay) * 3);
    }

    fn on_loss_detected(&mut self, now: Instant) {
        for epoch in [Epoch::Initial, Epoch::Handshake, Epoch::ZeroRtt, Epoch::OneRtt] {
            let loss_delay = self.recovery.rtt.loss_delay();
            let lost = self.recovery.space_mut(epoch).detect_lost(now, loss_delay);
            if lost.is_empty() {
                continue;
            }
            if let Some(largest_lost) = lost.iter().map(|p| p.time_sent).max() {
                self.recovery.congestion.on_packets_lost(now, largest_lost);
            }
            for pkt in lost {
                self.requeue_lost(epoch, pkt);
            }
        }
    }

    fn requeue_lost(&mut self, epoch: Epoch, pkt: SentPacket) {
        let idx = recovery::epoch_index(epoch);
        for sf in pkt.frames {
            match sf {
                SentFrame::Crypto { offset, .. } => self.crypto_send[idx].retransmit(offset),
                SentFrame::Stream { stream_id, offset, .. } => {
                    if let Some(s) = self.streams.get_mut(&stream_id) {
                        if let Some(send) = s.send.as_mut() {
                            send.retransmit(offset);
                        }
                    }
                }
                SentFrame::ResetStream { .. } => {}
                SentFrame::NewConnectionId { seq } => self.pending_new_cids.push(seq),
                SentFrame::RetireConnectionId { seq } => self.pending_retire_cids.push(seq),
                SentFrame::MaxData(_) => self.pending_max_data = true,
                SentFrame::MaxStreamData { stream_id } => self.pending_max_stream_data.push(stream_id),
                SentFrame::MaxStreamsBidi(_) => self.pending_max_streams_bidi = true,
                SentFrame::MaxStreamsUni(_) => self.pending_max_streams_uni = true,
                SentFrame::Ping { uid } => self.pending_ping.push(uid.unwrap_or(0)),
                SentFrame::HandshakeDone => self.pending_handshake_done = true,
                SentFrame::NotRetransmitted => {}
            }
        }
    }

    fn process_tls_events(&mut self, now: Instant) {
        while let Some(ev) = self.tls.poll_event() {
            match ev {
                TlsEvent::KeyReady { epoch, direction, secret } => self.on_tls_key_ready(epoch, direction, secret),
                TlsEvent::HandshakeCompleted {
                    alpn_protocol,
                    early_data_accepted,
                    session_resumed,
                } => self.on_handshake_completed(alpn_protocol, early_data_accepted, session_resumed),
                TlsEvent::NewSessionTicket(ticket) => self.events.push_back(Event::NewSessionTicket(ticket)),
            }
        }
        self.maybe_ingest_peer_transport_params();
        let _ = now;
    }

    fn on_tls_key_ready(&mut self, epoch: Epoch, direction: KeyDirection, secret: Vec<u8>) {
        self.log_secret(epoch, direction, &secret);
        let suite = self.tls.negotiated_suite();
        let provider = self.config.crypto_provider.clone();
        let slot = self.pending_secrets.entry(epoch).or_insert((None, None));
        match direction {
            KeyDirection::Send => slot.0 = Some(secret),
            KeyDirection::Recv => slot.1 = Some(secret),
        }
        if let (Some(local), Some(remote)) = (slot.0.clone(), slot.1.clone()) {
            self.pending_secrets.remove(&epoch);
            let ctx = CryptoContext {
                local: crate::crypto::pair::TrafficSecret::new(provider.as_ref(), suite, local),
                remote: crate::crypto::pair::TrafficSecret::new(provider.as_ref(), suite, remote),
            };
            self.crypto.set(epoch, ctx);
            if epoch == Epoch::Handshake {
                self.crypto.drop_epoch(Epoch::Initial);
                self.recovery.space_mut(Epoch::Initial).reset();
            }
        }
    }

    fn log_secret(&self, epoch: Epoch, direction: KeyDirection, secret: &[u8]) {
        let Some(logger) = &self.config.secrets_logger else { return };
        let Some(random) = self.tls.client_random() else { return };
        let is_client_secret = match direction {
            KeyDirection::Send => self.is_client,
            KeyDirection::Recv => !self.is_client,
        };
        let side = if is_client_secret { "CLIENT" } else { "SERVER" };
        let kind = match epoch {
            Epoch::Handshake => "HANDSHAKE_TRAFFIC_SECRET",
            Epoch::OneRtt => "TRAFFIC_SECRET_0",
            _ => return,
        };
        logger.log(&format!("QUIC_{side}_{kind}"), &random, secret);
    }

    fn on_handshake_completed(&mut self, alpn_protocol: Option<String>, early_data_accepted: bool, session_resumed: bool) {
        self.state = State::Connected;
        self.events.push_back(Event::HandshakeCompleted {
            alpn_protocol,
            early_data_accepted,
            session_resumed,
        });
        if !self.is_client {
            self.pending_handshake_done = true;
            self.handshake_confirmed = true;
        }
        for _ in 0..EXTRA_CIDS_ON_HANDSHAKE {
            let hc = self.cids.issue_host_cid(&mut rand::thread_rng(), HOST_CID_LEN);
            self.pending_new_cids.push(hc.seq);
            self.events.push_back(Event::ConnectionIdIssued(hc.cid));
        }
    }

    fn maybe_ingest_peer_transport_params(&mut self) {
        if self.peer_transport_params.is_some() {
            return;
        }
        let Some(bytes) = self.tls.peer_transport_params() else { return };
        let Ok((params, initial_source_cid)) = tp::decode(bytes, self.local_transport_params) else {
            return;
        };
        self.peer_max_data = params.initial_max_data;
        if let Some(cid) = initial_source_cid {
            self.cids.set_initial_peer_cid(cid);
        }
        self.peer_transport_params = Some(params);
    }

    fn perform_key_update(&mut self) {
        if let Some(ctx) = self.crypto.get(Epoch::OneRtt).cloned() {
            let updated = ctx.key_update(self.config.crypto_provider.as_ref());
            self.crypto.set(Epoch::OneRtt, updated);
            self.key_phase = !self.key_phase;
            self.events.push_back(Event::KeyUpdate);
        }
        self.key_update_requested = false;
    }

    fn drain_tls_outbound(&mut self) {
        for epoch in [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::OneRtt] {
            let bytes = self.tls.pending_outbound(epoch);
            if !bytes.is_empty() {
                let idx = recovery::epoch_index(epoch);
                let _ = self.crypto_send[idx].write(&bytes, false);
            }
        }
    }

    fn terminate(&mut self, code: TransportError, frame_type: Option<u64>, reason: &str) {
        if self.state == State::Closed {
            return;
        }
        self.events.push_back(Event::ConnectionTerminated {
            error_code: code,
            frame_type,
            reason: reason.to_string(),
        });
        self.state = State::Closed;
    }

    fn fail(&mut self, err: Error) {
        if self.local_close.is_some() {
            return;
        }
        let detail = to_transport_error(err);
        self.close(detail.code.as_u64(), detail.frame_type, &detail.reason);
    }

    // --- send path ---------------------------------------------------------

    /// Builds a dedicated 1-RTT datagram carrying only a PATH_CHALLENGE,
    /// addressed to `path_idx` rather than `active_path` (spec.md Section
    /// 4.6: a probe to a new path must actually reach that path). Returns
    /// `None` if 1-RTT keys are not yet available; the challenge stays
    /// pending and is retried on the next call.
    fn build_path_challenge_datagram(&mut self, _path_idx: usize, challenge: [u8; 8], now: Instant) -> Option<Vec<u8>> {
        let ctx = self.crypto.get(Epoch::OneRtt).cloned()?;
        let mut builder = DatagramBuilder::new();
        let pn_space = self.recovery.space_mut(Epoch::OneRtt);
        let pn = pn_space.next_packet_number();
        let largest_acked = pn_space.largest_acked_by_peer();
        let size_before = builder.len();
        builder
            .push_short_packet(
                self.config.crypto_provider.as_ref(),
                &ctx,
                &self.dcid,
                false,
                self.key_phase,
                pn,
                largest_acked,
                &[Frame::PathChallenge(challenge)],
            )
            .ok()?;
        let size = builder.len() - size_before;
        self.recovery.space_mut(Epoch::OneRtt).on_packet_sent(SentPacket {
            packet_number: pn,
            time_sent: now,
            ack_eliciting: true,
            in_flight: true,
            size,
            frames: vec![SentFrame::NotRetransmitted],
        });
        Some(builder.take())
    }

    fn build_frames(&mut self, epoch: Epoch, now: Instant, budget: usize) -> Vec<(Frame, SentFrame)> {
        let mut items: Vec<(Frame, SentFrame)> = Vec::new();
        let mut used = 0usize;

        // RFC 9001 Section 4.1.1: ACK frames are not permitted in 0-RTT packets.
        if epoch != Epoch::ZeroRtt && self.recovery.space(epoch).ack_due(now) {
            if let Some((ranges, delay)) = self.recovery.space_mut(epoch).take_ack_ranges(now) {
                let ack_delay = (delay.as_micros() as u64) >> self.local_transport_params.ack_delay_exponent;
                let f = Frame::Ack { ranges, ack_delay, ecn_counts: None };
                used += f.encoded_len();
                items.push((f, SentFrame::NotRetransmitted));
            }
        }

        if self.state == State::Closing {
            if let Some(close) = self.local_close.clone() {
                let f = Frame::ConnectionClose {
                    error_code: close.error_code,
                    frame_type: close.frame_type,
                    reason: close.reason.clone(),
                    is_application: close.frame_type.is_none(),
                };
                if f.allowed_in(epoch) && used + f.encoded_len() <= budget {
                    items.push((f, SentFrame::NotRetransmitted));
                    // Arms the drain deadline on the first CONNECTION_CLOSE
                    // actually sent, symmetric to `on_connection_close`'s
                    // handling of a peer-initiated close (spec.md Section 4.6).
                    if self.draining_deadline.is_none() {
                        let max_ack_delay = Duration::from_millis(self.local_transport_params.max_ack_delay_ms);
                        self.draining_deadline = Some(now + self.recovery.rtt.pto_duration(max_ack_delay) * 3);
                    }
                }
            }
            return items;
        }

        let idx = recovery::epoch_index(epoch);
        while used < budget {
            let Some((offset, data, _fin)) = self.crypto_send[idx].poll_transmit((budget - used).saturating_sub(8)) else {
                break;
            };
            if data.is_empty() {
                break;
            }
            let len = data.len();
            let f = Frame::Crypto { offset, data };
            used += f.encoded_len();
            items.push((f, SentFrame::Crypto { offset, len }));
        }

        if epoch != Epoch::OneRtt && epoch != Epoch::ZeroRtt {
            return items;
        }

        // The frames below this point cover the whole "short header" frame
        // set; most of them require 1-RTT keys and are not permitted in a
        // 0-RTT packet (RFC 9001 Section 4.1.1: no ACK, HANDSHAKE_DONE,
        // NEW_CONNECTION_ID/RETIRE_CONNECTION_ID, or path validation). STREAM
        // data and the flow-control/PING frames that travel with it are the
        // ones 0-RTT actually exists to carry.
        if epoch == Epoch::OneRtt {
            if self.pending_handshake_done {
                items.push((Frame::HandshakeDone, SentFrame::HandshakeDone));
                self.pending_handshake_done = false;
            }
            for seq in self.pending_new_cids.drain(..) {
                if let Some(hc) = self.cids.host_cids().find(|h| h.seq == seq) {
                    let f = Frame::NewConnectionId(NewConnectionIdFrame {
                        seq: hc.seq,
                        retire_prior_to: 0,
                        connection_id: hc.cid,
                        stateless_reset_token: hc.stateless_reset_token,
                    });
                    items.push((f, SentFrame::NewConnectionId { seq }));
                }
            }
            for seq in self.pending_retire_cids.drain(..) {
                items.push((Frame::RetireConnectionId(seq), SentFrame::RetireConnectionId { seq }));
            }
            // PATH_CHALLENGE is built and addressed separately in
            // `datagrams_to_send`, since it must go to the new path's
            // address rather than whatever `active_path` this packet is for.
            if let Some(response) = self.pending_path_response.take() {
                items.push((Frame::PathResponse(response), SentFrame::NotRetransmitted));
            }
        }

        for uid in self.pending_ping.drain(..) {
            items.push((Frame::Ping, SentFrame::Ping { uid: if uid == 0 { None } else { Some(uid) } }));
        }
        if self.pending_max_data {
            items.push((Frame::MaxData(self.local_max_data), SentFrame::MaxData(self.local_max_data)));
            self.pending_max_data = false;
        }
        if self.pending_max_streams_bidi {
            let v = self.local_transport_params.initial_max_streams_bidi;
            items.push((Frame::MaxStreamsBidi(v), SentFrame::MaxStreamsBidi(v)));
            self.pending_max_streams_bidi = false;
        }
        if self.pending_max_streams_uni {
            let v = self.local_transport_params.initial_max_streams_uni;
            items.push((Frame::MaxStreamsUni(v), SentFrame::MaxStreamsUni(v)));
            self.pending_max_streams_uni = false;
        }
        for stream_id in self.pending_max_stream_data.drain(..) {
            if let Some(recv) = self.streams.get(&stream_id).and_then(|s| s.recv.as_ref()) {
                let max_data = recv.max_stream_data_local();
                items.push((Frame::MaxStreamData { stream_id, max_data }, SentFrame::MaxStreamData { stream_id }));
            }
        }

        for (stream_id, s) in self.streams.iter_mut() {
            if used >= budget {
                break;
            }
            let Some(send) = s.send.as_mut() else { continue };
            let Some((offset, data, fin)) = send.poll_transmit((budget - used).saturating_sub(16)) else {
                continue;
            };
            if data.is_empty() && !fin {
                continue;
            }
            let len = data.len();
            let f = Frame::Stream(StreamFrame {
                stream_id: *stream_id,
                offset,
                fin,
                data,
            });
            used += f.encoded_len();
            items.push((f, SentFrame::Stream { stream_id: *stream_id, offset, len }));
        }

        items
    }
}

fn tls_config_from(config: &Config) -> TlsConfig {
    TlsConfig {
        alpn_protocols: config.alpn_protocols.clone(),
        certificate: config.certificate.clone(),
        private_key: config.private_key.clone(),
        early_data_enabled: config.early_data_enabled,
        session_ticket: config.session_ticket.clone(),
        certificate_verifier: config.certificate_verifier.clone(),
        ..TlsConfig::default()
    }
}

fn to_transport_error(err: Error) -> TransportErrorDetail {
    match err {
        Error::Transport(detail) => detail,
        Error::Buffer(e) => TransportErrorDetail::new(TransportError::FrameEncodingError, None, e.to_string()),
        Error::Crypto(e) => TransportErrorDetail::new(TransportError::Crypto(0), None, e.to_string()),
        Error::Misuse(m) => TransportErrorDetail::new(TransportError::ProtocolViolation, None, m.to_string()),
        Error::Malformed(reason) => TransportErrorDetail::new(TransportError::FrameEncodingError, None, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn client_addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    fn server_addr() -> SocketAddr {
        "127.0.0.1:4434".parse().unwrap()
    }

    fn configs() -> (Config, Config) {
        let mut client = Config {
            is_client: true,
            alpn_protocols: vec!["h3".to_string()],
            ..Config::default()
        };
        let mut server = Config {
            is_client: false,
            alpn_protocols: vec!["h3".to_string()],
            certificate: Some(b"test certificate".to_vec()),
            private_key: Some(b"test private key".to_vec()),
            ..Config::default()
        };
        client.transport.idle_timeout_ms = 30_000;
        server.transport.idle_timeout_ms = 30_000;
        (client, server)
    }

    fn pump(client: &mut Connection, server: &mut Connection, now: Instant) {
        for _ in 0..12 {
            let mut progressed = false;
            for (data, _) in client.datagrams_to_send(now) {
                progressed = true;
                server.receive_datagram(&data, client_addr(), now).unwrap();
            }
            for (data, _) in server.datagrams_to_send(now) {
                progressed = true;
                client.receive_datagram(&data, server_addr(), now).unwrap();
            }
            if !progressed {
                break;
            }
        }
    }

    fn drain_events(conn: &mut Connection) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(ev) = conn.next_event() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn handshake_completes_both_sides() {
        let (client_cfg, server_cfg) = configs();
        let now = Instant::now();
        let mut client = Connection::connect(client_cfg, server_addr(), now).unwrap();
        let mut server = Connection::accept(server_cfg, client_addr(), now).unwrap();

        pump(&mut client, &mut server, now);

        let client_events = drain_events(&mut client);
        let server_events = drain_events(&mut server);
        assert!(client_events.iter().any(|e| matches!(e, Event::HandshakeCompleted { .. })));
        assert!(server_events.iter().any(|e| matches!(e, Event::HandshakeCompleted { .. })));
        assert_eq!(
            client_events.iter().filter(|e| matches!(e, Event::ConnectionIdIssued(_))).count(),
            EXTRA_CIDS_ON_HANDSHAKE
        );
    }

    #[test]
    fn stream_data_is_delivered_after_handshake() {
        let (client_cfg, server_cfg) = configs();
        let now = Instant::now();
        let mut client = Connection::connect(client_cfg, server_addr(), now).unwrap();
        let mut server = Connection::accept(server_cfg, client_addr(), now).unwrap();
        pump(&mut client, &mut server, now);
        drain_events(&mut client);
        drain_events(&mut server);

        let sid = client.get_next_available_stream_id(false);
        client.send_stream_data(sid, b"hello world", true).unwrap();
        pump(&mut client, &mut server, now);

        let server_events = drain_events(&mut server);
        let received = server_events.iter().find_map(|e| match e {
            Event::StreamDataReceived { stream_id, data, end_stream } if *stream_id == sid => {
                Some((data.clone(), *end_stream))
            }
            _ => None,
        });
        let (data, end_stream) = received.expect("stream data delivered");
        assert_eq!(data, b"hello world");
        assert!(end_stream);
    }

    #[test]
    fn ping_is_acknowledged() {
        let (client_cfg, server_cfg) = configs();
        let now = Instant::now();
        let mut client = Connection::connect(client_cfg, server_addr(), now).unwrap();
        let mut server = Connection::accept(server_cfg, client_addr(), now).unwrap();
        pump(&mut client, &mut server, now);
        drain_events(&mut client);
        drain_events(&mut server);

        client.send_ping(42);
        pump(&mut client, &mut server, now);

        let client_events = drain_events(&mut client);
        assert!(client_events.iter().any(|e| matches!(e, Event::PingAcknowledged(42))));
    }

    #[test]
    fn idle_timeout_terminates_connection() {
        let (client_cfg, _) = configs();
        let now = Instant::now();
        let mut client = Connection::connect(client_cfg, server_addr(), now).unwrap();
        let later = now + Duration::from_millis(31_000);
        client.handle_timer(later);
        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(e, Event::ConnectionTerminated { error_code: TransportError::NoError, .. })));
    }

    #[test]
    fn local_close_is_idempotent() {
        let (client_cfg, _) = configs();
        let now = Instant::now();
        let mut client = Connection::connect(client_cfg, server_addr(), now).unwrap();
        client.close(0, None, "bye");
        client.close(99, None, "ignored");
        assert_eq!(client.local_close.as_ref().unwrap().error_code, 0);
    }

    #[test]
    fn self_initiated_close_terminates_after_drain_timer() {
        let (client_cfg, server_cfg) = configs();
        let now = Instant::now();
        let mut client = Connection::connect(client_cfg, server_addr(), now).unwrap();
        let mut server = Connection::accept(server_cfg, client_addr(), now).unwrap();
        pump(&mut client, &mut server, now);
        drain_events(&mut client);
        drain_events(&mut server);

        client.close(0, None, "bye");
        // Queues the CONNECTION_CLOSE frame and arms the drain deadline.
        let sent: Vec<_> = client.datagrams_to_send(now).collect();
        assert!(!sent.is_empty());
        assert!(client.draining_deadline.is_some());

        let deadline = client.draining_deadline.unwrap();
        client.handle_timer(deadline);

        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ConnectionTerminated { error_code: TransportError::ApplicationError, .. }
        )));
    }

    #[test]
    fn path_response_on_new_path_rotates_active_path() {
        let (client_cfg, server_cfg) = configs();
        let now = Instant::now();
        let mut client = Connection::connect(client_cfg, server_addr(), now).unwrap();
        let mut server = Connection::accept(server_cfg, client_addr(), now).unwrap();
        pump(&mut client, &mut server, now);
        drain_events(&mut client);
        drain_events(&mut server);

        let migrated_addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let new_idx = server.path_for(migrated_addr, now);
        assert_ne!(new_idx, server.active_path);
        let (idx, challenge) = server.pending_path_challenge.expect("challenge queued for new path");
        assert_eq!(idx, new_idx);

        server
            .handle_frame(Epoch::OneRtt, Frame::PathResponse(challenge), new_idx, now)
            .unwrap();
        assert_eq!(server.active_path, new_idx);
    }
}
