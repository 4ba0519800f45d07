//! Connection configuration and application-visible events
//!
//! `Config` enumerates every host-tunable knob from spec.md Section 6, plus
//! the ambient `crypto_provider`/`early_data_enabled` fields SPEC_FULL.md
//! Section 6 adds. `Event` is the FIFO-drained application-visible output
//! of `Connection::next_event()` (spec.md Section 5/6).

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::crypto::provider::{CryptoProvider, DefaultCryptoProvider};
use crate::error::{FrameType, TransportError};
use crate::tls::driver::CertificateVerifier;

/// draft-19/20 wire version numbers this crate speaks (spec.md Section 6).
pub const VERSION_DRAFT_19: u32 = 0xff00_0013;
pub const VERSION_DRAFT_20: u32 = 0xff00_0014;

/// A sink for SSLKEYLOGFILE-format lines (`QUIC_{SERVER,CLIENT}_{HANDSHAKE_TRAFFIC,TRAFFIC}_SECRET_*`).
pub trait SecretsLogger: Send + Sync {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]);
}

/// Writes SSLKEYLOGFILE lines to any `Write` sink (file, in-memory buffer).
pub struct WriterSecretsLogger<W: Write + Send> {
    sink: Mutex<W>,
}

impl<W: Write + Send> WriterSecretsLogger<W> {
    pub fn new(sink: W) -> Self {
        Self { sink: Mutex::new(sink) }
    }
}

impl<W: Write + Send> SecretsLogger for WriterSecretsLogger<W> {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut out = self.sink.lock().expect("secrets log sink mutex poisoned");
        let _ = writeln!(out, "{label} {} {}", hex_encode(client_random), hex_encode(secret));
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// An observer producing qlog-style traces. The crate itself never opens a
/// file; the host wires this to whatever sink it wants.
pub trait QuicLogger: Send + Sync {
    fn log_event(&self, category: &str, name: &str, details: &str);
}

/// The host-tunable connection configuration (spec.md Section 6, "Connection
/// configuration").
pub struct Config {
    pub is_client: bool,
    pub alpn_protocols: Vec<String>,
    pub supported_versions: Vec<u32>,
    pub certificate: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub secrets_logger: Option<Arc<dyn SecretsLogger>>,
    pub session_ticket: Option<Vec<u8>>,
    pub quic_logger: Option<Arc<dyn QuicLogger>>,

    /// Ambient additions (SPEC_FULL.md Section 6).
    pub early_data_enabled: bool,
    pub crypto_provider: Arc<dyn CryptoProvider>,
    pub certificate_verifier: Arc<dyn CertificateVerifier>,

    pub transport: TransportParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_client: true,
            alpn_protocols: Vec::new(),
            supported_versions: vec![VERSION_DRAFT_20, VERSION_DRAFT_19],
            certificate: None,
            private_key: None,
            secrets_logger: None,
            session_ticket: None,
            quic_logger: None,
            early_data_enabled: false,
            crypto_provider: Arc::new(DefaultCryptoProvider),
            certificate_verifier: Arc::new(crate::tls::driver::AcceptAnyCertificateVerifier),
            transport: TransportParams::default(),
        }
    }
}

/// QUIC transport parameters negotiated during the handshake (RFC 9000
/// Section 18, draft-19/20 wire numbering). Only the fields this
/// implementation actually enforces are modeled.
#[derive(Debug, Clone, Copy)]
pub struct TransportParams {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u8,
    pub max_ack_delay_ms: u64,
    pub active_connection_id_limit: u64,
    pub idle_timeout_ms: u64,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 18,
            initial_max_stream_data_bidi_remote: 1 << 18,
            initial_max_stream_data_uni: 1 << 18,
            initial_max_streams_bidi: 128,
            initial_max_streams_uni: 128,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            active_connection_id_limit: 8,
            idle_timeout_ms: 30_000,
        }
    }
}

/// Application-visible events drained by `Connection::next_event()`
/// (spec.md Section 6, plus `NewSessionTicket`/`KeyUpdate` recovered from
/// aioquic per SPEC_FULL.md Section 6).
#[derive(Debug, Clone)]
pub enum Event {
    HandshakeCompleted {
        alpn_protocol: Option<String>,
        early_data_accepted: bool,
        session_resumed: bool,
    },
    ConnectionIdIssued(crate::cid::ConnectionId),
    ConnectionIdRetired(crate::cid::ConnectionId),
    ConnectionTerminated {
        error_code: TransportError,
        frame_type: Option<FrameType>,
        reason: String,
    },
    PingAcknowledged(u64),
    StreamDataReceived {
        stream_id: u64,
        data: Vec<u8>,
        end_stream: bool,
    },
    StreamReset {
        stream_id: u64,
        error_code: u64,
    },
    NewSessionTicket(Vec<u8>),
    KeyUpdate,
}
