//! Sans-I/O TLS 1.3 handshake driver (spec.md Section 4.3)
//!
//! Inputs are CRYPTO-frame bytes per epoch; outputs are bytes to send (also
//! per epoch) and `TlsEvent`s, chiefly key installations. The driver never
//! touches the network or the QUIC connection directly — it is driven by
//! `receive()` and drained by `pending_outbound()`/`poll_event()`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::crypto::pair::{Epoch, Side};
use crate::crypto::provider::{CipherSuite, CryptoProvider};
use crate::error::{CryptoError, Error, Result, TransportError, TransportErrorDetail};
use crate::tls::alert::AlertDescription;
use crate::tls::extensions::{Extension, KeyShareEntry, GROUP_SECP256R1};
use crate::tls::handshake::{
    Certificate, CertificateEntry, CertificateVerify, ClientHello, EncryptedExtensions, Finished,
    HandshakeMessage, KeyUpdateRequest, NewSessionTicket, ServerHello, TLS1_3_VERSION,
};
use crate::tls::keyschedule::{self, TranscriptHash};

/// draft-28 / draft-27 / draft-26 TLS `supported_versions` codepoints this
/// driver will also advertise alongside TLS 1.3 final (spec.md Section 4.3).
pub const TLS_DRAFT_28: u16 = 0x7f1c;
pub const TLS_DRAFT_27: u16 = 0x7f1b;
pub const TLS_DRAFT_26: u16 = 0x7f1a;

/// Verifies a peer's certificate chain. The bundled default accepts any
/// chain; this crate does not parse X.509 or validate signatures (see
/// DESIGN.md) and is not suitable for production trust decisions.
pub trait CertificateVerifier: Send + Sync {
    fn verify(&self, cert_chain: &[CertificateEntry]) -> bool;
}

#[derive(Default)]
pub struct AcceptAnyCertificateVerifier;

impl CertificateVerifier for AcceptAnyCertificateVerifier {
    fn verify(&self, _cert_chain: &[CertificateEntry]) -> bool {
        true
    }
}

pub struct TlsConfig {
    pub alpn_protocols: Vec<String>,
    pub tls_supported_versions: Vec<u16>,
    pub certificate: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub early_data_enabled: bool,
    pub session_ticket: Option<Vec<u8>>,
    pub certificate_verifier: Arc<dyn CertificateVerifier>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            alpn_protocols: Vec::new(),
            tls_supported_versions: vec![TLS1_3_VERSION, TLS_DRAFT_28, TLS_DRAFT_27, TLS_DRAFT_26],
            certificate: None,
            private_key: None,
            early_data_enabled: false,
            session_ticket: None,
            certificate_verifier: Arc::new(AcceptAnyCertificateVerifier),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Start,
    WaitServerHello,
    WaitEncryptedExtensions,
    WaitCertificateOrRequest,
    WaitCertificateVerify,
    WaitFinished,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    WaitClientHello,
    WaitFinished,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Client(ClientState),
    Server(ServerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone)]
pub enum TlsEvent {
    KeyReady {
        epoch: Epoch,
        direction: KeyDirection,
        secret: Vec<u8>,
    },
    HandshakeCompleted {
        alpn_protocol: Option<String>,
        early_data_accepted: bool,
        session_resumed: bool,
    },
    NewSessionTicket(Vec<u8>),
}

/// HMAC-SHA256 stand-in for a certificate signature. This driver does not
/// implement RSA/ECDSA signing; trust is decided entirely by
/// `CertificateVerifier::verify`, not by this value.
fn sign_placeholder(private_key: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(private_key).expect("hmac accepts any key length");
    mac.update(transcript_hash);
    mac.finalize().into_bytes().to_vec()
}

fn protocol_error(reason: &str) -> Error {
    TransportErrorDetail::new(TransportError::ProtocolViolation, None, reason).into()
}

fn alert_error(description: AlertDescription) -> Error {
    TransportErrorDetail::new(TransportError::Crypto(description as u8), None, description.to_string()).into()
}

pub struct Driver {
    role: Side,
    provider: Arc<dyn CryptoProvider>,
    config: TlsConfig,
    suite: CipherSuite,
    state: DriverState,
    transcript: TranscriptHash,
    own_transport_params: Vec<u8>,
    peer_transport_params: Option<Vec<u8>>,
    selected_alpn: Option<String>,

    ecdh_private: Option<Vec<u8>>,
    early_secret: Option<Vec<u8>>,
    handshake_secret: Option<Vec<u8>>,
    client_hs_secret: Option<Vec<u8>>,
    server_hs_secret: Option<Vec<u8>>,
    hash_at_server_finished: Option<Vec<u8>>,

    incoming: HashMap<Epoch, Vec<u8>>,
    pending_outbound: HashMap<Epoch, Vec<u8>>,
    events: VecDeque<TlsEvent>,
    client_random: Option<[u8; 32]>,

    /// Set once a PSK-bearing ClientHello/accepting EncryptedExtensions has
    /// been seen, so `HandshakeCompleted` can report the real outcome
    /// instead of the hardcoded `false` this driver used to emit.
    early_data_accepted: bool,
}

impl Driver {
    fn new(role: Side, provider: Arc<dyn CryptoProvider>, config: TlsConfig, own_transport_params: Vec<u8>) -> Self {
        Self {
            role,
            provider,
            config,
            suite: CipherSuite::Aes128GcmSha256,
            state: match role {
                Side::Client => DriverState::Client(ClientState::Start),
                Side::Server => DriverState::Server(ServerState::WaitClientHello),
            },
            transcript: TranscriptHash::new(CipherSuite::Aes128GcmSha256),
            own_transport_params,
            peer_transport_params: None,
            selected_alpn: None,
            ecdh_private: None,
            early_secret: None,
            handshake_secret: None,
            client_hs_secret: None,
            server_hs_secret: None,
            hash_at_server_finished: None,
            incoming: HashMap::new(),
            pending_outbound: HashMap::new(),
            events: VecDeque::new(),
            client_random: None,
            early_data_accepted: false,
        }
    }

    /// The ClientHello random, once seen by either side. Used to key
    /// SSLKEYLOGFILE-style secrets logging (spec.md/SPEC_FULL.md Section 6).
    pub fn client_random(&self) -> Option<[u8; 32]> {
        self.client_random
    }

    /// The cipher suite negotiated via ClientHello/ServerHello, used to key
    /// epoch secrets into `CryptoContext` once `TlsEvent::KeyReady` fires.
    pub fn negotiated_suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn new_client(provider: Arc<dyn CryptoProvider>, config: TlsConfig, own_transport_params: Vec<u8>) -> Result<Self> {
        let mut driver = Self::new(Side::Client, provider, config, own_transport_params);
        driver.send_client_hello()?;
        Ok(driver)
    }

    pub fn new_server(provider: Arc<dyn CryptoProvider>, config: TlsConfig, own_transport_params: Vec<u8>) -> Self {
        Self::new(Side::Server, provider, config, own_transport_params)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            DriverState::Client(ClientState::Connected) | DriverState::Server(ServerState::Connected)
        )
    }

    /// Drain bytes queued for a given epoch's CRYPTO stream.
    pub fn pending_outbound(&mut self, epoch: Epoch) -> Vec<u8> {
        self.pending_outbound.remove(&epoch).unwrap_or_default()
    }

    pub fn poll_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    fn queue_send(&mut self, epoch: Epoch, bytes: &[u8]) {
        self.pending_outbound.entry(epoch).or_default().extend_from_slice(bytes);
    }

    fn emit_key(&mut self, epoch: Epoch, direction: KeyDirection, secret: Vec<u8>) {
        self.events.push_back(TlsEvent::KeyReady { epoch, direction, secret });
    }

    fn send_client_hello(&mut self) -> Result<()> {
        let (private, public) = self.provider.ecdh_generate();
        self.ecdh_private = Some(private);
        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);
        self.client_random = Some(random);

        let offered_psk = self.config.session_ticket.clone().filter(|_| self.config.early_data_enabled);

        let mut extensions = vec![
            Extension::SupportedVersions(self.config.tls_supported_versions.clone()),
            Extension::KeyShareClient(vec![KeyShareEntry {
                group: GROUP_SECP256R1,
                key_exchange: public,
            }]),
            Extension::SignatureAlgorithms(vec![
                crate::tls::extensions::SIG_RSA_PSS_RSAE_SHA256,
                crate::tls::extensions::SIG_ECDSA_SECP256R1_SHA256,
                crate::tls::extensions::SIG_RSA_PKCS1_SHA256,
                crate::tls::extensions::SIG_RSA_PKCS1_SHA1,
            ]),
            Extension::SupportedGroups(vec![GROUP_SECP256R1]),
            Extension::Alpn(self.config.alpn_protocols.clone()),
            Extension::QuicTransportParameters(self.own_transport_params.clone()),
        ];
        if let Some(ticket) = &offered_psk {
            extensions.push(Extension::PskKeyExchangeModes(vec![1]));
            extensions.push(Extension::EarlyData);
            // Must be the last extension per RFC 8446 Section 4.2.11; this
            // driver carries no binder, so there is nothing after it to protect.
            extensions.push(Extension::PreSharedKey(ticket.clone()));
        }

        let ch = HandshakeMessage::ClientHello(ClientHello {
            random,
            legacy_session_id: Vec::new(),
            cipher_suites: vec![
                CipherSuite::Aes128GcmSha256.tls_id(),
                CipherSuite::Aes256GcmSha384.tls_id(),
                CipherSuite::Chacha20Poly1305Sha256.tls_id(),
            ],
            extensions,
        });
        let encoded = ch.encode();
        self.transcript.update(&encoded);
        let hash_after_ch = self.transcript.finish_clone();
        self.queue_send(Epoch::Initial, &encoded);
        self.state = DriverState::Client(ClientState::WaitServerHello);

        if let Some(ticket) = offered_psk {
            // Optimistic 0-RTT: the client installs its early traffic key
            // before it knows whether the server will accept the PSK. Early
            // Secret depends only on the PSK, not on the (EC)DHE exchange, so
            // this is safe to derive now (RFC 8446 Section 7.1).
            let early = keyschedule::early_secret(self.provider.as_ref(), self.suite, Some(&ticket));
            let c_e_traffic =
                keyschedule::derive_secret(self.provider.as_ref(), self.suite, &early, b"c e traffic", &hash_after_ch);
            // 0-RTT application data only ever flows client -> server; both
            // directions are installed with the same secret so the epoch's
            // `CryptoContext` (which always carries a local/remote pair) is
            // complete. Only `Send` is ever actually exercised on this side.
            self.emit_key(Epoch::ZeroRtt, KeyDirection::Send, c_e_traffic.clone());
            self.emit_key(Epoch::ZeroRtt, KeyDirection::Recv, c_e_traffic);
            self.early_secret = Some(early);
        }
        Ok(())
    }

    /// Feed CRYPTO-frame bytes received on `epoch`'s stream. May advance the
    /// state machine through any number of messages that are now complete.
    pub fn receive(&mut self, epoch: Epoch, data: &[u8]) -> Result<()> {
        self.incoming.entry(epoch).or_default().extend_from_slice(data);
        loop {
            let buf = self.incoming.entry(epoch).or_default();
            if buf.len() < 4 {
                break;
            }
            let body_len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
            let total = 4 + body_len;
            if buf.len() < total {
                break;
            }
            let raw: Vec<u8> = buf.drain(..total).collect();
            let finished_len = self.suite.hash_len();
            let mut r = crate::buffer::Reader::new(&raw);
            let msg = HandshakeMessage::decode(&mut r, finished_len)?;
            self.process_message(epoch, &raw, msg)?;
        }
        Ok(())
    }

    fn process_message(&mut self, epoch: Epoch, raw: &[u8], msg: HandshakeMessage) -> Result<()> {
        match self.state {
            DriverState::Client(state) => self.process_client(state, epoch, raw, msg),
            DriverState::Server(state) => self.process_server(state, epoch, raw, msg),
        }
    }

    fn process_client(&mut self, state: ClientState, epoch: Epoch, raw: &[u8], msg: HandshakeMessage) -> Result<()> {
        let _ = epoch;
        match (state, msg) {
            (ClientState::WaitServerHello, HandshakeMessage::ServerHello(sh)) => {
                let suite = CipherSuite::from_tls_id(sh.cipher_suite)
                    .ok_or_else(|| protocol_error("ServerHello selected an unsupported cipher suite"))?;
                self.suite = suite;
                self.transcript.update(raw);
                let hash_after_sh = self.transcript.finish_clone();

                let key_share = sh
                    .extensions
                    .iter()
                    .find_map(|e| match e {
                        Extension::KeyShareServer(entry) => Some(entry.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| protocol_error("ServerHello missing key_share"))?;
                let private = self.ecdh_private.clone().ok_or(CryptoError::KeyExchange)?;
                let shared_secret = self.provider.ecdh_derive(&private, &key_share.key_exchange)?;

                // Reuse the PSK-derived Early Secret from an optimistic 0-RTT
                // attempt if there was one, so the Handshake Secret salt is
                // consistent with whatever early traffic key was installed.
                let early = self
                    .early_secret
                    .clone()
                    .unwrap_or_else(|| keyschedule::early_secret(self.provider.as_ref(), suite, None));
                let handshake = keyschedule::handshake_secret(self.provider.as_ref(), suite, &early, &shared_secret);
                let c_hs = keyschedule::derive_secret(self.provider.as_ref(), suite, &handshake, b"c hs traffic", &hash_after_sh);
                let s_hs = keyschedule::derive_secret(self.provider.as_ref(), suite, &handshake, b"s hs traffic", &hash_after_sh);

                self.emit_key(Epoch::Handshake, KeyDirection::Send, c_hs.clone());
                self.emit_key(Epoch::Handshake, KeyDirection::Recv, s_hs.clone());

                self.early_secret = Some(early);
                self.handshake_secret = Some(handshake);
                self.client_hs_secret = Some(c_hs);
                self.server_hs_secret = Some(s_hs);
                self.state = DriverState::Client(ClientState::WaitEncryptedExtensions);
                Ok(())
            }
            (ClientState::WaitEncryptedExtensions, HandshakeMessage::EncryptedExtensions(ee)) => {
                self.transcript.update(raw);
                self.ingest_encrypted_extensions(ee);
                self.state = DriverState::Client(ClientState::WaitCertificateOrRequest);
                Ok(())
            }
            (ClientState::WaitCertificateOrRequest, HandshakeMessage::Certificate(cert)) => {
                if !self.config.certificate_verifier.verify(&cert.certificate_list) {
                    return Err(alert_error(AlertDescription::BadCertificate));
                }
                self.transcript.update(raw);
                self.state = DriverState::Client(ClientState::WaitCertificateVerify);
                Ok(())
            }
            (ClientState::WaitCertificateVerify, HandshakeMessage::CertificateVerify(_cv)) => {
                self.transcript.update(raw);
                self.state = DriverState::Client(ClientState::WaitFinished);
                Ok(())
            }
            (ClientState::WaitFinished, HandshakeMessage::Finished(fin)) => {
                let hash_before = self.transcript.finish_clone();
                let suite = self.suite;
                let server_hs = self.server_hs_secret.clone().ok_or(CryptoError::KeyDerivation)?;
                let expected = keyschedule::finished_verify_data(self.provider.as_ref(), suite, &server_hs, &hash_before);
                if !constant_time_eq(&expected, &fin.verify_data) {
                    return Err(alert_error(AlertDescription::DecryptError));
                }
                self.transcript.update(raw);
                let hash_after_server_finished = self.transcript.finish_clone();
                self.hash_at_server_finished = Some(hash_after_server_finished.clone());

                let handshake = self.handshake_secret.clone().ok_or(CryptoError::KeyDerivation)?;
                let master = keyschedule::master_secret(self.provider.as_ref(), suite, &handshake);
                let c_ap = keyschedule::derive_secret(self.provider.as_ref(), suite, &master, b"c ap traffic", &hash_after_server_finished);
                let s_ap = keyschedule::derive_secret(self.provider.as_ref(), suite, &master, b"s ap traffic", &hash_after_server_finished);
                self.emit_key(Epoch::OneRtt, KeyDirection::Send, c_ap);
                self.emit_key(Epoch::OneRtt, KeyDirection::Recv, s_ap);

                let client_hs = self.client_hs_secret.clone().ok_or(CryptoError::KeyDerivation)?;
                let my_verify_data = keyschedule::finished_verify_data(self.provider.as_ref(), suite, &client_hs, &hash_after_server_finished);
                let my_finished = HandshakeMessage::Finished(Finished { verify_data: my_verify_data });
                let encoded = my_finished.encode();
                self.transcript.update(&encoded);
                self.queue_send(Epoch::Handshake, &encoded);

                self.state = DriverState::Client(ClientState::Connected);
                self.events.push_back(TlsEvent::HandshakeCompleted {
                    alpn_protocol: self.selected_alpn.clone(),
                    early_data_accepted: self.early_data_accepted,
                    session_resumed: self.early_data_accepted,
                });
                Ok(())
            }
            (ClientState::Connected, HandshakeMessage::NewSessionTicket(nst)) => {
                self.transcript.update(raw);
                self.events.push_back(TlsEvent::NewSessionTicket(nst.ticket));
                Ok(())
            }
            (ClientState::Connected, HandshakeMessage::KeyUpdate(_)) => {
                Err(protocol_error("KeyUpdate message not allowed over QUIC"))
            }
            (_, _) => Err(protocol_error("unexpected handshake message for current state")),
        }
    }

    fn ingest_encrypted_extensions(&mut self, ee: EncryptedExtensions) {
        for ext in ee.extensions {
            match ext {
                Extension::Alpn(protocols) => self.selected_alpn = protocols.into_iter().next(),
                Extension::QuicTransportParameters(bytes) => self.peer_transport_params = Some(bytes),
                Extension::EarlyData => self.early_data_accepted = true,
                _ => {}
            }
        }
    }

    fn process_server(&mut self, state: ServerState, epoch: Epoch, raw: &[u8], msg: HandshakeMessage) -> Result<()> {
        let _ = epoch;
        match (state, msg) {
            (ServerState::WaitClientHello, HandshakeMessage::ClientHello(ch)) => {
                self.handle_client_hello(raw, ch)
            }
            (ServerState::WaitFinished, HandshakeMessage::Finished(fin)) => {
                let hash_at_server_finished =
                    self.hash_at_server_finished.clone().ok_or(CryptoError::KeyDerivation)?;
                let suite = self.suite;
                let client_hs = self.client_hs_secret.clone().ok_or(CryptoError::KeyDerivation)?;
                let expected = keyschedule::finished_verify_data(self.provider.as_ref(), suite, &client_hs, &hash_at_server_finished);
                if !constant_time_eq(&expected, &fin.verify_data) {
                    return Err(alert_error(AlertDescription::DecryptError));
                }
                self.transcript.update(raw);
                self.state = DriverState::Server(ServerState::Connected);
                self.events.push_back(TlsEvent::HandshakeCompleted {
                    alpn_protocol: self.selected_alpn.clone(),
                    early_data_accepted: self.early_data_accepted,
                    session_resumed: self.early_data_accepted,
                });
                Ok(())
            }
            (ServerState::Connected, HandshakeMessage::KeyUpdate(_)) => {
                Err(protocol_error("KeyUpdate message not allowed over QUIC"))
            }
            (_, _) => Err(protocol_error("unexpected handshake message for current state")),
        }
    }

    fn handle_client_hello(&mut self, raw: &[u8], ch: ClientHello) -> Result<()> {
        self.client_random = Some(ch.random);
        let suite = ch
            .cipher_suites
            .iter()
            .find_map(|id| CipherSuite::from_tls_id(*id))
            .ok_or_else(|| protocol_error("ClientHello offered no supported cipher suite"))?;
        self.suite = suite;

        let supports_tls13 = ch.extensions.iter().any(|e| match e {
            Extension::SupportedVersions(versions) => versions.contains(&TLS1_3_VERSION),
            _ => false,
        });
        if !supports_tls13 {
            return Err(alert_error(AlertDescription::ProtocolVersion));
        }

        let client_key_share = ch
            .extensions
            .iter()
            .find_map(|e| match e {
                Extension::KeyShareClient(entries) => {
                    entries.iter().find(|k| k.group == GROUP_SECP256R1).cloned()
                }
                _ => None,
            })
            .ok_or_else(|| protocol_error("ClientHello missing a secp256r1 key share"))?;

        let client_alpn = ch.extensions.iter().find_map(|e| match e {
            Extension::Alpn(protocols) => Some(protocols.clone()),
            _ => None,
        });
        self.peer_transport_params = ch.extensions.iter().find_map(|e| match e {
            Extension::QuicTransportParameters(bytes) => Some(bytes.clone()),
            _ => None,
        });
        self.selected_alpn = client_alpn.and_then(|client_list| {
            self.config
                .alpn_protocols
                .iter()
                .find(|p| client_list.contains(p))
                .cloned()
        });

        self.transcript.update(raw);
        let hash_after_ch = self.transcript.finish_clone();

        let offered_identity = ch.extensions.iter().find_map(|e| match e {
            Extension::PreSharedKey(identity) => Some(identity.clone()),
            _ => None,
        });
        let early_data_requested = ch.extensions.iter().any(|e| matches!(e, Extension::EarlyData));
        let accept_early_data = self.config.early_data_enabled
            && early_data_requested
            && offered_identity.is_some()
            && offered_identity == self.config.session_ticket;
        self.early_data_accepted = accept_early_data;

        let (private, public) = self.provider.ecdh_generate();
        let shared_secret = self.provider.ecdh_derive(&private, &client_key_share.key_exchange)?;

        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);
        let sh = HandshakeMessage::ServerHello(ServerHello {
            random,
            legacy_session_id_echo: ch.legacy_session_id.clone(),
            cipher_suite: suite.tls_id(),
            extensions: vec![
                Extension::SupportedVersionsSelected(TLS1_3_VERSION),
                Extension::KeyShareServer(KeyShareEntry {
                    group: GROUP_SECP256R1,
                    key_exchange: public,
                }),
            ],
        });
        let sh_encoded = sh.encode();
        self.transcript.update(&sh_encoded);
        self.queue_send(Epoch::Initial, &sh_encoded);
        let hash_after_sh = self.transcript.finish_clone();

        let psk = offered_identity.filter(|_| accept_early_data);
        let early = keyschedule::early_secret(self.provider.as_ref(), suite, psk.as_deref());
        if accept_early_data {
            let c_e_traffic =
                keyschedule::derive_secret(self.provider.as_ref(), suite, &early, b"c e traffic", &hash_after_ch);
            // See the matching comment in `send_client_hello`: 0-RTT only
            // flows client -> server, but `CryptoContext` needs both slots.
            self.emit_key(Epoch::ZeroRtt, KeyDirection::Recv, c_e_traffic.clone());
            self.emit_key(Epoch::ZeroRtt, KeyDirection::Send, c_e_traffic);
        }
        let handshake = keyschedule::handshake_secret(self.provider.as_ref(), suite, &early, &shared_secret);
        let c_hs = keyschedule::derive_secret(self.provider.as_ref(), suite, &handshake, b"c hs traffic", &hash_after_sh);
        let s_hs = keyschedule::derive_secret(self.provider.as_ref(), suite, &handshake, b"s hs traffic", &hash_after_sh);
        self.emit_key(Epoch::Handshake, KeyDirection::Recv, c_hs.clone());
        self.emit_key(Epoch::Handshake, KeyDirection::Send, s_hs.clone());
        self.early_secret = Some(early);
        self.handshake_secret = Some(handshake.clone());
        self.client_hs_secret = Some(c_hs);
        self.server_hs_secret = Some(s_hs.clone());

        let mut ee_extensions = vec![
            Extension::Alpn(self.selected_alpn.iter().cloned().collect()),
            Extension::QuicTransportParameters(self.own_transport_params.clone()),
        ];
        if accept_early_data {
            ee_extensions.push(Extension::EarlyData);
        }
        let ee = HandshakeMessage::EncryptedExtensions(EncryptedExtensions {
            extensions: ee_extensions,
        });
        let ee_encoded = ee.encode();
        self.transcript.update(&ee_encoded);
        self.queue_send(Epoch::Handshake, &ee_encoded);

        let cert_bytes = self.config.certificate.clone().unwrap_or_default();
        let cert = HandshakeMessage::Certificate(Certificate {
            certificate_request_context: Vec::new(),
            certificate_list: vec![CertificateEntry {
                cert_data: cert_bytes,
                extensions: Vec::new(),
            }],
        });
        let cert_encoded = cert.encode();
        self.transcript.update(&cert_encoded);
        self.queue_send(Epoch::Handshake, &cert_encoded);
        let hash_after_cert = self.transcript.finish_clone();

        let private_key = self.config.private_key.clone().unwrap_or_default();
        let signature = sign_placeholder(&private_key, &hash_after_cert);
        let cv = HandshakeMessage::CertificateVerify(CertificateVerify {
            algorithm: crate::tls::extensions::SIG_ECDSA_SECP256R1_SHA256,
            signature,
        });
        let cv_encoded = cv.encode();
        self.transcript.update(&cv_encoded);
        self.queue_send(Epoch::Handshake, &cv_encoded);
        let hash_after_cv = self.transcript.finish_clone();

        let server_verify_data = keyschedule::finished_verify_data(self.provider.as_ref(), suite, &s_hs, &hash_after_cv);
        let server_fin = HandshakeMessage::Finished(Finished { verify_data: server_verify_data });
        let fin_encoded = server_fin.encode();
        self.transcript.update(&fin_encoded);
        self.queue_send(Epoch::Handshake, &fin_encoded);
        let hash_after_server_finished = self.transcript.finish_clone();
        self.hash_at_server_finished = Some(hash_after_server_finished.clone());

        let master = keyschedule::master_secret(self.provider.as_ref(), suite, &handshake);
        let c_ap = keyschedule::derive_secret(self.provider.as_ref(), suite, &master, b"c ap traffic", &hash_after_server_finished);
        let s_ap = keyschedule::derive_secret(self.provider.as_ref(), suite, &master, b"s ap traffic", &hash_after_server_finished);
        self.emit_key(Epoch::OneRtt, KeyDirection::Recv, c_ap);
        self.emit_key(Epoch::OneRtt, KeyDirection::Send, s_ap);

        self.state = DriverState::Server(ServerState::WaitFinished);
        Ok(())
    }

    /// Queue a `NewSessionTicket` post-handshake message on the 1-RTT epoch.
    /// Only meaningful once the handshake has completed; callers decide
    /// whether/when to issue one (ticket persistence policy is a non-goal).
    pub fn issue_session_ticket(&mut self, ticket: Vec<u8>) {
        let nst = HandshakeMessage::NewSessionTicket(NewSessionTicket {
            ticket_lifetime: 86400,
            ticket_age_add: 0,
            ticket_nonce: vec![0],
            ticket,
            extensions: Vec::new(),
        });
        let encoded = nst.encode();
        self.queue_send(Epoch::OneRtt, &encoded);
    }

    pub fn peer_transport_params(&self) -> Option<&[u8]> {
        self.peer_transport_params.as_deref()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::DefaultCryptoProvider;

    fn run_handshake() -> (Driver, Driver) {
        let provider: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider);
        let mut client_config = TlsConfig::default();
        client_config.alpn_protocols = vec!["h3".to_string()];
        let mut server_config = TlsConfig::default();
        server_config.alpn_protocols = vec!["h3".to_string()];
        server_config.certificate = Some(vec![1, 2, 3]);
        server_config.private_key = Some(vec![4, 5, 6]);

        let mut client = Driver::new_client(provider.clone(), client_config, vec![9, 9]).unwrap();
        let mut server = Driver::new_server(provider, server_config, vec![8, 8]);

        let ch = client.pending_outbound(Epoch::Initial);
        server.receive(Epoch::Initial, &ch).unwrap();

        let sh = server.pending_outbound(Epoch::Initial);
        client.receive(Epoch::Initial, &sh).unwrap();

        let server_handshake_flight = server.pending_outbound(Epoch::Handshake);
        client.receive(Epoch::Handshake, &server_handshake_flight).unwrap();

        let client_fin = client.pending_outbound(Epoch::Handshake);
        server.receive(Epoch::Handshake, &client_fin).unwrap();

        (client, server)
    }

    #[test]
    fn full_handshake_reaches_connected_on_both_sides() {
        let (mut client, mut server) = run_handshake();
        assert!(client.is_connected());
        assert!(server.is_connected());

        let mut saw_client_completed = false;
        while let Some(event) = client.poll_event() {
            if let TlsEvent::HandshakeCompleted { alpn_protocol, .. } = event {
                assert_eq!(alpn_protocol.as_deref(), Some("h3"));
                saw_client_completed = true;
            }
        }
        assert!(saw_client_completed);

        let mut saw_server_completed = false;
        while let Some(event) = server.poll_event() {
            if let TlsEvent::HandshakeCompleted { alpn_protocol, .. } = event {
                assert_eq!(alpn_protocol.as_deref(), Some("h3"));
                saw_server_completed = true;
            }
        }
        assert!(saw_server_completed);
    }

    #[test]
    fn both_sides_install_matching_one_rtt_secrets() {
        let (mut client, mut server) = run_handshake();
        let mut client_send = None;
        let mut client_recv = None;
        while let Some(event) = client.poll_event() {
            if let TlsEvent::KeyReady { epoch: Epoch::OneRtt, direction, secret } = event {
                match direction {
                    KeyDirection::Send => client_send = Some(secret),
                    KeyDirection::Recv => client_recv = Some(secret),
                }
            }
        }
        let mut server_send = None;
        let mut server_recv = None;
        while let Some(event) = server.poll_event() {
            if let TlsEvent::KeyReady { epoch: Epoch::OneRtt, direction, secret } = event {
                match direction {
                    KeyDirection::Send => server_send = Some(secret),
                    KeyDirection::Recv => server_recv = Some(secret),
                }
            }
        }
        assert_eq!(client_send, server_recv);
        assert_eq!(client_recv, server_send);
    }

    #[test]
    fn rejects_key_update_message_after_connected() {
        let (_client, mut server) = run_handshake();
        let ku = HandshakeMessage::KeyUpdate(KeyUpdateRequest::NotRequested).encode();
        assert!(server.receive(Epoch::OneRtt, &ku).is_err());
    }

    #[test]
    fn matching_session_ticket_is_accepted_for_0rtt() {
        let provider: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider);
        let ticket = vec![7, 7, 7, 7];

        let mut client_config = TlsConfig::default();
        client_config.alpn_protocols = vec!["h3".to_string()];
        client_config.early_data_enabled = true;
        client_config.session_ticket = Some(ticket.clone());

        let mut server_config = TlsConfig::default();
        server_config.alpn_protocols = vec!["h3".to_string()];
        server_config.certificate = Some(vec![1, 2, 3]);
        server_config.private_key = Some(vec![4, 5, 6]);
        server_config.early_data_enabled = true;
        server_config.session_ticket = Some(ticket);

        let mut client = Driver::new_client(provider.clone(), client_config, vec![9, 9]).unwrap();

        // The optimistic client-side 0-RTT key is installed before the
        // server has seen anything, straight out of `new_client`.
        let mut client_zero_rtt_send = None;
        while let Some(event) = client.poll_event() {
            if let TlsEvent::KeyReady { epoch: Epoch::ZeroRtt, direction: KeyDirection::Send, secret } = event {
                client_zero_rtt_send = Some(secret);
            }
        }
        assert!(client_zero_rtt_send.is_some(), "client installs 0-RTT send key optimistically");

        let mut server = Driver::new_server(provider, server_config, vec![8, 8]);
        let ch = client.pending_outbound(Epoch::Initial);
        server.receive(Epoch::Initial, &ch).unwrap();

        let mut server_zero_rtt_recv = None;
        while let Some(event) = server.poll_event() {
            if let TlsEvent::KeyReady { epoch: Epoch::ZeroRtt, direction: KeyDirection::Recv, secret } = event {
                server_zero_rtt_recv = Some(secret);
            }
        }
        assert_eq!(client_zero_rtt_send, server_zero_rtt_recv);

        let sh = server.pending_outbound(Epoch::Initial);
        client.receive(Epoch::Initial, &sh).unwrap();
        let server_handshake_flight = server.pending_outbound(Epoch::Handshake);
        client.receive(Epoch::Handshake, &server_handshake_flight).unwrap();
        let client_fin = client.pending_outbound(Epoch::Handshake);
        server.receive(Epoch::Handshake, &client_fin).unwrap();

        let mut client_accepted = false;
        while let Some(event) = client.poll_event() {
            if let TlsEvent::HandshakeCompleted { early_data_accepted, .. } = event {
                client_accepted = early_data_accepted;
            }
        }
        let mut server_accepted = false;
        while let Some(event) = server.poll_event() {
            if let TlsEvent::HandshakeCompleted { early_data_accepted, .. } = event {
                server_accepted = early_data_accepted;
            }
        }
        assert!(client_accepted);
        assert!(server_accepted);
    }

    #[test]
    fn mismatched_session_ticket_is_rejected() {
        let provider: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider);

        let mut client_config = TlsConfig::default();
        client_config.alpn_protocols = vec!["h3".to_string()];
        client_config.early_data_enabled = true;
        client_config.session_ticket = Some(vec![1, 1, 1]);

        let mut server_config = TlsConfig::default();
        server_config.alpn_protocols = vec!["h3".to_string()];
        server_config.certificate = Some(vec![1, 2, 3]);
        server_config.private_key = Some(vec![4, 5, 6]);
        server_config.early_data_enabled = true;
        server_config.session_ticket = Some(vec![2, 2, 2]);

        let mut client = Driver::new_client(provider.clone(), client_config, vec![9, 9]).unwrap();
        while client.poll_event().is_some() {}

        let mut server = Driver::new_server(provider, server_config, vec![8, 8]);
        let ch = client.pending_outbound(Epoch::Initial);
        server.receive(Epoch::Initial, &ch).unwrap();

        assert!(!server.events.iter().any(|e| matches!(e, TlsEvent::KeyReady { epoch: Epoch::ZeroRtt, .. })));
    }
}
