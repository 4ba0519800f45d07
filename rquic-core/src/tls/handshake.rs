//! TLS 1.3 handshake messages
//!
//! On-wire format: a 1-byte type tag followed by a 24-bit length-prefixed
//! body (spec.md Section 4.3). Bodies are further structured per RFC 8446
//! Section 4.

use crate::buffer::{Reader, Writer};
use crate::error::{Error, Result};
use crate::tls::extensions::{decode_extensions, encode_extensions, Extension};

pub const TLS1_3_VERSION: u16 = 0x0304;
/// Legacy `ClientHello.legacy_version` / `ServerHello.legacy_version`, fixed
/// at TLS 1.2 for middlebox compatibility (RFC 8446 Section 4.1.2/4.1.3).
pub const LEGACY_VERSION: u16 = 0x0303;

const HT_CLIENT_HELLO: u8 = 1;
const HT_SERVER_HELLO: u8 = 2;
const HT_NEW_SESSION_TICKET: u8 = 4;
const HT_ENCRYPTED_EXTENSIONS: u8 = 8;
const HT_CERTIFICATE: u8 = 11;
const HT_CERTIFICATE_VERIFY: u8 = 15;
const HT_FINISHED: u8 = 20;
const HT_KEY_UPDATE: u8 = 24;

#[derive(Debug, Clone)]
pub struct ClientHello {
    pub random: [u8; 32],
    pub legacy_session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub random: [u8; 32],
    pub legacy_session_id_echo: Vec<u8>,
    pub cipher_suite: u16,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone)]
pub struct EncryptedExtensions {
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone)]
pub struct CertificateEntry {
    pub cert_data: Vec<u8>,
    pub extensions: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub certificate_request_context: Vec<u8>,
    pub certificate_list: Vec<CertificateEntry>,
}

#[derive(Debug, Clone)]
pub struct CertificateVerify {
    pub algorithm: u16,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Finished {
    pub verify_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewSessionTicket {
    pub ticket_lifetime: u32,
    pub ticket_age_add: u32,
    pub ticket_nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUpdateRequest {
    NotRequested,
    Requested,
}

#[derive(Debug, Clone)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    EncryptedExtensions(EncryptedExtensions),
    Certificate(Certificate),
    CertificateVerify(CertificateVerify),
    Finished(Finished),
    NewSessionTicket(NewSessionTicket),
    KeyUpdate(KeyUpdateRequest),
}

impl HandshakeMessage {
    fn msg_type(&self) -> u8 {
        match self {
            HandshakeMessage::ClientHello(_) => HT_CLIENT_HELLO,
            HandshakeMessage::ServerHello(_) => HT_SERVER_HELLO,
            HandshakeMessage::EncryptedExtensions(_) => HT_ENCRYPTED_EXTENSIONS,
            HandshakeMessage::Certificate(_) => HT_CERTIFICATE,
            HandshakeMessage::CertificateVerify(_) => HT_CERTIFICATE_VERIFY,
            HandshakeMessage::Finished(_) => HT_FINISHED,
            HandshakeMessage::NewSessionTicket(_) => HT_NEW_SESSION_TICKET,
            HandshakeMessage::KeyUpdate(_) => HT_KEY_UPDATE,
        }
    }

    /// Encode the full message, including its type tag and 24-bit length.
    /// The encoded bytes are exactly what gets fed into the transcript hash.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.push_u8(self.msg_type());
        w.block_u24(|w| self.encode_body(w));
        w.into_vec()
    }

    fn encode_body(&self, w: &mut Writer) {
        match self {
            HandshakeMessage::ClientHello(ch) => {
                w.push_u16(LEGACY_VERSION);
                w.push_bytes(&ch.random);
                w.push_vec8(&ch.legacy_session_id);
                w.block_u16(|w| {
                    for cs in &ch.cipher_suites {
                        w.push_u16(*cs);
                    }
                });
                w.push_vec8(&[0]); // legacy_compression_methods: null only
                encode_extensions(&ch.extensions, w);
            }
            HandshakeMessage::ServerHello(sh) => {
                w.push_u16(LEGACY_VERSION);
                w.push_bytes(&sh.random);
                w.push_vec8(&sh.legacy_session_id_echo);
                w.push_u16(sh.cipher_suite);
                w.push_u8(0); // legacy_compression_method
                encode_extensions(&sh.extensions, w);
            }
            HandshakeMessage::EncryptedExtensions(ee) => encode_extensions(&ee.extensions, w),
            HandshakeMessage::Certificate(cert) => {
                w.push_vec8(&cert.certificate_request_context);
                w.block_u24(|w| {
                    for entry in &cert.certificate_list {
                        w.push_vec24(&entry.cert_data);
                        w.push_vec16(&entry.extensions);
                    }
                });
            }
            HandshakeMessage::CertificateVerify(cv) => {
                w.push_u16(cv.algorithm);
                w.push_vec16(&cv.signature);
            }
            HandshakeMessage::Finished(fin) => w.push_bytes(&fin.verify_data),
            HandshakeMessage::NewSessionTicket(nst) => {
                w.push_u32(nst.ticket_lifetime);
                w.push_u32(nst.ticket_age_add);
                w.push_vec8(&nst.ticket_nonce);
                w.push_vec16(&nst.ticket);
                encode_extensions(&nst.extensions, w);
            }
            HandshakeMessage::KeyUpdate(req) => {
                w.push_u8(match req {
                    KeyUpdateRequest::NotRequested => 0,
                    KeyUpdateRequest::Requested => 1,
                });
            }
        }
    }

    /// `finished_len` is the transcript hash length (32 for SHA-256, 48 for
    /// SHA-384), needed to size a `Finished` message's `verify_data`.
    pub fn decode(r: &mut Reader<'_>, finished_len: usize) -> Result<Self> {
        let msg_type = r.pull_u8()?;
        let body = r.pull_vec24()?;
        let mut br = Reader::new(body);
        Ok(match msg_type {
            HT_CLIENT_HELLO => {
                br.pull_u16()?; // legacy_version
                let mut random = [0u8; 32];
                random.copy_from_slice(br.pull_bytes(32)?);
                let legacy_session_id = br.pull_vec8()?.to_vec();
                let cs_raw = br.pull_vec16()?;
                let mut csr = Reader::new(cs_raw);
                let mut cipher_suites = Vec::new();
                while !csr.is_empty() {
                    cipher_suites.push(csr.pull_u16()?);
                }
                br.pull_vec8()?; // legacy_compression_methods
                let extensions = decode_extensions(&mut br, true)?;
                HandshakeMessage::ClientHello(ClientHello {
                    random,
                    legacy_session_id,
                    cipher_suites,
                    extensions,
                })
            }
            HT_SERVER_HELLO => {
                br.pull_u16()?;
                let mut random = [0u8; 32];
                random.copy_from_slice(br.pull_bytes(32)?);
                let legacy_session_id_echo = br.pull_vec8()?.to_vec();
                let cipher_suite = br.pull_u16()?;
                br.pull_u8()?; // legacy_compression_method
                let extensions = decode_extensions(&mut br, false)?;
                HandshakeMessage::ServerHello(ServerHello {
                    random,
                    legacy_session_id_echo,
                    cipher_suite,
                    extensions,
                })
            }
            HT_ENCRYPTED_EXTENSIONS => {
                let extensions = decode_extensions(&mut br, false)?;
                HandshakeMessage::EncryptedExtensions(EncryptedExtensions { extensions })
            }
            HT_CERTIFICATE => {
                let certificate_request_context = br.pull_vec8()?.to_vec();
                let list_raw = br.pull_vec24()?;
                let mut lr = Reader::new(list_raw);
                let mut certificate_list = Vec::new();
                while !lr.is_empty() {
                    let cert_data = lr.pull_vec24()?.to_vec();
                    let extensions = lr.pull_vec16()?.to_vec();
                    certificate_list.push(CertificateEntry { cert_data, extensions });
                }
                HandshakeMessage::Certificate(Certificate {
                    certificate_request_context,
                    certificate_list,
                })
            }
            HT_CERTIFICATE_VERIFY => {
                let algorithm = br.pull_u16()?;
                let signature = br.pull_vec16()?.to_vec();
                HandshakeMessage::CertificateVerify(CertificateVerify { algorithm, signature })
            }
            HT_FINISHED => {
                let verify_data = br.pull_bytes(finished_len)?.to_vec();
                HandshakeMessage::Finished(Finished { verify_data })
            }
            HT_NEW_SESSION_TICKET => {
                let ticket_lifetime = br.pull_u32()?;
                let ticket_age_add = br.pull_u32()?;
                let ticket_nonce = br.pull_vec8()?.to_vec();
                let ticket = br.pull_vec16()?.to_vec();
                let extensions = decode_extensions(&mut br, false)?;
                HandshakeMessage::NewSessionTicket(NewSessionTicket {
                    ticket_lifetime,
                    ticket_age_add,
                    ticket_nonce,
                    ticket,
                    extensions,
                })
            }
            HT_KEY_UPDATE => {
                let req = match br.pull_u8()? {
                    0 => KeyUpdateRequest::NotRequested,
                    _ => KeyUpdateRequest::Requested,
                };
                HandshakeMessage::KeyUpdate(req)
            }
            _ => return Err(Error::Malformed("unknown handshake message type")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::extensions::{Extension, GROUP_SECP256R1};

    #[test]
    fn client_hello_round_trips() {
        let ch = HandshakeMessage::ClientHello(ClientHello {
            random: [7u8; 32],
            legacy_session_id: vec![],
            cipher_suites: vec![0x1301],
            extensions: vec![
                Extension::SupportedVersions(vec![TLS1_3_VERSION]),
                Extension::KeyShareClient(vec![crate::tls::extensions::KeyShareEntry {
                    group: GROUP_SECP256R1,
                    key_exchange: vec![1, 2, 3],
                }]),
            ],
        });
        let encoded = ch.encode();
        let mut r = Reader::new(&encoded);
        let decoded = HandshakeMessage::decode(&mut r, 32).unwrap();
        match decoded {
            HandshakeMessage::ClientHello(decoded_ch) => {
                assert_eq!(decoded_ch.random, [7u8; 32]);
                assert_eq!(decoded_ch.cipher_suites, vec![0x1301]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn finished_round_trips_with_hash_len() {
        let fin = HandshakeMessage::Finished(Finished {
            verify_data: vec![0xaa; 32],
        });
        let encoded = fin.encode();
        let mut r = Reader::new(&encoded);
        let decoded = HandshakeMessage::decode(&mut r, 32).unwrap();
        match decoded {
            HandshakeMessage::Finished(f) => assert_eq!(f.verify_data, vec![0xaa; 32]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn key_update_round_trips() {
        let ku = HandshakeMessage::KeyUpdate(KeyUpdateRequest::Requested);
        let encoded = ku.encode();
        let mut r = Reader::new(&encoded);
        match HandshakeMessage::decode(&mut r, 32).unwrap() {
            HandshakeMessage::KeyUpdate(KeyUpdateRequest::Requested) => {}
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn certificate_round_trips() {
        let cert = HandshakeMessage::Certificate(Certificate {
            certificate_request_context: vec![],
            certificate_list: vec![CertificateEntry {
                cert_data: vec![0xde, 0xad, 0xbe, 0xef],
                extensions: vec![],
            }],
        });
        let encoded = cert.encode();
        let mut r = Reader::new(&encoded);
        match HandshakeMessage::decode(&mut r, 32).unwrap() {
            HandshakeMessage::Certificate(c) => {
                assert_eq!(c.certificate_list[0].cert_data, vec![0xde, 0xad, 0xbe, 0xef]);
            }
            _ => panic!("wrong variant"),
        }
    }
}
