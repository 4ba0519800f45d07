//! TLS 1.3 extensions
//!
//! Parsing and building of the extension set this driver actually speaks:
//! supported_versions, supported_groups, signature_algorithms, key_share,
//! ALPN, the QUIC transport parameters extension, and the PSK/early-data
//! pair needed for session resumption (spec.md Section 4.3, SPEC_FULL.md
//! Section 4.3 session ticket addendum).

use crate::buffer::{Reader, Writer};
use crate::error::{Error, Result};

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_ALPN: u16 = 16;
pub const EXT_EARLY_DATA: u16 = 42;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 45;
pub const EXT_KEY_SHARE: u16 = 51;
pub const EXT_PRE_SHARED_KEY: u16 = 41;
/// QUIC transport parameters, draft range (spec.md Section 4.3).
pub const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 0xffa5;

/// The named group a key share is offered over. This driver only ever
/// offers/accepts `Secp256r1` (spec.md Section 4.3).
pub const GROUP_SECP256R1: u16 = 0x0017;

/// Signature algorithms this driver advertises and will accept in a
/// CertificateVerify (spec.md Section 4.3).
pub const SIG_RSA_PSS_RSAE_SHA256: u16 = 0x0804;
pub const SIG_ECDSA_SECP256R1_SHA256: u16 = 0x0403;
pub const SIG_RSA_PKCS1_SHA256: u16 = 0x0401;
pub const SIG_RSA_PKCS1_SHA1: u16 = 0x0201;

#[derive(Debug, Clone)]
pub struct KeyShareEntry {
    pub group: u16,
    pub key_exchange: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Extension {
    SupportedVersions(Vec<u16>),
    SupportedVersionsSelected(u16),
    SupportedGroups(Vec<u16>),
    SignatureAlgorithms(Vec<u16>),
    KeyShareClient(Vec<KeyShareEntry>),
    KeyShareServer(KeyShareEntry),
    Alpn(Vec<String>),
    QuicTransportParameters(Vec<u8>),
    EarlyData,
    PskKeyExchangeModes(Vec<u8>),
    /// Opaque PSK identity (the session ticket bytes). This driver skips the
    /// binder list RFC 8446 Section 4.2.11 requires and carries only the
    /// identity, matching the simplified resumption scheme SPEC_FULL.md
    /// Section 4.3 describes.
    PreSharedKey(Vec<u8>),
    Unknown(u16, Vec<u8>),
}

impl Extension {
    fn ext_type(&self) -> u16 {
        match self {
            Extension::SupportedVersions(_) | Extension::SupportedVersionsSelected(_) => {
                EXT_SUPPORTED_VERSIONS
            }
            Extension::SupportedGroups(_) => EXT_SUPPORTED_GROUPS,
            Extension::SignatureAlgorithms(_) => EXT_SIGNATURE_ALGORITHMS,
            Extension::KeyShareClient(_) | Extension::KeyShareServer(_) => EXT_KEY_SHARE,
            Extension::Alpn(_) => EXT_ALPN,
            Extension::QuicTransportParameters(_) => EXT_QUIC_TRANSPORT_PARAMETERS,
            Extension::EarlyData => EXT_EARLY_DATA,
            Extension::PskKeyExchangeModes(_) => EXT_PSK_KEY_EXCHANGE_MODES,
            Extension::PreSharedKey(_) => EXT_PRE_SHARED_KEY,
            Extension::Unknown(t, _) => *t,
        }
    }

    fn encode_body(&self, w: &mut Writer) {
        match self {
            Extension::SupportedVersions(versions) => {
                w.push_u8((versions.len() * 2) as u8);
                for v in versions {
                    w.push_u16(*v);
                }
            }
            Extension::SupportedVersionsSelected(v) => w.push_u16(*v),
            Extension::SupportedGroups(groups) => {
                w.block_u16(|w| {
                    for g in groups {
                        w.push_u16(*g);
                    }
                });
            }
            Extension::SignatureAlgorithms(algs) => {
                w.block_u16(|w| {
                    for a in algs {
                        w.push_u16(*a);
                    }
                });
            }
            Extension::KeyShareClient(entries) => {
                w.block_u16(|w| {
                    for e in entries {
                        w.push_u16(e.group);
                        w.push_vec16(&e.key_exchange);
                    }
                });
            }
            Extension::KeyShareServer(entry) => {
                w.push_u16(entry.group);
                w.push_vec16(&entry.key_exchange);
            }
            Extension::Alpn(protocols) => {
                w.block_u16(|w| {
                    for p in protocols {
                        w.push_vec8(p.as_bytes());
                    }
                });
            }
            Extension::QuicTransportParameters(bytes) => w.push_bytes(bytes),
            Extension::EarlyData => {}
            Extension::PskKeyExchangeModes(modes) => w.push_vec8(modes),
            Extension::PreSharedKey(identity) => w.push_vec16(identity),
            Extension::Unknown(_, bytes) => w.push_bytes(bytes),
        }
    }

    pub fn encode(&self, w: &mut Writer) {
        w.push_u16(self.ext_type());
        w.block_u16(|w| self.encode_body(w));
    }

    /// Decode a single extension given its type and raw body bytes. The
    /// "client vs server" shape ambiguity for key_share/supported_versions
    /// is resolved by `is_client_message`, matching which message type is
    /// being parsed (ClientHello vs ServerHello/HelloRetryRequest).
    pub fn decode(ext_type: u16, body: &[u8], is_client_message: bool) -> Result<Self> {
        let mut r = Reader::new(body);
        Ok(match ext_type {
            EXT_SUPPORTED_VERSIONS if is_client_message => {
                let len = r.pull_u8()? as usize;
                let raw = r.pull_bytes(len)?;
                let mut versions = Vec::with_capacity(len / 2);
                let mut vr = Reader::new(raw);
                while !vr.is_empty() {
                    versions.push(vr.pull_u16()?);
                }
                Extension::SupportedVersions(versions)
            }
            EXT_SUPPORTED_VERSIONS => Extension::SupportedVersionsSelected(r.pull_u16()?),
            EXT_SUPPORTED_GROUPS => {
                let raw = r.pull_vec16()?;
                let mut vr = Reader::new(raw);
                let mut groups = Vec::new();
                while !vr.is_empty() {
                    groups.push(vr.pull_u16()?);
                }
                Extension::SupportedGroups(groups)
            }
            EXT_SIGNATURE_ALGORITHMS => {
                let raw = r.pull_vec16()?;
                let mut vr = Reader::new(raw);
                let mut algs = Vec::new();
                while !vr.is_empty() {
                    algs.push(vr.pull_u16()?);
                }
                Extension::SignatureAlgorithms(algs)
            }
            EXT_KEY_SHARE if is_client_message => {
                let raw = r.pull_vec16()?;
                let mut vr = Reader::new(raw);
                let mut entries = Vec::new();
                while !vr.is_empty() {
                    let group = vr.pull_u16()?;
                    let key_exchange = vr.pull_vec16()?.to_vec();
                    entries.push(KeyShareEntry { group, key_exchange });
                }
                Extension::KeyShareClient(entries)
            }
            EXT_KEY_SHARE => {
                let group = r.pull_u16()?;
                let key_exchange = r.pull_vec16()?.to_vec();
                Extension::KeyShareServer(KeyShareEntry { group, key_exchange })
            }
            EXT_ALPN => {
                let raw = r.pull_vec16()?;
                let mut vr = Reader::new(raw);
                let mut protocols = Vec::new();
                while !vr.is_empty() {
                    let proto = vr.pull_vec8()?;
                    protocols.push(
                        std::str::from_utf8(proto)
                            .map_err(|_| Error::Malformed("alpn protocol not utf-8"))?
                            .to_string(),
                    );
                }
                Extension::Alpn(protocols)
            }
            EXT_QUIC_TRANSPORT_PARAMETERS => Extension::QuicTransportParameters(body.to_vec()),
            EXT_EARLY_DATA => Extension::EarlyData,
            EXT_PSK_KEY_EXCHANGE_MODES => Extension::PskKeyExchangeModes(r.pull_vec8()?.to_vec()),
            EXT_PRE_SHARED_KEY => Extension::PreSharedKey(r.pull_vec16()?.to_vec()),
            other => Extension::Unknown(other, body.to_vec()),
        })
    }
}

pub fn encode_extensions(extensions: &[Extension], w: &mut Writer) {
    w.block_u16(|w| {
        for ext in extensions {
            ext.encode(w);
        }
    });
}

pub fn decode_extensions(r: &mut Reader<'_>, is_client_message: bool) -> Result<Vec<Extension>> {
    let raw = r.pull_vec16()?;
    let mut er = Reader::new(raw);
    let mut out = Vec::new();
    while !er.is_empty() {
        let ext_type = er.pull_u16()?;
        let body = er.pull_vec16()?;
        out.push(Extension::decode(ext_type, body, is_client_message)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_round_trips() {
        let exts = vec![Extension::Alpn(vec!["h3".to_string(), "h3-29".to_string()])];
        let mut w = Writer::new();
        encode_extensions(&exts, &mut w);
        let mut r = Reader::new(w.as_slice());
        let decoded = decode_extensions(&mut r, true).unwrap();
        match &decoded[0] {
            Extension::Alpn(protos) => assert_eq!(protos, &["h3", "h3-29"]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_key_share_round_trips() {
        let exts = vec![Extension::KeyShareClient(vec![KeyShareEntry {
            group: GROUP_SECP256R1,
            key_exchange: vec![1, 2, 3, 4],
        }])];
        let mut w = Writer::new();
        encode_extensions(&exts, &mut w);
        let mut r = Reader::new(w.as_slice());
        let decoded = decode_extensions(&mut r, true).unwrap();
        match &decoded[0] {
            Extension::KeyShareClient(entries) => {
                assert_eq!(entries[0].group, GROUP_SECP256R1);
                assert_eq!(entries[0].key_exchange, vec![1, 2, 3, 4]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_key_share_round_trips() {
        let exts = vec![Extension::KeyShareServer(KeyShareEntry {
            group: GROUP_SECP256R1,
            key_exchange: vec![9, 9, 9],
        })];
        let mut w = Writer::new();
        encode_extensions(&exts, &mut w);
        let mut r = Reader::new(w.as_slice());
        let decoded = decode_extensions(&mut r, false).unwrap();
        match &decoded[0] {
            Extension::KeyShareServer(entry) => assert_eq!(entry.key_exchange, vec![9, 9, 9]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn quic_transport_parameters_round_trip_opaque_bytes() {
        let exts = vec![Extension::QuicTransportParameters(vec![0xde, 0xad, 0xbe, 0xef])];
        let mut w = Writer::new();
        encode_extensions(&exts, &mut w);
        let mut r = Reader::new(w.as_slice());
        let decoded = decode_extensions(&mut r, true).unwrap();
        match &decoded[0] {
            Extension::QuicTransportParameters(bytes) => assert_eq!(bytes, &[0xde, 0xad, 0xbe, 0xef]),
            _ => panic!("wrong variant"),
        }
    }
}
