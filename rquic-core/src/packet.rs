//! QUIC packet headers (spec.md Section 3/4.2)
//!
//! Long headers (Initial/0-RTT/Handshake/Retry), the short (1-RTT) header,
//! and Version Negotiation. Packet-number and payload encryption live in
//! `crypto::pair`; this module only handles the cleartext header fields
//! that surround them, plus the retry integrity tag (RFC 9001 Section 5.8).

use subtle::ConstantTimeEq;

use crate::buffer::{Reader, Writer};
use crate::cid::ConnectionId;
use crate::crypto::pair::Epoch;
use crate::crypto::provider::{CipherSuite, CryptoProvider};
use crate::error::{BufferError, CryptoError, Error, Result};

pub const LONG_HEADER_FORM: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;
pub const SHORT_HEADER_SPIN_BIT: u8 = 0x20;
pub const SHORT_HEADER_KEY_PHASE_BIT: u8 = 0x04;

/// The fixed AEAD key/nonce used for the retry integrity tag (RFC 9001
/// Section 5.8). Unlike every other packet-protection key, these are not
/// derived from any connection secret; they are constants of the wire
/// version itself.
const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];
const RETRY_INTEGRITY_NONCE: [u8; 12] = [0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongPacketType {
    pub fn bits(self) -> u8 {
        match self {
            LongPacketType::Initial => 0x0,
            LongPacketType::ZeroRtt => 0x1,
            LongPacketType::Handshake => 0x2,
            LongPacketType::Retry => 0x3,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits & 0x3 {
            0x0 => LongPacketType::Initial,
            0x1 => LongPacketType::ZeroRtt,
            0x2 => LongPacketType::Handshake,
            0x3 => LongPacketType::Retry,
            _ => unreachable!(),
        })
    }

    /// The encryption epoch this packet type belongs to, or `None` for
    /// Retry, which carries no protected payload.
    pub fn epoch(self) -> Option<Epoch> {
        match self {
            LongPacketType::Initial => Some(Epoch::Initial),
            LongPacketType::ZeroRtt => Some(Epoch::ZeroRtt),
            LongPacketType::Handshake => Some(Epoch::Handshake),
            LongPacketType::Retry => None,
        }
    }
}

/// True if `buf`'s first byte marks a long-header packet. Errs if `buf` is
/// empty.
pub fn peek_is_long_header(buf: &[u8]) -> Result<bool> {
    let first = *buf.first().ok_or(Error::Buffer(BufferError::Read))?;
    Ok(first & LONG_HEADER_FORM != 0)
}

/// Reads the long-header packet type without consuming anything, for
/// deciding whether to route to `decode_long_header` or `RetryPacket::decode`.
pub fn peek_long_packet_type(buf: &[u8]) -> Result<LongPacketType> {
    let first = *buf.first().ok_or(Error::Buffer(BufferError::Read))?;
    if first & LONG_HEADER_FORM == 0 {
        return Err(Error::Malformed("not a long header packet"));
    }
    LongPacketType::from_bits(first >> 4)
}

/// The number of bytes needed to encode a packet number given the largest
/// acknowledged packet number seen so far (RFC 9000 Appendix A.2): enough
/// bits to disambiguate it from every packet number not yet acknowledged.
pub fn packet_number_length(full_pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(la) => full_pn.saturating_sub(la).max(1),
        None => full_pn + 1,
    };
    let bits = u64::BITS as usize - (num_unacked * 2 - 1).leading_zeros() as usize;
    bits.div_ceil(8).clamp(1, 4)
}

/// Reserve a 2-byte varint-tagged length field (`0x40xx`), to be backfilled
/// once the packet number and payload following it are known. Caps the
/// packet at 16383 bytes, comfortably above any real datagram.
fn reserve_length_field(w: &mut Writer) -> usize {
    let pos = w.len();
    w.push_u8(0x40);
    w.push_u8(0x00);
    pos
}

fn backfill_length_field(w: &mut Writer, pos: usize, aead_tag_len: usize) {
    let value = (w.len() - pos - 2 + aead_tag_len) as u64;
    assert!(value < 16384, "packet too large for a 2-byte varint length field");
    let buf = w.as_mut_slice();
    buf[pos] = 0x40 | ((value >> 8) as u8);
    buf[pos + 1] = value as u8;
}

/// An Initial, 0-RTT, or Handshake long header (everything but Retry, which
/// has its own shape).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub packet_type: LongPacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Vec<u8>,
}

impl LongHeader {
    /// Encode the header through its reserved length field. Returns
    /// `(length_field_pos, pn_offset)`: the caller pushes the packet number
    /// (`pn_len` bytes) and then the frame payload into the same `Writer`,
    /// and must call `backfill_length_field` before returning the bytes.
    pub fn encode(&self, pn_len: usize, w: &mut Writer) -> (usize, usize) {
        assert!((1..=4).contains(&pn_len));
        assert_ne!(self.packet_type, LongPacketType::Retry, "retry has no packet number");
        let first = LONG_HEADER_FORM | FIXED_BIT | (self.packet_type.bits() << 4) | (pn_len as u8 - 1);
        w.push_u8(first);
        w.push_u32(self.version);
        w.push_u8(self.dcid.len() as u8);
        w.push_bytes(self.dcid.as_slice());
        w.push_u8(self.scid.len() as u8);
        w.push_bytes(self.scid.as_slice());
        if self.packet_type == LongPacketType::Initial {
            w.push_vec_varint(&self.token);
        }
        let length_pos = reserve_length_field(w);
        let pn_offset = w.len();
        (length_pos, pn_offset)
    }

    /// Backfill the length field once the packet number and (still
    /// unencrypted) payload have been appended to `w`. `aead_tag_len` is
    /// added on top, since the Length field must cover the eventual
    /// ciphertext, not the cleartext this is computed from.
    pub fn finish(w: &mut Writer, length_field_pos: usize, aead_tag_len: usize) {
        backfill_length_field(w, length_field_pos, aead_tag_len);
    }
}

/// A decoded Initial/0-RTT/Handshake header, plus where its packet number
/// starts and how many bytes (packet number + payload) follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLongHeader {
    pub packet_type: LongPacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Vec<u8>,
    pub payload_len: usize,
    pub pn_offset: usize,
}

pub fn decode_long_header(r: &mut Reader<'_>) -> Result<DecodedLongHeader> {
    let first = r.pull_u8()?;
    if first & LONG_HEADER_FORM == 0 {
        return Err(Error::Malformed("not a long header packet"));
    }
    let packet_type = LongPacketType::from_bits(first >> 4)?;
    if packet_type == LongPacketType::Retry {
        return Err(Error::Malformed("retry packets decode via RetryPacket::decode"));
    }
    let version = r.pull_u32()?;
    if version == 0 {
        return Err(Error::Malformed("version 0 is a version negotiation packet"));
    }
    let dcid_len = r.pull_u8()? as usize;
    let dcid = ConnectionId::new(r.pull_bytes(dcid_len)?);
    let scid_len = r.pull_u8()? as usize;
    let scid = ConnectionId::new(r.pull_bytes(scid_len)?);
    let token = if packet_type == LongPacketType::Initial {
        r.pull_vec_varint()?.to_vec()
    } else {
        Vec::new()
    };
    let payload_len = r.pull_varint()? as usize;
    let pn_offset = r.pos();
    Ok(DecodedLongHeader {
        packet_type,
        version,
        dcid,
        scid,
        token,
        payload_len,
        pn_offset,
    })
}

/// The 1-RTT short header: just the destination CID, whose length is fixed
/// per connection and known out of band (spec.md Section 4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedShortHeader {
    pub spin_bit: bool,
    pub key_phase: bool,
    pub dcid: ConnectionId,
    pub pn_offset: usize,
}

/// Encode a short header, returning the packet-number offset.
pub fn encode_short_header(dcid: &ConnectionId, spin_bit: bool, key_phase: bool, pn_len: usize, w: &mut Writer) -> usize {
    assert!((1..=4).contains(&pn_len));
    let mut first = FIXED_BIT | (pn_len as u8 - 1);
    if spin_bit {
        first |= SHORT_HEADER_SPIN_BIT;
    }
    if key_phase {
        first |= SHORT_HEADER_KEY_PHASE_BIT;
    }
    w.push_u8(first);
    w.push_bytes(dcid.as_slice());
    w.len()
}

pub fn decode_short_header(r: &mut Reader<'_>, dcid_len: usize) -> Result<DecodedShortHeader> {
    let first = r.pull_u8()?;
    if first & LONG_HEADER_FORM != 0 {
        return Err(Error::Malformed("not a short header packet"));
    }
    let dcid = ConnectionId::new(r.pull_bytes(dcid_len)?);
    let pn_offset = r.pos();
    Ok(DecodedShortHeader {
        spin_bit: first & SHORT_HEADER_SPIN_BIT != 0,
        key_phase: first & SHORT_HEADER_KEY_PHASE_BIT != 0,
        dcid,
        pn_offset,
    })
}

/// A Version Negotiation packet: sent by a server that does not support any
/// version the client offered (spec.md Section 4.2, "Version negotiation").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiationPacket {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub supported_versions: Vec<u32>,
}

impl VersionNegotiationPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.push_u8(LONG_HEADER_FORM);
        w.push_u32(0);
        w.push_u8(self.dcid.len() as u8);
        w.push_bytes(self.dcid.as_slice());
        w.push_u8(self.scid.len() as u8);
        w.push_bytes(self.scid.as_slice());
        for v in &self.supported_versions {
            w.push_u32(*v);
        }
        w.into_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let first = r.pull_u8()?;
        if first & LONG_HEADER_FORM == 0 {
            return Err(Error::Malformed("not a long header packet"));
        }
        let version = r.pull_u32()?;
        if version != 0 {
            return Err(Error::Malformed("not a version negotiation packet"));
        }
        let dcid_len = r.pull_u8()? as usize;
        let dcid = ConnectionId::new(r.pull_bytes(dcid_len)?);
        let scid_len = r.pull_u8()? as usize;
        let scid = ConnectionId::new(r.pull_bytes(scid_len)?);
        let mut supported_versions = Vec::new();
        while !r.is_empty() {
            supported_versions.push(r.pull_u32()?);
        }
        Ok(Self { dcid, scid, supported_versions })
    }
}

fn retry_pseudo_header(original_dcid: &ConnectionId, header_without_tag: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(1 + original_dcid.len() + header_without_tag.len());
    v.push(original_dcid.len() as u8);
    v.extend_from_slice(original_dcid.as_slice());
    v.extend_from_slice(header_without_tag);
    v
}

fn compute_retry_integrity_tag(
    provider: &dyn CryptoProvider,
    original_dcid: &ConnectionId,
    header_without_tag: &[u8],
) -> Result<[u8; 16]> {
    let aad = retry_pseudo_header(original_dcid, header_without_tag);
    let sealed = provider.aead_seal(
        CipherSuite::Aes128GcmSha256,
        &RETRY_INTEGRITY_KEY,
        &RETRY_INTEGRITY_NONCE,
        &aad,
        &[],
    )?;
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&sealed[..16]);
    Ok(tag)
}

/// A Retry packet: carries no packet number or encrypted payload, just a
/// token plus a 16-byte integrity tag binding it to the client's original
/// destination CID (spec.md Section 4.2/9, RFC 9001 Section 5.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPacket {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub retry_token: Vec<u8>,
}

impl RetryPacket {
    pub fn encode(&self, provider: &dyn CryptoProvider, original_dcid: &ConnectionId) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        let first = LONG_HEADER_FORM | FIXED_BIT | (LongPacketType::Retry.bits() << 4);
        w.push_u8(first);
        w.push_u32(self.version);
        w.push_u8(self.dcid.len() as u8);
        w.push_bytes(self.dcid.as_slice());
        w.push_u8(self.scid.len() as u8);
        w.push_bytes(self.scid.as_slice());
        w.push_bytes(&self.retry_token);
        let tag = compute_retry_integrity_tag(provider, original_dcid, w.as_slice())?;
        w.push_bytes(&tag);
        Ok(w.into_vec())
    }

    pub fn decode(provider: &dyn CryptoProvider, buf: &[u8], original_dcid: &ConnectionId) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::Malformed("retry packet too short for its integrity tag"));
        }
        let (header, tag) = buf.split_at(buf.len() - 16);
        let expected = compute_retry_integrity_tag(provider, original_dcid, header)?;
        if expected.ct_eq(tag).unwrap_u8() == 0 {
            return Err(Error::Crypto(CryptoError::Decryption));
        }
        let mut r = Reader::new(header);
        let first = r.pull_u8()?;
        if first & LONG_HEADER_FORM == 0 || LongPacketType::from_bits(first >> 4)? != LongPacketType::Retry {
            return Err(Error::Malformed("not a retry packet"));
        }
        let version = r.pull_u32()?;
        let dcid_len = r.pull_u8()? as usize;
        let dcid = ConnectionId::new(r.pull_bytes(dcid_len)?);
        let scid_len = r.pull_u8()? as usize;
        let scid = ConnectionId::new(r.pull_bytes(scid_len)?);
        let remaining = r.remaining();
        let retry_token = r.pull_bytes(remaining)?.to_vec();
        Ok(Self { version, dcid, scid, retry_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::DefaultCryptoProvider;

    #[test]
    fn long_header_round_trips_with_token() {
        let header = LongHeader {
            packet_type: LongPacketType::Initial,
            version: 0xff00_0014,
            dcid: ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
            scid: ConnectionId::new(&[9, 9, 9, 9]),
            token: vec![0xaa; 8],
        };
        let mut w = Writer::new();
        let (length_pos, pn_offset) = header.encode(2, &mut w);
        assert_eq!(pn_offset, w.len());
        w.push_u16(0x002a);
        w.push_bytes(b"crypto frame bytes go here");
        LongHeader::finish(&mut w, length_pos, 16);

        let mut r = Reader::new(w.as_slice());
        let decoded = decode_long_header(&mut r).unwrap();
        assert_eq!(decoded.packet_type, LongPacketType::Initial);
        assert_eq!(decoded.version, header.version);
        assert_eq!(decoded.dcid, header.dcid);
        assert_eq!(decoded.scid, header.scid);
        assert_eq!(decoded.token, header.token);
        assert_eq!(decoded.pn_offset, pn_offset);
        assert_eq!(decoded.payload_len, 2 + b"crypto frame bytes go here".len() + 16);
    }

    #[test]
    fn short_header_round_trips() {
        let dcid = ConnectionId::new(&[7; 8]);
        let mut w = Writer::new();
        let pn_offset = encode_short_header(&dcid, true, false, 1, &mut w);
        assert_eq!(pn_offset, w.len());
        w.push_u8(0x05);

        let mut r = Reader::new(w.as_slice());
        let decoded = decode_short_header(&mut r, 8).unwrap();
        assert!(decoded.spin_bit);
        assert!(!decoded.key_phase);
        assert_eq!(decoded.dcid, dcid);
    }

    #[test]
    fn version_negotiation_round_trips() {
        let packet = VersionNegotiationPacket {
            dcid: ConnectionId::new(&[1, 2, 3]),
            scid: ConnectionId::new(&[4, 5, 6]),
            supported_versions: vec![0xff00_0014, 0xff00_0013],
        };
        let bytes = packet.encode();
        let decoded = VersionNegotiationPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn retry_packet_round_trips_and_detects_tamper() {
        let provider = DefaultCryptoProvider;
        let original_dcid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
        let retry = RetryPacket {
            version: 0xff00_0014,
            dcid: ConnectionId::new(&[1; 8]),
            scid: ConnectionId::new(&[2; 8]),
            retry_token: b"opaque retry token".to_vec(),
        };
        let bytes = retry.encode(&provider, &original_dcid).unwrap();
        let decoded = RetryPacket::decode(&provider, &bytes, &original_dcid).unwrap();
        assert_eq!(decoded, retry);

        let mut tampered = bytes.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(RetryPacket::decode(&provider, &tampered, &original_dcid).is_err());
    }

    #[test]
    fn packet_number_length_grows_with_unacked_distance() {
        assert_eq!(packet_number_length(0, None), 1);
        assert_eq!(packet_number_length(200, Some(0)), 2);
        assert_eq!(packet_number_length(100_000, Some(0)), 3);
    }
}
