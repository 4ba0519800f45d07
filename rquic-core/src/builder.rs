//! Packet builder (spec.md Section 4.2/9 "Design notes")
//!
//! Assembles one or more packets into a single UDP datagram: multiple
//! epochs coalesce into one datagram as long as each packet keeps its own
//! header and protection. A client's first Initial datagram is padded to
//! at least 1200 bytes (RFC 9000 Section 14.1) to prove the path's MTU
//! before the handshake completes. The output buffer is reused across
//! datagrams rather than reallocated per call.

use crate::buffer::Writer;
use crate::cid::ConnectionId;
use crate::crypto::pair::{encrypt_packet, CryptoContext};
use crate::crypto::provider::{CipherSuite, CryptoProvider};
use crate::error::Result;
use crate::frame::Frame;
use crate::packet::{self, LongHeader, LongPacketType};

/// RFC 9000 Section 14.1: a client's Initial datagrams (and any UDP
/// datagram that coalesces one) must be padded to at least this size.
pub const MIN_INITIAL_DATAGRAM_LEN: usize = 1200;
/// The largest datagram this implementation targets in the absence of a
/// confirmed larger path MTU.
pub const MAX_DATAGRAM_LEN: usize = 1452;

/// Accumulates one datagram's worth of (possibly coalesced) packets.
#[derive(Default)]
pub struct DatagramBuilder {
    out: Vec<u8>,
}

impl DatagramBuilder {
    pub fn new() -> Self {
        Self {
            out: Vec::with_capacity(MAX_DATAGRAM_LEN),
        }
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// How many more bytes can be coalesced before `datagram_limit` (the
    /// path MTU, or `MAX_DATAGRAM_LEN` by default) is reached.
    pub fn remaining(&self, datagram_limit: usize) -> usize {
        datagram_limit.saturating_sub(self.out.len())
    }

    /// Appends one Initial/0-RTT/Handshake packet carrying `frames`,
    /// encrypted under `ctx`'s local (send) keys.
    #[allow(clippy::too_many_arguments)]
    pub fn push_long_packet(
        &mut self,
        provider: &dyn CryptoProvider,
        ctx: &CryptoContext,
        packet_type: LongPacketType,
        version: u32,
        dcid: &ConnectionId,
        scid: &ConnectionId,
        token: &[u8],
        packet_number: u64,
        largest_acked: Option<u64>,
        frames: &[Frame],
    ) -> Result<()> {
        assert_ne!(packet_type, LongPacketType::Retry, "retry packets carry no protected payload");
        let pn_len = packet::packet_number_length(packet_number, largest_acked);
        let mut w = Writer::new();
        let header = LongHeader {
            packet_type,
            version,
            dcid: *dcid,
            scid: *scid,
            token: token.to_vec(),
        };
        let (length_pos, pn_offset) = header.encode(pn_len, &mut w);
        push_packet_number(&mut w, packet_number, pn_len);
        for frame in frames {
            frame.encode(&mut w);
        }
        LongHeader::finish(&mut w, length_pos, CipherSuite::TAG_LEN);
        self.seal_and_append(provider, ctx, &w, pn_offset, pn_len, true, packet_number)
    }

    /// Appends one 1-RTT (short header) packet.
    #[allow(clippy::too_many_arguments)]
    pub fn push_short_packet(
        &mut self,
        provider: &dyn CryptoProvider,
        ctx: &CryptoContext,
        dcid: &ConnectionId,
        spin_bit: bool,
        key_phase: bool,
        packet_number: u64,
        largest_acked: Option<u64>,
        frames: &[Frame],
    ) -> Result<()> {
        let pn_len = packet::packet_number_length(packet_number, largest_acked);
        let mut w = Writer::new();
        let pn_offset = packet::encode_short_header(dcid, spin_bit, key_phase, pn_len, &mut w);
        push_packet_number(&mut w, packet_number, pn_len);
        for frame in frames {
            frame.encode(&mut w);
        }
        self.seal_and_append(provider, ctx, &w, pn_offset, pn_len, false, packet_number)
    }

    fn seal_and_append(
        &mut self,
        provider: &dyn CryptoProvider,
        ctx: &CryptoContext,
        cleartext: &Writer,
        pn_offset: usize,
        pn_len: usize,
        is_long_header: bool,
        packet_number: u64,
    ) -> Result<()> {
        let bytes = cleartext.as_slice();
        let (header_bytes, payload_bytes) = bytes.split_at(pn_offset + pn_len);
        let encrypted = encrypt_packet(
            provider,
            &ctx.local.keys,
            packet_number,
            pn_offset,
            pn_len,
            is_long_header,
            header_bytes,
            payload_bytes,
        )?;
        self.out.extend_from_slice(&encrypted);
        Ok(())
    }

    /// Pad the datagram with zero bytes up to `len` (RFC 9000 Section 14.1).
    /// Zero bytes after a long-header packet's length-delimited payload
    /// decode as PADDING frames, which is exactly what a trailing pad
    /// needs to be.
    pub fn pad_to(&mut self, len: usize) {
        if self.out.len() < len {
            self.out.resize(len, 0);
        }
    }

    /// Take the assembled datagram bytes, leaving the builder's backing
    /// buffer allocated and empty for the next datagram (spec.md Section 9).
    pub fn take(&mut self) -> Vec<u8> {
        let datagram = self.out.clone();
        self.out.clear();
        datagram
    }
}

fn push_packet_number(w: &mut Writer, pn: u64, pn_len: usize) {
    match pn_len {
        1 => w.push_u8(pn as u8),
        2 => w.push_u16(pn as u16),
        3 => w.push_u24(pn as u32),
        4 => w.push_u32(pn as u32),
        _ => unreachable!("packet_number_length never returns outside 1..=4"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pair::Side;
    use crate::crypto::provider::DefaultCryptoProvider;
    use crate::frame::Frame;
    use hex_literal::hex;

    #[test]
    fn long_packet_round_trips_through_decrypt() {
        let provider = DefaultCryptoProvider;
        let dcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let scid = ConnectionId::new(&[1, 2, 3, 4]);
        let client = CryptoContext::initial(&provider, Side::Client, dcid.as_slice());
        let server = CryptoContext::initial(&provider, Side::Server, dcid.as_slice());

        let mut builder = DatagramBuilder::new();
        builder
            .push_long_packet(
                &provider,
                &client,
                LongPacketType::Initial,
                0xff00_0014,
                &dcid,
                &scid,
                &[],
                0,
                None,
                &[Frame::Crypto { offset: 0, data: vec![0xaa; 32] }],
            )
            .unwrap();
        builder.pad_to(MIN_INITIAL_DATAGRAM_LEN);
        let datagram = builder.take();
        assert!(datagram.len() >= MIN_INITIAL_DATAGRAM_LEN);
        assert!(builder.is_empty());

        let mut r = crate::buffer::Reader::new(&datagram);
        let decoded = packet::decode_long_header(&mut r).unwrap();
        assert_eq!(decoded.packet_type, LongPacketType::Initial);
        let mut buf = datagram[..decoded.pn_offset + decoded.payload_len].to_vec();
        let (pn, plaintext) =
            crate::crypto::pair::decrypt_packet(&provider, &server.remote.keys, &mut buf, decoded.pn_offset, true, 0)
                .unwrap();
        assert_eq!(pn, 0);
        let mut fr = crate::buffer::Reader::new(&plaintext);
        assert_eq!(Frame::decode(&mut fr).unwrap(), Frame::Crypto { offset: 0, data: vec![0xaa; 32] });
    }

    #[test]
    fn coalesced_packets_share_one_datagram() {
        let provider = DefaultCryptoProvider;
        let dcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let scid = ConnectionId::new(&[1, 2, 3, 4]);
        let ctx = CryptoContext::initial(&provider, Side::Client, dcid.as_slice());

        let mut builder = DatagramBuilder::new();
        builder
            .push_long_packet(
                &provider,
                &ctx,
                LongPacketType::Initial,
                0xff00_0014,
                &dcid,
                &scid,
                &[],
                0,
                None,
                &[Frame::Ping],
            )
            .unwrap();
        let after_first = builder.len();
        builder
            .push_long_packet(
                &provider,
                &ctx,
                LongPacketType::Initial,
                0xff00_0014,
                &dcid,
                &scid,
                &[],
                1,
                None,
                &[Frame::Ping],
            )
            .unwrap();
        assert!(builder.len() > after_first);
    }
}
