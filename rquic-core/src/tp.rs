//! QUIC transport parameters (spec.md Section 4.3/6, draft-19/20 wire
//! numbering)
//!
//! Each parameter is a varint identifier, a varint length, and that many
//! bytes of value — the same varint-TLV shape draft-19/20 specifies (RFC
//! 9000 Section 18 keeps the identifiers but moves to a flatter encoding;
//! this crate speaks the draft wire format it targets).

use crate::buffer::{Reader, Writer};
use crate::cid::ConnectionId;
use crate::config::TransportParams;
use crate::error::{Error, Result};

const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x0005;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x0006;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x0007;
const PARAM_INITIAL_MAX_DATA: u64 = 0x0004;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x0008;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x0009;
const PARAM_ACK_DELAY_EXPONENT: u64 = 0x000a;
const PARAM_MAX_ACK_DELAY: u64 = 0x000b;
const PARAM_IDLE_TIMEOUT: u64 = 0x0001;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x000e;
const PARAM_INITIAL_SOURCE_CONNECTION_ID: u64 = 0x000f;

/// `TransportParams` plus the one CID-typed parameter a peer's transport
/// parameters also need to carry: the source connection ID it put on its
/// very first packet, so the receiving endpoint can bind it to the
/// connection it already opened.
pub fn encode(params: &TransportParams, initial_source_cid: &ConnectionId) -> Vec<u8> {
    let mut w = Writer::new();
    push_varint_param(&mut w, PARAM_INITIAL_MAX_DATA, params.initial_max_data);
    push_varint_param(
        &mut w,
        PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
        params.initial_max_stream_data_bidi_local,
    );
    push_varint_param(
        &mut w,
        PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
        params.initial_max_stream_data_bidi_remote,
    );
    push_varint_param(&mut w, PARAM_INITIAL_MAX_STREAM_DATA_UNI, params.initial_max_stream_data_uni);
    push_varint_param(&mut w, PARAM_INITIAL_MAX_STREAMS_BIDI, params.initial_max_streams_bidi);
    push_varint_param(&mut w, PARAM_INITIAL_MAX_STREAMS_UNI, params.initial_max_streams_uni);
    push_varint_param(&mut w, PARAM_ACK_DELAY_EXPONENT, params.ack_delay_exponent as u64);
    push_varint_param(&mut w, PARAM_MAX_ACK_DELAY, params.max_ack_delay_ms);
    push_varint_param(&mut w, PARAM_IDLE_TIMEOUT, params.idle_timeout_ms);
    push_varint_param(&mut w, PARAM_ACTIVE_CONNECTION_ID_LIMIT, params.active_connection_id_limit);

    w.push_varint(PARAM_INITIAL_SOURCE_CONNECTION_ID);
    w.push_varint(initial_source_cid.len() as u64);
    w.push_bytes(initial_source_cid.as_slice());
    w.into_vec()
}

fn push_varint_param(w: &mut Writer, id: u64, value: u64) {
    w.push_varint(id);
    let mut body = Writer::new();
    body.push_varint(value);
    w.push_varint(body.len() as u64);
    w.push_bytes(body.as_slice());
}

/// Decode a peer's transport parameters, starting from `defaults` for any
/// parameter the peer omitted (a peer is free to not send a parameter whose
/// default it intends to keep, per spec.md Section 4.3).
pub fn decode(bytes: &[u8], defaults: TransportParams) -> Result<(TransportParams, Option<ConnectionId>)> {
    let mut params = defaults;
    let mut initial_source_cid = None;
    let mut r = Reader::new(bytes);
    while !r.is_empty() {
        let id = r.pull_varint()?;
        let len = r.pull_varint()? as usize;
        let value = r.pull_bytes(len)?;
        match id {
            PARAM_INITIAL_MAX_DATA => params.initial_max_data = parse_varint_value(value)?,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                params.initial_max_stream_data_bidi_local = parse_varint_value(value)?
            }
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                params.initial_max_stream_data_bidi_remote = parse_varint_value(value)?
            }
            PARAM_INITIAL_MAX_STREAM_DATA_UNI => params.initial_max_stream_data_uni = parse_varint_value(value)?,
            PARAM_INITIAL_MAX_STREAMS_BIDI => params.initial_max_streams_bidi = parse_varint_value(value)?,
            PARAM_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = parse_varint_value(value)?,
            PARAM_ACK_DELAY_EXPONENT => params.ack_delay_exponent = parse_varint_value(value)? as u8,
            PARAM_MAX_ACK_DELAY => params.max_ack_delay_ms = parse_varint_value(value)?,
            PARAM_IDLE_TIMEOUT => params.idle_timeout_ms = parse_varint_value(value)?,
            PARAM_ACTIVE_CONNECTION_ID_LIMIT => params.active_connection_id_limit = parse_varint_value(value)?,
            PARAM_INITIAL_SOURCE_CONNECTION_ID => initial_source_cid = Some(ConnectionId::new(value)),
            _ => {} // unknown parameters are ignored, per spec.md Section 4.3
        }
    }
    Ok((params, initial_source_cid))
}

fn parse_varint_value(value: &[u8]) -> Result<u64> {
    let mut r = Reader::new(value);
    r.pull_varint().map_err(|_| Error::Malformed("transport parameter value not a valid varint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_params_round_trip_with_initial_source_cid() {
        let params = TransportParams {
            initial_max_data: 12345,
            initial_max_streams_bidi: 7,
            ..TransportParams::default()
        };
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = encode(&params, &cid);
        let (decoded, decoded_cid) = decode(&bytes, TransportParams::default()).unwrap();
        assert_eq!(decoded.initial_max_data, 12345);
        assert_eq!(decoded.initial_max_streams_bidi, 7);
        assert_eq!(decoded.idle_timeout_ms, TransportParams::default().idle_timeout_ms);
        assert_eq!(decoded_cid, Some(cid));
    }

    #[test]
    fn unknown_parameter_is_ignored() {
        let mut w = Writer::new();
        w.push_varint(0xbeef);
        w.push_varint(3);
        w.push_bytes(&[1, 2, 3]);
        let (params, cid) = decode(w.as_slice(), TransportParams::default()).unwrap();
        assert_eq!(params.initial_max_data, TransportParams::default().initial_max_data);
        assert_eq!(cid, None);
    }
}
