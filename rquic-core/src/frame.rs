//! QUIC frames (spec.md Section 3/4.4)
//!
//! Each frame type is a tagged variant; `STREAM` and `ACK` carry the bulk of
//! the bit-packed encoding (optional offset/length fields, ACK ranges).

use crate::buffer::{varint_len, Reader, Writer};
use crate::cid::ConnectionId;
use crate::error::{BufferError, Error, Result};

const TYPE_PADDING: u64 = 0x00;
const TYPE_PING: u64 = 0x01;
const TYPE_ACK: u64 = 0x02;
const TYPE_ACK_ECN: u64 = 0x03;
const TYPE_RESET_STREAM: u64 = 0x04;
const TYPE_STOP_SENDING: u64 = 0x05;
const TYPE_CRYPTO: u64 = 0x06;
const TYPE_NEW_TOKEN: u64 = 0x07;
const TYPE_STREAM_MIN: u64 = 0x08;
const TYPE_STREAM_MAX: u64 = 0x0f;
const TYPE_MAX_DATA: u64 = 0x10;
const TYPE_MAX_STREAM_DATA: u64 = 0x11;
const TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
const TYPE_MAX_STREAMS_UNI: u64 = 0x13;
const TYPE_DATA_BLOCKED: u64 = 0x14;
const TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
const TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
const TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
const TYPE_NEW_CONNECTION_ID: u64 = 0x18;
const TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
const TYPE_PATH_CHALLENGE: u64 = 0x1a;
const TYPE_PATH_RESPONSE: u64 = 0x1b;
const TYPE_CONNECTION_CLOSE: u64 = 0x1c;
const TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
const TYPE_HANDSHAKE_DONE: u64 = 0x1e;

/// One contiguous range of acknowledged packet numbers, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub smallest: u64,
    pub largest: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub fin: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub seq: u64,
    pub retire_prior_to: u64,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    Ping,
    Ack {
        ranges: Vec<AckRange>,
        ack_delay: u64,
        ecn_counts: Option<(u64, u64, u64)>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
    NewToken {
        token: Vec<u8>,
    },
    Stream(StreamFrame),
    MaxData(u64),
    MaxStreamData {
        stream_id: u64,
        max_data: u64,
    },
    MaxStreamsBidi(u64),
    MaxStreamsUni(u64),
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: u64,
        max_data: u64,
    },
    StreamsBlockedBidi(u64),
    StreamsBlockedUni(u64),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(u64),
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        reason: String,
        is_application: bool,
    },
    HandshakeDone,
}

impl Frame {
    pub fn encode(&self, w: &mut Writer) {
        match self {
            Frame::Padding => w.push_varint(TYPE_PADDING),
            Frame::Ping => w.push_varint(TYPE_PING),
            Frame::Ack { ranges, ack_delay, ecn_counts } => {
                w.push_varint(if ecn_counts.is_some() { TYPE_ACK_ECN } else { TYPE_ACK });
                let largest = ranges.first().map(|r| r.largest).unwrap_or(0);
                w.push_varint(largest);
                w.push_varint(*ack_delay);
                w.push_varint((ranges.len() - 1) as u64);
                w.push_varint(largest - ranges.first().map(|r| r.smallest).unwrap_or(largest));
                let mut prev_smallest = ranges.first().map(|r| r.smallest).unwrap_or(0);
                for range in ranges.iter().skip(1) {
                    let gap = prev_smallest.saturating_sub(range.largest) - 2;
                    w.push_varint(gap);
                    w.push_varint(range.largest - range.smallest);
                    prev_smallest = range.smallest;
                }
                if let Some((ect0, ect1, ce)) = ecn_counts {
                    w.push_varint(*ect0);
                    w.push_varint(*ect1);
                    w.push_varint(*ce);
                }
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                w.push_varint(TYPE_RESET_STREAM);
                w.push_varint(*stream_id);
                w.push_varint(*error_code);
                w.push_varint(*final_size);
            }
            Frame::StopSending { stream_id, error_code } => {
                w.push_varint(TYPE_STOP_SENDING);
                w.push_varint(*stream_id);
                w.push_varint(*error_code);
            }
            Frame::Crypto { offset, data } => {
                w.push_varint(TYPE_CRYPTO);
                w.push_varint(*offset);
                w.push_vec_varint(data);
            }
            Frame::NewToken { token } => {
                w.push_varint(TYPE_NEW_TOKEN);
                w.push_vec_varint(token);
            }
            Frame::Stream(sf) => {
                let has_offset = sf.offset != 0;
                let mut ty = TYPE_STREAM_MIN | 0x02; // LEN bit always set: explicit length
                if has_offset {
                    ty |= 0x04;
                }
                if sf.fin {
                    ty |= 0x01;
                }
                w.push_varint(ty);
                w.push_varint(sf.stream_id);
                if has_offset {
                    w.push_varint(sf.offset);
                }
                w.push_vec_varint(&sf.data);
            }
            Frame::MaxData(v) => {
                w.push_varint(TYPE_MAX_DATA);
                w.push_varint(*v);
            }
            Frame::MaxStreamData { stream_id, max_data } => {
                w.push_varint(TYPE_MAX_STREAM_DATA);
                w.push_varint(*stream_id);
                w.push_varint(*max_data);
            }
            Frame::MaxStreamsBidi(v) => {
                w.push_varint(TYPE_MAX_STREAMS_BIDI);
                w.push_varint(*v);
            }
            Frame::MaxStreamsUni(v) => {
                w.push_varint(TYPE_MAX_STREAMS_UNI);
                w.push_varint(*v);
            }
            Frame::DataBlocked(v) => {
                w.push_varint(TYPE_DATA_BLOCKED);
                w.push_varint(*v);
            }
            Frame::StreamDataBlocked { stream_id, max_data } => {
                w.push_varint(TYPE_STREAM_DATA_BLOCKED);
                w.push_varint(*stream_id);
                w.push_varint(*max_data);
            }
            Frame::StreamsBlockedBidi(v) => {
                w.push_varint(TYPE_STREAMS_BLOCKED_BIDI);
                w.push_varint(*v);
            }
            Frame::StreamsBlockedUni(v) => {
                w.push_varint(TYPE_STREAMS_BLOCKED_UNI);
                w.push_varint(*v);
            }
            Frame::NewConnectionId(f) => {
                w.push_varint(TYPE_NEW_CONNECTION_ID);
                w.push_varint(f.seq);
                w.push_varint(f.retire_prior_to);
                w.push_u8(f.connection_id.len() as u8);
                w.push_bytes(f.connection_id.as_slice());
                w.push_bytes(&f.stateless_reset_token);
            }
            Frame::RetireConnectionId(seq) => {
                w.push_varint(TYPE_RETIRE_CONNECTION_ID);
                w.push_varint(*seq);
            }
            Frame::PathChallenge(data) => {
                w.push_varint(TYPE_PATH_CHALLENGE);
                w.push_bytes(data);
            }
            Frame::PathResponse(data) => {
                w.push_varint(TYPE_PATH_RESPONSE);
                w.push_bytes(data);
            }
            Frame::ConnectionClose { error_code, frame_type, reason, is_application } => {
                w.push_varint(if *is_application {
                    TYPE_CONNECTION_CLOSE_APP
                } else {
                    TYPE_CONNECTION_CLOSE
                });
                w.push_varint(*error_code);
                if !is_application {
                    w.push_varint(frame_type.unwrap_or(0));
                }
                w.push_vec_varint(reason.as_bytes());
            }
            Frame::HandshakeDone => w.push_varint(TYPE_HANDSHAKE_DONE),
        }
    }

    /// The encoded length in bytes, without actually encoding. Used by the
    /// packet builder to decide whether a frame still fits in the datagram.
    pub fn encoded_len(&self) -> usize {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.len()
    }

    /// The wire type tag this frame would encode with, reported on
    /// `CONNECTION_CLOSE` as the offending frame type (spec.md Section 7).
    pub fn wire_type(&self) -> u64 {
        match self {
            Frame::Padding => TYPE_PADDING,
            Frame::Ping => TYPE_PING,
            Frame::Ack { ecn_counts, .. } => {
                if ecn_counts.is_some() {
                    TYPE_ACK_ECN
                } else {
                    TYPE_ACK
                }
            }
            Frame::ResetStream { .. } => TYPE_RESET_STREAM,
            Frame::StopSending { .. } => TYPE_STOP_SENDING,
            Frame::Crypto { .. } => TYPE_CRYPTO,
            Frame::NewToken { .. } => TYPE_NEW_TOKEN,
            Frame::Stream(_) => TYPE_STREAM_MIN,
            Frame::MaxData(_) => TYPE_MAX_DATA,
            Frame::MaxStreamData { .. } => TYPE_MAX_STREAM_DATA,
            Frame::MaxStreamsBidi(_) => TYPE_MAX_STREAMS_BIDI,
            Frame::MaxStreamsUni(_) => TYPE_MAX_STREAMS_UNI,
            Frame::DataBlocked(_) => TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlockedBidi(_) => TYPE_STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlockedUni(_) => TYPE_STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId(_) => TYPE_NEW_CONNECTION_ID,
            Frame::RetireConnectionId(_) => TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge(_) => TYPE_PATH_CHALLENGE,
            Frame::PathResponse(_) => TYPE_PATH_RESPONSE,
            Frame::ConnectionClose { is_application, .. } => {
                if *is_application {
                    TYPE_CONNECTION_CLOSE_APP
                } else {
                    TYPE_CONNECTION_CLOSE
                }
            }
            Frame::HandshakeDone => TYPE_HANDSHAKE_DONE,
        }
    }

    /// True if a frame of this shape is permitted in `epoch` (RFC 9000
    /// Section 12.4). The 0-RTT column forbids ACK per spec.md Section 9's
    /// Open Question resolution (DESIGN.md).
    pub fn allowed_in(&self, epoch: crate::crypto::pair::Epoch) -> bool {
        use crate::crypto::pair::Epoch;
        match epoch {
            Epoch::Initial | Epoch::Handshake => matches!(
                self,
                Frame::Padding
                    | Frame::Ping
                    | Frame::Ack { .. }
                    | Frame::Crypto { .. }
                    | Frame::ConnectionClose { is_application: false, .. }
            ),
            Epoch::ZeroRtt => !matches!(
                self,
                Frame::Ack { .. }
                    | Frame::Crypto { .. }
                    | Frame::NewToken { .. }
                    | Frame::PathResponse(_)
                    | Frame::HandshakeDone
                    | Frame::ConnectionClose { is_application: false, .. }
            ),
            Epoch::OneRtt => !matches!(self, Frame::NewToken { .. }),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let ty = r.pull_varint()?;
        Ok(match ty {
            TYPE_PADDING => Frame::Padding,
            TYPE_PING => Frame::Ping,
            TYPE_ACK | TYPE_ACK_ECN => {
                let largest = r.pull_varint()?;
                let ack_delay = r.pull_varint()?;
                let range_count = r.pull_varint()?;
                let first_range = r.pull_varint()?;
                let mut ranges = vec![AckRange {
                    smallest: largest - first_range,
                    largest,
                }];
                for _ in 0..range_count {
                    let gap = r.pull_varint()?;
                    let len = r.pull_varint()?;
                    let prev_smallest = ranges.last().unwrap().smallest;
                    let largest = prev_smallest
                        .checked_sub(gap + 2)
                        .ok_or(Error::Malformed("ack range gap underflow"))?;
                    let smallest = largest
                        .checked_sub(len)
                        .ok_or(Error::Malformed("ack range length underflow"))?;
                    ranges.push(AckRange { smallest, largest });
                }
                let ecn_counts = if ty == TYPE_ACK_ECN {
                    Some((r.pull_varint()?, r.pull_varint()?, r.pull_varint()?))
                } else {
                    None
                };
                Frame::Ack { ranges, ack_delay, ecn_counts }
            }
            TYPE_RESET_STREAM => Frame::ResetStream {
                stream_id: r.pull_varint()?,
                error_code: r.pull_varint()?,
                final_size: r.pull_varint()?,
            },
            TYPE_STOP_SENDING => Frame::StopSending {
                stream_id: r.pull_varint()?,
                error_code: r.pull_varint()?,
            },
            TYPE_CRYPTO => Frame::Crypto {
                offset: r.pull_varint()?,
                data: r.pull_vec_varint()?.to_vec(),
            },
            TYPE_NEW_TOKEN => Frame::NewToken {
                token: r.pull_vec_varint()?.to_vec(),
            },
            t if (TYPE_STREAM_MIN..=TYPE_STREAM_MAX).contains(&t) => {
                let stream_id = r.pull_varint()?;
                let offset = if t & 0x04 != 0 { r.pull_varint()? } else { 0 };
                let data = if t & 0x02 != 0 {
                    r.pull_vec_varint()?.to_vec()
                } else {
                    let rest = r.remaining();
                    r.pull_bytes(rest)?.to_vec()
                };
                Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    fin: t & 0x01 != 0,
                    data,
                })
            }
            TYPE_MAX_DATA => Frame::MaxData(r.pull_varint()?),
            TYPE_MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: r.pull_varint()?,
                max_data: r.pull_varint()?,
            },
            TYPE_MAX_STREAMS_BIDI => Frame::MaxStreamsBidi(r.pull_varint()?),
            TYPE_MAX_STREAMS_UNI => Frame::MaxStreamsUni(r.pull_varint()?),
            TYPE_DATA_BLOCKED => Frame::DataBlocked(r.pull_varint()?),
            TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: r.pull_varint()?,
                max_data: r.pull_varint()?,
            },
            TYPE_STREAMS_BLOCKED_BIDI => Frame::StreamsBlockedBidi(r.pull_varint()?),
            TYPE_STREAMS_BLOCKED_UNI => Frame::StreamsBlockedUni(r.pull_varint()?),
            TYPE_NEW_CONNECTION_ID => {
                let seq = r.pull_varint()?;
                let retire_prior_to = r.pull_varint()?;
                let len = r.pull_u8()? as usize;
                let cid_bytes = r.pull_bytes(len)?;
                let mut token = [0u8; 16];
                token.copy_from_slice(r.pull_bytes(16)?);
                Frame::NewConnectionId(NewConnectionIdFrame {
                    seq,
                    retire_prior_to,
                    connection_id: ConnectionId::new(cid_bytes),
                    stateless_reset_token: token,
                })
            }
            TYPE_RETIRE_CONNECTION_ID => Frame::RetireConnectionId(r.pull_varint()?),
            TYPE_PATH_CHALLENGE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(r.pull_bytes(8)?);
                Frame::PathChallenge(data)
            }
            TYPE_PATH_RESPONSE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(r.pull_bytes(8)?);
                Frame::PathResponse(data)
            }
            TYPE_CONNECTION_CLOSE | TYPE_CONNECTION_CLOSE_APP => {
                let error_code = r.pull_varint()?;
                let is_application = ty == TYPE_CONNECTION_CLOSE_APP;
                let frame_type = if is_application { None } else { Some(r.pull_varint()?) };
                let reason_bytes = r.pull_vec_varint()?;
                let reason = String::from_utf8_lossy(reason_bytes).into_owned();
                Frame::ConnectionClose { error_code, frame_type, reason, is_application }
            }
            TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => return Err(Error::Malformed("unknown frame type")),
        })
    }
}

/// True if `frame_type` is a frame this implementation doesn't recognize at
/// all, as distinct from a recognized frame that is malformed.
pub fn is_unknown_frame_type(r: &mut Reader<'_>) -> Result<bool> {
    let saved = *r;
    let ty = r.pull_varint();
    *r = saved;
    match ty {
        Ok(t) => Ok(!matches!(
            t,
            TYPE_PADDING
                | TYPE_PING
                | TYPE_ACK
                | TYPE_ACK_ECN
                | TYPE_RESET_STREAM
                | TYPE_STOP_SENDING
                | TYPE_CRYPTO
                | TYPE_NEW_TOKEN
                | TYPE_STREAM_MIN..=TYPE_STREAM_MAX
                | TYPE_MAX_DATA
                | TYPE_MAX_STREAM_DATA
                | TYPE_MAX_STREAMS_BIDI
                | TYPE_MAX_STREAMS_UNI
                | TYPE_DATA_BLOCKED
                | TYPE_STREAM_DATA_BLOCKED
                | TYPE_STREAMS_BLOCKED_BIDI
                | TYPE_STREAMS_BLOCKED_UNI
                | TYPE_NEW_CONNECTION_ID
                | TYPE_RETIRE_CONNECTION_ID
                | TYPE_PATH_CHALLENGE
                | TYPE_PATH_RESPONSE
                | TYPE_CONNECTION_CLOSE
                | TYPE_CONNECTION_CLOSE_APP
                | TYPE_HANDSHAKE_DONE
        )),
        Err(Error::Buffer(BufferError::Read)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn varint_encoded_len(value: u64) -> usize {
    varint_len(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frame_round_trips_with_offset_and_fin() {
        let f = Frame::Stream(StreamFrame {
            stream_id: 4,
            offset: 128,
            fin: true,
            data: vec![1, 2, 3, 4, 5],
        });
        let mut w = Writer::new();
        f.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), f);
    }

    #[test]
    fn ack_frame_round_trips_multiple_ranges() {
        let f = Frame::Ack {
            ranges: vec![
                AckRange { smallest: 18, largest: 20 },
                AckRange { smallest: 10, largest: 14 },
                AckRange { smallest: 0, largest: 5 },
            ],
            ack_delay: 42,
            ecn_counts: None,
        };
        let mut w = Writer::new();
        f.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), f);
    }

    #[test]
    fn connection_close_transport_round_trips() {
        let f = Frame::ConnectionClose {
            error_code: 0x0a,
            frame_type: Some(0x08),
            reason: "Over stream data limit".to_string(),
            is_application: false,
        };
        let mut w = Writer::new();
        f.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), f);
    }

    #[test]
    fn new_connection_id_round_trips() {
        let f = Frame::NewConnectionId(NewConnectionIdFrame {
            seq: 3,
            retire_prior_to: 1,
            connection_id: ConnectionId::new(&[9, 9, 9, 9, 9, 9, 9, 9]),
            stateless_reset_token: [7u8; 16],
        });
        let mut w = Writer::new();
        f.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), f);
    }

    #[test]
    fn crypto_frame_round_trips() {
        let f = Frame::Crypto { offset: 0, data: vec![0xaa; 64] };
        let mut w = Writer::new();
        f.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), f);
    }

    #[test]
    fn unknown_frame_type_is_detected() {
        let mut w = Writer::new();
        w.push_varint(0x3f); // not assigned by any known frame
        let mut r = Reader::new(w.as_slice());
        assert!(is_unknown_frame_type(&mut r).unwrap());
    }
}
