//! HTTP/3 frames (RFC 9114 Section 7)
//!
//! Every frame is `(type varint, length varint, payload)`. Unknown frame
//! types and greased types (`0x1f * N + 0x21`, RFC 9114 Section 7.2.8) are
//! preserved as `Frame::Unknown` rather than rejected.

use rquic_core::buffer::{Reader, Writer};

use crate::error::{Error, Http3Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    CancelPush,
    Settings,
    PushPromise,
    Goaway,
    MaxPushId,
    Unknown(u64),
}

impl From<u64> for FrameType {
    fn from(v: u64) -> Self {
        match v {
            0x00 => FrameType::Data,
            0x01 => FrameType::Headers,
            0x03 => FrameType::CancelPush,
            0x04 => FrameType::Settings,
            0x05 => FrameType::PushPromise,
            0x07 => FrameType::Goaway,
            0x0d => FrameType::MaxPushId,
            other => FrameType::Unknown(other),
        }
    }
}

impl From<FrameType> for u64 {
    fn from(t: FrameType) -> u64 {
        match t {
            FrameType::Data => 0x00,
            FrameType::Headers => 0x01,
            FrameType::CancelPush => 0x03,
            FrameType::Settings => 0x04,
            FrameType::PushPromise => 0x05,
            FrameType::Goaway => 0x07,
            FrameType::MaxPushId => 0x0d,
            FrameType::Unknown(v) => v,
        }
    }
}

/// True for HTTP/2-only frame types (0x02, 0x06, 0x08, 0x09) that are
/// reserved and must never appear on an HTTP/3 connection.
pub fn is_http2_reserved(frame_type: u64) -> bool {
    matches!(frame_type, 0x02 | 0x06 | 0x08 | 0x09)
}

/// A single (name, value) header field as QPACK produces/consumes it.
pub type HeaderBlock = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsPayload {
    /// Kept in the order they were encoded/requested; unknown settings IDs
    /// are preserved rather than dropped.
    pub entries: Vec<(u64, u64)>,
}

/// SETTINGS identifiers this layer understands (RFC 9114 Section 7.2.4.1,
/// RFC 9204 Section 5).
pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;

impl SettingsPayload {
    /// This transport's own values, not nghttp3's defaults: a 256-byte
    /// dynamic table and 16 blocked streams.
    pub fn local_defaults() -> Self {
        Self {
            entries: vec![
                (SETTINGS_QPACK_MAX_TABLE_CAPACITY, 256),
                (SETTINGS_QPACK_BLOCKED_STREAMS, 16),
            ],
        }
    }

    pub fn get(&self, id: u64) -> Option<u64> {
        self.entries.iter().find(|(k, _)| *k == id).map(|(_, v)| *v)
    }

    fn encode(&self, w: &mut Writer) {
        for (id, value) in &self.entries {
            w.push_varint(*id);
            w.push_varint(*value);
        }
    }

    fn decode(r: &mut Reader) -> Result<Self> {
        let mut entries = Vec::new();
        while !r.is_empty() {
            let id = r.pull_varint().map_err(buffer_err)?;
            let value = r.pull_varint().map_err(buffer_err)?;
            entries.push((id, value));
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Headers(HeaderBlock),
    CancelPush { push_id: u64 },
    Settings(SettingsPayload),
    PushPromise { push_id: u64, header_block: HeaderBlock },
    Goaway { id: u64 },
    MaxPushId { push_id: u64 },
    Unknown { frame_type: u64, payload: Vec<u8> },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::CancelPush { .. } => FrameType::CancelPush,
            Frame::Settings(_) => FrameType::Settings,
            Frame::PushPromise { .. } => FrameType::PushPromise,
            Frame::Goaway { .. } => FrameType::Goaway,
            Frame::MaxPushId { .. } => FrameType::MaxPushId,
            Frame::Unknown { frame_type, .. } => FrameType::Unknown(*frame_type),
        }
    }

    /// Encode `(type, length, payload)` onto `w`.
    pub fn encode(&self, w: &mut Writer) {
        let mut body = Writer::new();
        match self {
            Frame::Data(data) => body.push_bytes(data),
            Frame::Headers(block) => body.push_bytes(block),
            Frame::CancelPush { push_id } => body.push_varint(*push_id),
            Frame::Settings(settings) => settings.encode(&mut body),
            Frame::PushPromise { push_id, header_block } => {
                body.push_varint(*push_id);
                body.push_bytes(header_block);
            }
            Frame::Goaway { id } => body.push_varint(*id),
            Frame::MaxPushId { push_id } => body.push_varint(*push_id),
            Frame::Unknown { payload, .. } => body.push_bytes(payload),
        }
        w.push_varint(u64::from(self.frame_type()));
        w.push_varint(body.len() as u64);
        w.push_bytes(body.as_slice());
    }

    /// Decode a single frame from the front of `r`. Returns
    /// `Err(BufferError::Read)`-wrapped when the declared length runs past
    /// what has arrived; callers should treat that as "need more data",
    /// not a protocol error.
    pub fn decode(r: &mut Reader) -> Result<Self> {
        let raw_type = r.pull_varint().map_err(buffer_err)?;
        let len = r.pull_varint().map_err(buffer_err)? as usize;
        let payload = r.pull_bytes(len).map_err(buffer_err)?;
        let mut body = Reader::new(payload);

        let frame = match FrameType::from(raw_type) {
            FrameType::Data => Frame::Data(payload.to_vec()),
            FrameType::Headers => Frame::Headers(payload.to_vec()),
            FrameType::CancelPush => Frame::CancelPush {
                push_id: body.pull_varint().map_err(buffer_err)?,
            },
            FrameType::Settings => Frame::Settings(SettingsPayload::decode(&mut body)?),
            FrameType::PushPromise => {
                let push_id = body.pull_varint().map_err(buffer_err)?;
                Frame::PushPromise {
                    push_id,
                    header_block: body.pull_bytes(body.remaining()).map_err(buffer_err)?.to_vec(),
                }
            }
            FrameType::Goaway => Frame::Goaway {
                id: body.pull_varint().map_err(buffer_err)?,
            },
            FrameType::MaxPushId => Frame::MaxPushId {
                push_id: body.pull_varint().map_err(buffer_err)?,
            },
            FrameType::Unknown(frame_type) => {
                if is_http2_reserved(frame_type) {
                    return Err(Error::protocol(
                        Http3Error::FrameUnexpected,
                        "HTTP/2-only frame type on HTTP/3 connection",
                    ));
                }
                Frame::Unknown { frame_type, payload: payload.to_vec() }
            }
        };
        Ok(frame)
    }
}

fn buffer_err(_: rquic_core::error::Error) -> Error {
    Error::protocol(Http3Error::FrameError, "truncated frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let frame = Frame::Data(b"hello".to_vec());
        let mut w = Writer::new();
        frame.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), frame);
    }

    #[test]
    fn settings_uses_local_defaults_not_nghttp3_defaults() {
        let settings = SettingsPayload::local_defaults();
        assert_eq!(settings.get(SETTINGS_QPACK_MAX_TABLE_CAPACITY), Some(256));
        assert_eq!(settings.get(SETTINGS_QPACK_BLOCKED_STREAMS), Some(16));
    }

    #[test]
    fn settings_frame_round_trips() {
        let frame = Frame::Settings(SettingsPayload::local_defaults());
        let mut w = Writer::new();
        frame.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), frame);
    }

    #[test]
    fn unknown_frame_type_is_preserved() {
        let frame = Frame::Unknown { frame_type: 0x21, payload: vec![1, 2, 3] };
        let mut w = Writer::new();
        frame.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(Frame::decode(&mut r).unwrap(), frame);
    }

    #[test]
    fn http2_reserved_frame_type_rejected() {
        let mut w = Writer::new();
        w.push_varint(0x06);
        w.push_varint(0);
        let mut r = Reader::new(w.as_slice());
        assert!(Frame::decode(&mut r).is_err());
    }

    #[test]
    fn truncated_frame_is_an_error_not_a_panic() {
        let mut w = Writer::new();
        w.push_varint(u64::from(FrameType::Data));
        w.push_varint(10);
        w.push_bytes(b"short");
        let mut r = Reader::new(w.as_slice());
        assert!(Frame::decode(&mut r).is_err());
    }
}
