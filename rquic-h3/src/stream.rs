//! HTTP/3 stream bookkeeping
//!
//! This is a thin layer over the transport's byte-stream delivery: each
//! entry here tracks a request/control/QPACK stream's frame-reassembly
//! state, not flow control (the transport already owns that).

use std::collections::HashMap;

use rquic_core::buffer::Reader;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Unidirectional stream type codes (RFC 9114 Section 6.2, RFC 9204
/// Section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Control,
    Push,
    QpackEncoder,
    QpackDecoder,
    /// A bidirectional request stream has no type byte; it is identified
    /// by its stream ID alone.
    Request,
    Unknown(u64),
}

impl StreamType {
    pub fn type_code(self) -> Option<u64> {
        match self {
            StreamType::Control => Some(0x00),
            StreamType::Push => Some(0x01),
            StreamType::QpackEncoder => Some(0x02),
            StreamType::QpackDecoder => Some(0x03),
            StreamType::Request => None,
            StreamType::Unknown(code) => Some(code),
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            0x00 => StreamType::Control,
            0x01 => StreamType::Push,
            0x02 => StreamType::QpackEncoder,
            0x03 => StreamType::QpackDecoder,
            other => StreamType::Unknown(other),
        }
    }

    /// Closing a critical stream is a connection error (RFC 9114 Section
    /// 6.2.1).
    pub fn is_critical(self) -> bool {
        matches!(self, StreamType::Control | StreamType::QpackEncoder | StreamType::QpackDecoder)
    }
}

pub fn is_bidi(stream_id: u64) -> bool {
    stream_id & 0x2 == 0
}

/// A partially or fully decoded HEADERS payload awaiting QPACK decoding to
/// unblock, per RFC 9204 Section 4.5.
#[derive(Debug, Clone)]
pub struct PendingHeaders {
    pub encoded: Vec<u8>,
}

/// Buffers bytes from one stream and drains as many complete `(type,
/// length, payload)` frames as have arrived; a frame straddling the
/// buffer's end is left for the next feed.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: Vec<u8>,
}

impl FrameReassembler {
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            let mut r = Reader::new(&self.buf);
            match Frame::decode(&mut r) {
                Ok(frame) => {
                    let consumed = r.pos();
                    self.buf.drain(..consumed);
                    frames.push(frame);
                }
                Err(_) => break,
            }
        }
        Ok(frames)
    }
}

/// Reassembly + framing state for one request (bidirectional) stream.
#[derive(Debug, Default)]
pub struct RequestStream {
    reassembler: FrameReassembler,
    pub headers_seen: bool,
    pub data_seen: bool,
    pub fin_received: bool,
    /// Set while a HEADERS frame on this stream is blocked on the QPACK
    /// dynamic table reaching a required insert count.
    pub blocked_headers: Option<PendingHeaders>,
}

impl RequestStream {
    /// Feed newly-received bytes and drain as many complete frames as the
    /// buffer currently holds.
    pub fn feed(&mut self, data: &[u8], fin: bool) -> Result<Vec<Frame>> {
        if fin {
            self.fin_received = true;
        }
        let frames = self.reassembler.feed(data)?;
        for frame in &frames {
            match frame {
                Frame::Headers(_) => self.headers_seen = true,
                Frame::Data(_) => self.data_seen = true,
                _ => {}
            }
        }
        Ok(frames)
    }
}

/// Which of the three locally-opened critical unidirectional streams (plus
/// any request/push streams) a stream ID refers to.
#[derive(Debug)]
pub struct StreamMap {
    requests: HashMap<u64, RequestStream>,
    /// Peer-initiated unidirectional streams, keyed by ID, once their type
    /// byte has been read.
    peer_uni_types: HashMap<u64, StreamType>,
    /// Peer uni streams whose type byte hasn't arrived yet.
    peer_uni_pending: HashMap<u64, Vec<u8>>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            peer_uni_types: HashMap::new(),
            peer_uni_pending: HashMap::new(),
        }
    }

    pub fn request_mut(&mut self, stream_id: u64) -> &mut RequestStream {
        self.requests.entry(stream_id).or_default()
    }

    pub fn peer_uni_type(&self, stream_id: u64) -> Option<StreamType> {
        self.peer_uni_types.get(&stream_id).copied()
    }

    /// Feed bytes received on a peer-initiated unidirectional stream;
    /// returns the stream's type once its leading varint has arrived, and
    /// leaves any remaining bytes buffered against `pending`.
    pub fn identify_peer_uni(&mut self, stream_id: u64, data: &[u8]) -> Option<(StreamType, Vec<u8>)> {
        if let Some(existing) = self.peer_uni_types.get(&stream_id) {
            return Some((*existing, data.to_vec()));
        }
        let buf = self.peer_uni_pending.entry(stream_id).or_default();
        buf.extend_from_slice(data);
        let mut r = Reader::new(buf);
        let code = r.pull_varint().ok()?;
        let consumed = r.pos();
        let rest = buf[consumed..].to_vec();
        self.peer_uni_pending.remove(&stream_id);
        let ty = StreamType::from_code(code);
        self.peer_uni_types.insert(stream_id, ty);
        Some((ty, rest))
    }

    pub fn remove_request(&mut self, stream_id: u64) {
        self.requests.remove(&stream_id);
    }

    pub fn control_stream_closed(&self, stream_id: u64) -> Result<()> {
        match self.peer_uni_types.get(&stream_id) {
            Some(ty) if ty.is_critical() => {
                Err(Error::protocol(crate::error::Http3Error::ClosedCriticalStream, "peer closed a critical stream"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for StreamMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_stream_reassembles_split_frame() {
        let mut rs = RequestStream::default();
        let mut w = rquic_core::buffer::Writer::new();
        crate::frame::Frame::Data(b"hello world".to_vec()).encode(&mut w);
        let whole = w.into_vec();
        let (first, second) = whole.split_at(3);
        assert!(rs.feed(first, false).unwrap().is_empty());
        let frames = rs.feed(second, false).unwrap();
        assert_eq!(frames, vec![crate::frame::Frame::Data(b"hello world".to_vec())]);
    }

    #[test]
    fn peer_uni_stream_type_identified_from_first_varint() {
        let mut map = StreamMap::new();
        let (ty, rest) = map.identify_peer_uni(2, &[0x02, 0xaa, 0xbb]).unwrap();
        assert_eq!(ty, StreamType::QpackEncoder);
        assert_eq!(rest, vec![0xaa, 0xbb]);
    }

    #[test]
    fn closing_control_stream_is_a_connection_error() {
        let mut map = StreamMap::new();
        map.identify_peer_uni(6, &[0x00]);
        assert!(map.control_stream_closed(6).is_err());
    }
}
