//! HTTP/3 connection: control/QPACK stream setup, request/response framing
//! and QPACK-driven header (de)coding on top of a `rquic_core::Connection`
//! (spec.md Section 4.7).
//!
//! This layer owns no bytes of its own past what it needs to reassemble
//! frames; all flow control, retransmission and stream lifecycle still
//! belongs to the transport. It is driven by polling the transport's
//! `StreamDataReceived` events and pushing back onto it with
//! `send_stream_data`.

use std::collections::VecDeque;

use rquic_core::buffer::Writer;
use rquic_core::Connection;

use crate::error::{Error, Http3Error, Misuse, Result};
use crate::frame::{Frame, SettingsPayload, SETTINGS_QPACK_BLOCKED_STREAMS, SETTINGS_QPACK_MAX_TABLE_CAPACITY};
use crate::qpack::{Decoder, Encoder, HeaderField};
use crate::stream::{is_bidi, FrameReassembler, StreamMap, StreamType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Draining,
}

/// Application-visible events produced by this layer (spec.md Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RequestReceived { stream_id: u64, headers: Vec<HeaderField> },
    ResponseReceived { stream_id: u64, headers: Vec<HeaderField> },
    DataReceived { stream_id: u64, data: Vec<u8> },
    GoAway { id: u64 },
}

/// Drives three locally-opened critical streams plus request/response
/// streams over a single `rquic_core::Connection`.
pub struct Http3Connection {
    is_client: bool,
    state: State,
    streams: StreamMap,
    qpack_encoder: Encoder,
    qpack_decoder: Decoder,

    local_control_stream: Option<u64>,
    local_qpack_encoder_stream: Option<u64>,
    local_qpack_decoder_stream: Option<u64>,
    remote_control_stream: Option<u64>,
    remote_qpack_encoder_stream: Option<u64>,
    remote_qpack_decoder_stream: Option<u64>,

    control_reassembler: FrameReassembler,
    settings_received: bool,
    events: VecDeque<Event>,
}

impl Http3Connection {
    pub fn new(is_client: bool) -> Self {
        Self {
            is_client,
            state: State::Connecting,
            streams: StreamMap::new(),
            qpack_encoder: Encoder::new(),
            qpack_decoder: Decoder::new(256, 16),
            local_control_stream: None,
            local_qpack_encoder_stream: None,
            local_qpack_decoder_stream: None,
            remote_control_stream: None,
            remote_qpack_encoder_stream: None,
            remote_qpack_decoder_stream: None,
            control_reassembler: FrameReassembler::default(),
            settings_received: false,
            events: VecDeque::new(),
        }
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Opens the control, QPACK-encoder and QPACK-decoder unidirectional
    /// streams and sends the local SETTINGS frame (spec.md Section 4.7).
    /// Must be called exactly once, before any other traffic.
    pub fn open(&mut self, conn: &mut Connection) -> Result<()> {
        if self.local_control_stream.is_some() {
            return Err(Misuse::CriticalStreamAlreadyOpened.into());
        }

        let control_id = conn.get_next_available_stream_id(true);
        let mut control_bytes = Writer::new();
        control_bytes.push_varint(StreamType::Control.type_code().expect("control has a type code"));
        Frame::Settings(SettingsPayload::local_defaults()).encode(&mut control_bytes);
        conn.send_stream_data(control_id, control_bytes.as_slice(), false)?;
        self.local_control_stream = Some(control_id);

        let encoder_id = conn.get_next_available_stream_id(true);
        let mut encoder_bytes = Writer::new();
        encoder_bytes.push_varint(StreamType::QpackEncoder.type_code().expect("qpack encoder has a type code"));
        conn.send_stream_data(encoder_id, encoder_bytes.as_slice(), false)?;
        self.local_qpack_encoder_stream = Some(encoder_id);

        let decoder_id = conn.get_next_available_stream_id(true);
        let mut decoder_bytes = Writer::new();
        decoder_bytes.push_varint(StreamType::QpackDecoder.type_code().expect("qpack decoder has a type code"));
        conn.send_stream_data(decoder_id, decoder_bytes.as_slice(), false)?;
        self.local_qpack_decoder_stream = Some(decoder_id);

        Ok(())
    }

    /// Issue a request on a freshly allocated client-initiated bidirectional
    /// stream. Client-side only.
    pub fn send_request(&mut self, conn: &mut Connection, headers: &[HeaderField]) -> Result<u64> {
        if !self.is_client {
            return Err(Error::Misuse(Misuse::NotAControlStream));
        }
        let stream_id = conn.get_next_available_stream_id(false);
        self.send_headers(conn, stream_id, headers, false)?;
        Ok(stream_id)
    }

    /// Respond on an existing request stream. Server-side only.
    pub fn send_response(&mut self, conn: &mut Connection, stream_id: u64, headers: &[HeaderField], end_stream: bool) -> Result<()> {
        if self.is_client {
            return Err(Error::Misuse(Misuse::NotAControlStream));
        }
        self.send_headers(conn, stream_id, headers, end_stream)
    }

    fn send_headers(&mut self, conn: &mut Connection, stream_id: u64, headers: &[HeaderField], end_stream: bool) -> Result<()> {
        let (encoder_updates, block) = self.qpack_encoder.encode(stream_id, 0, headers);
        if !encoder_updates.is_empty() {
            if let Some(enc_stream) = self.local_qpack_encoder_stream {
                conn.send_stream_data(enc_stream, &encoder_updates, false)?;
            }
        }
        let mut w = Writer::new();
        Frame::Headers(block).encode(&mut w);
        conn.send_stream_data(stream_id, w.as_slice(), end_stream)?;
        Ok(())
    }

    /// Send a DATA frame's payload on a request stream, optionally ending
    /// the stream's send side.
    pub fn send_data(&mut self, conn: &mut Connection, stream_id: u64, data: &[u8], end_stream: bool) -> Result<()> {
        let mut w = Writer::new();
        Frame::Data(data.to_vec()).encode(&mut w);
        conn.send_stream_data(stream_id, w.as_slice(), end_stream)?;
        Ok(())
    }

    /// Drain `StreamDataReceived` events off the transport, updating
    /// internal framing/QPACK state and queuing the resulting HTTP/3
    /// events for `next_event()`.
    pub fn poll(&mut self, conn: &mut Connection) -> Result<()> {
        while let Some(event) = conn.next_event() {
            if let rquic_core::Event::StreamDataReceived { stream_id, data, end_stream } = event {
                self.on_stream_data(conn, stream_id, &data, end_stream)?;
            }
        }
        Ok(())
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn on_stream_data(&mut self, conn: &mut Connection, stream_id: u64, data: &[u8], end_stream: bool) -> Result<()> {
        if is_bidi(stream_id) {
            return self.on_request_stream_data(stream_id, data, end_stream);
        }

        // Peer-initiated unidirectional stream: consume the type varint
        // first, then buffer the rest according to the stream's role.
        let (stream_type, rest) = match self.streams.peer_uni_type(stream_id) {
            Some(ty) => (ty, data.to_vec()),
            None => match self.streams.identify_peer_uni(stream_id, data) {
                Some(pair) => {
                    self.bind_remote_critical_stream(stream_id, pair.0)?;
                    pair
                }
                None => return Ok(()), // type varint hasn't fully arrived yet
            },
        };

        match stream_type {
            StreamType::Control => self.on_control_stream_data(conn, &rest)?,
            StreamType::QpackEncoder => {
                let unblocked = self.qpack_decoder.feed_encoder(&rest);
                for unblocked_stream in unblocked {
                    let (_, headers) = self.qpack_decoder.resume_header(unblocked_stream);
                    if !headers.is_empty() {
                        self.emit_headers(unblocked_stream, headers);
                    }
                }
            }
            StreamType::QpackDecoder => self.qpack_encoder.feed_decoder(&rest),
            StreamType::Push | StreamType::Unknown(_) => {}
            StreamType::Request => unreachable!("uni streams are never Request"),
        }

        if end_stream {
            self.streams.control_stream_closed(stream_id)?;
        }
        Ok(())
    }

    fn bind_remote_critical_stream(&mut self, stream_id: u64, ty: StreamType) -> Result<()> {
        let slot = match ty {
            StreamType::Control => &mut self.remote_control_stream,
            StreamType::QpackEncoder => &mut self.remote_qpack_encoder_stream,
            StreamType::QpackDecoder => &mut self.remote_qpack_decoder_stream,
            _ => return Ok(()),
        };
        if slot.replace(stream_id).is_some() {
            return Err(Error::protocol(Http3Error::StreamCreationError, "critical stream type opened twice"));
        }
        Ok(())
    }

    fn on_control_stream_data(&mut self, conn: &mut Connection, data: &[u8]) -> Result<()> {
        let frames = self.control_reassembler.feed(data)?;
        for frame in frames {
            match frame {
                Frame::Settings(settings) => {
                    if self.settings_received {
                        return Err(Error::protocol(Http3Error::FrameUnexpected, "duplicate SETTINGS frame"));
                    }
                    self.settings_received = true;
                    if let Some(cap) = settings.get(SETTINGS_QPACK_MAX_TABLE_CAPACITY) {
                        let blocked = settings.get(SETTINGS_QPACK_BLOCKED_STREAMS).unwrap_or(0);
                        let updates = self.qpack_encoder.apply_settings(cap, blocked);
                        if !updates.is_empty() {
                            if let Some(enc_stream) = self.local_qpack_encoder_stream {
                                conn.send_stream_data(enc_stream, &updates, false)?;
                            }
                        }
                    }
                    if self.local_control_stream.is_some()
                        && self.local_qpack_encoder_stream.is_some()
                        && self.local_qpack_decoder_stream.is_some()
                    {
                        self.state = State::Connected;
                    }
                }
                Frame::Goaway { id } => {
                    self.state = State::Draining;
                    self.events.push_back(Event::GoAway { id });
                }
                Frame::CancelPush { .. } | Frame::MaxPushId { .. } => {}
                Frame::Data(_) | Frame::Headers(_) | Frame::PushPromise { .. } => {
                    return Err(Error::protocol(Http3Error::FrameUnexpected, "request frame on control stream"));
                }
                Frame::Unknown { .. } => {}
            }
        }
        Ok(())
    }

    fn on_request_stream_data(&mut self, stream_id: u64, data: &[u8], end_stream: bool) -> Result<()> {
        let request = self.streams.request_mut(stream_id);
        let frames = request.feed(data, end_stream)?;
        for frame in frames {
            match frame {
                Frame::Headers(block) => match self.qpack_decoder.feed_header(stream_id, &block)? {
                    crate::qpack::DecodeOutcome::Decoded { headers, .. } => self.emit_headers(stream_id, headers),
                    crate::qpack::DecodeOutcome::Blocked => {}
                },
                Frame::Data(payload) => self.events.push_back(Event::DataReceived { stream_id, data: payload }),
                Frame::Unknown { .. } => {}
                _ => return Err(Error::protocol(Http3Error::FrameUnexpected, "non-request frame on request stream")),
            }
        }
        Ok(())
    }

    fn emit_headers(&mut self, stream_id: u64, headers: Vec<HeaderField>) {
        let event = if self.is_client {
            Event::ResponseReceived { stream_id, headers }
        } else {
            Event::RequestReceived { stream_id, headers }
        };
        self.events.push_back(event);
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_stream_settings_marks_connected() {
        let mut h3 = Http3Connection::new(true);
        h3.local_control_stream = Some(0);
        h3.local_qpack_encoder_stream = Some(2);
        h3.local_qpack_decoder_stream = Some(3);

        let mut w = Writer::new();
        Frame::Settings(SettingsPayload::local_defaults()).encode(&mut w);

        // `on_control_stream_data` needs a live Connection only to relay
        // encoder-stream updates; none are produced for an empty dynamic
        // table, so we can't easily construct one here without a full
        // transport handshake. Exercise the reassembler + settings parsing
        // path directly instead.
        let frames = h3.control_reassembler.feed(w.as_slice()).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Settings(settings) => {
                assert_eq!(settings.get(SETTINGS_QPACK_MAX_TABLE_CAPACITY), Some(256));
            }
            _ => panic!("expected SETTINGS frame"),
        }
    }

    #[test]
    fn goaway_is_parsed() {
        let mut reassembler = FrameReassembler::default();
        let mut w = Writer::new();
        Frame::Goaway { id: 4 }.encode(&mut w);
        let frames = reassembler.feed(w.as_slice()).unwrap();
        assert_eq!(frames, vec![Frame::Goaway { id: 4 }]);
    }

    #[test]
    fn request_headers_emit_as_request_on_server_side() {
        let mut h3 = Http3Connection::new(false);
        let headers = vec![HeaderField::new(b":method".to_vec(), b"GET".to_vec())];
        let (_, block) = h3.qpack_encoder.encode(0, 0, &headers);
        let mut w = Writer::new();
        Frame::Headers(block).encode(&mut w);
        h3.on_request_stream_data(0, w.as_slice(), false).unwrap();
        assert_eq!(h3.next_event(), Some(Event::RequestReceived { stream_id: 0, headers }));
    }

    #[test]
    fn response_headers_emit_as_response_on_client_side() {
        let mut h3 = Http3Connection::new(true);
        let headers = vec![HeaderField::new(b":status".to_vec(), b"200".to_vec())];
        let (_, block) = h3.qpack_encoder.encode(0, 0, &headers);
        let mut w = Writer::new();
        Frame::Headers(block).encode(&mut w);
        h3.on_request_stream_data(0, w.as_slice(), false).unwrap();
        assert_eq!(h3.next_event(), Some(Event::ResponseReceived { stream_id: 0, headers }));
    }

    #[test]
    fn data_frame_on_request_stream_emits_data_received() {
        let mut h3 = Http3Connection::new(true);
        let mut w = Writer::new();
        Frame::Data(b"payload".to_vec()).encode(&mut w);
        h3.on_request_stream_data(0, w.as_slice(), true).unwrap();
        assert_eq!(h3.next_event(), Some(Event::DataReceived { stream_id: 0, data: b"payload".to_vec() }));
    }

    #[test]
    fn reopening_a_critical_stream_type_is_rejected() {
        let mut h3 = Http3Connection::new(true);
        h3.bind_remote_critical_stream(6, StreamType::Control).unwrap();
        assert!(h3.bind_remote_critical_stream(10, StreamType::Control).is_err());
    }
}
