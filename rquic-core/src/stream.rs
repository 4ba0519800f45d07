//! QUIC streams (spec.md Section 3/4.5)
//!
//! A stream is identified by a 62-bit `stream_id` whose low two bits encode
//! (initiator, directionality). `SendBuffer` is an append-only byte log with
//! a peer flow-control ceiling; `RecvBuffer` is an offset-ordered,
//! overlap-tolerant reassembler producing a contiguous prefix from offset 0.

use std::collections::BTreeMap;

use crate::error::{Misuse, TransportError, TransportErrorDetail};

/// Which endpoint opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directionality {
    Bidi,
    Uni,
}

pub fn initiator(id: u64) -> Initiator {
    if id & 0x1 == 0 {
        Initiator::Client
    } else {
        Initiator::Server
    }
}

pub fn directionality(id: u64) -> Directionality {
    if id & 0x2 == 0 {
        Directionality::Bidi
    } else {
        Directionality::Uni
    }
}

/// True if `id` names a stream this endpoint (client iff `is_client`) is
/// allowed to send on, per the direction rules in spec.md Section 4.6.
pub fn can_send(is_client: bool, id: u64) -> bool {
    match directionality(id) {
        Directionality::Bidi => true,
        Directionality::Uni => {
            let opened_by_client = initiator(id) == Initiator::Client;
            opened_by_client == is_client
        }
    }
}

/// True if `id` names a stream this endpoint is allowed to receive on.
pub fn can_recv(is_client: bool, id: u64) -> bool {
    match directionality(id) {
        Directionality::Bidi => true,
        Directionality::Uni => {
            let opened_by_client = initiator(id) == Initiator::Client;
            opened_by_client != is_client
        }
    }
}

/// True if `id` was opened by this endpoint (as opposed to the peer).
pub fn is_local(is_client: bool, id: u64) -> bool {
    let opened_by_client = initiator(id) == Initiator::Client;
    opened_by_client == is_client
}

/// Validate a received stream frame's direction against the local role,
/// producing the `Misuse`/reason phrases spec.md Section 4.6 specifies.
pub fn check_recv_direction(is_client: bool, id: u64) -> Result<(), Misuse> {
    if can_recv(is_client, id) {
        Ok(())
    } else {
        Err(Misuse::StreamReceiveOnly)
    }
}

pub fn check_send_direction(is_client: bool, id: u64) -> Result<(), Misuse> {
    if can_send(is_client, id) {
        Ok(())
    } else {
        Err(Misuse::StreamSendOnly)
    }
}

/// An append-only send log with a base offset of 0 and a peer-imposed
/// flow-control ceiling. Once a FIN offset is set, further writes fail.
#[derive(Debug, Default)]
pub struct SendBuffer {
    data: Vec<u8>,
    /// Offset of the first byte not yet handed to the packet builder.
    next_offset: u64,
    fin_offset: Option<u64>,
    fin_sent: bool,
    max_stream_data: u64,
    is_blocked: bool,
}

impl SendBuffer {
    pub fn new(max_stream_data: u64) -> Self {
        Self {
            max_stream_data,
            ..Default::default()
        }
    }

    /// Append bytes to the log; `fin` marks this as the stream's last write.
    pub fn write(&mut self, bytes: &[u8], fin: bool) -> Result<(), Misuse> {
        if self.fin_offset.is_some() {
            return Err(Misuse::ConnectionClosed);
        }
        self.data.extend_from_slice(bytes);
        if fin {
            self.fin_offset = Some(self.data.len() as u64);
        }
        Ok(())
    }

    /// Pull up to `max_len` bytes of not-yet-sent data, respecting the
    /// peer's `max_stream_data`. Returns `(offset, data, fin)`.
    pub fn poll_transmit(&mut self, max_len: usize) -> Option<(u64, Vec<u8>, bool)> {
        let total_written = self.data.len() as u64;
        let avail = total_written.saturating_sub(self.next_offset);
        let budget = self.max_stream_data.saturating_sub(self.next_offset);
        if budget == 0 && avail > 0 {
            self.is_blocked = true;
            return None;
        }
        let take = avail.min(budget).min(max_len as u64) as usize;
        let offset = self.next_offset;
        let data = self.data[offset as usize..offset as usize + take].to_vec();
        self.next_offset += take as u64;
        let fin = self.fin_offset == Some(self.next_offset);
        if fin {
            self.fin_sent = true;
        }
        if take == 0 && !fin {
            return None;
        }
        self.is_blocked = false;
        Some((offset, data, fin))
    }

    /// Re-expose bytes from `offset` onward as not-yet-sent, for loss
    /// recovery: the frame's intent (these bytes, at this offset) is
    /// re-enqueued rather than re-sent verbatim.
    pub fn retransmit(&mut self, offset: u64) {
        self.next_offset = self.next_offset.min(offset);
        self.fin_sent = false;
    }

    pub fn set_max_stream_data(&mut self, limit: u64) {
        if limit > self.max_stream_data {
            self.max_stream_data = limit;
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.is_blocked
    }

    pub fn has_pending(&self) -> bool {
        self.next_offset < self.data.len() as u64
            || (self.fin_offset == Some(self.next_offset) && !self.fin_sent)
    }

    pub fn fin_offset(&self) -> Option<u64> {
        self.fin_offset
    }
}

/// An offset-ordered, overlap-tolerant reassembler. Produces the contiguous
/// prefix from offset 0 upward; a declared FIN offset is fixed.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    /// Offset of the next contiguous byte the application hasn't seen yet.
    next_offset: u64,
    /// Chunks received ahead of `next_offset`, keyed by start offset.
    pending: BTreeMap<u64, Vec<u8>>,
    fin_offset: Option<u64>,
    max_stream_data_local: u64,
}

impl RecvBuffer {
    pub fn new(max_stream_data_local: u64) -> Self {
        Self {
            max_stream_data_local,
            ..Default::default()
        }
    }

    pub fn fin_offset(&self) -> Option<u64> {
        self.fin_offset
    }

    /// Feed a STREAM frame's payload; returns the newly-available contiguous
    /// bytes (possibly empty, e.g. for an out-of-order or duplicate frame).
    pub fn receive(
        &mut self,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<Vec<u8>, TransportErrorDetail> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| frame_error(TransportError::FrameEncodingError, "stream offset overflow"))?;

        if let Some(existing_fin) = self.fin_offset {
            if end > existing_fin || (fin && end != existing_fin) {
                return Err(frame_error(TransportError::FinalSizeError, "data received past stream FIN"));
            }
        }
        if end > self.max_stream_data_local {
            return Err(frame_error(TransportError::FlowControlError, "Over stream data limit"));
        }
        if fin {
            self.fin_offset = Some(end);
        }

        if end <= self.next_offset {
            return Ok(Vec::new());
        }
        let start = offset.max(self.next_offset);
        let trimmed = &data[(start - offset) as usize..];
        self.pending.insert(start, trimmed.to_vec());

        let mut out = Vec::new();
        loop {
            let Some((&off, _)) = self.pending.iter().next() else {
                break;
            };
            if off > self.next_offset {
                break;
            }
            let chunk = self.pending.remove(&off).expect("key just observed present");
            let chunk_end = off + chunk.len() as u64;
            if chunk_end <= self.next_offset {
                continue;
            }
            let skip = (self.next_offset - off) as usize;
            out.extend_from_slice(&chunk[skip..]);
            self.next_offset = chunk_end;
        }
        Ok(out)
    }

    /// True once the FIN offset has been declared and every byte up to it
    /// has been delivered contiguously.
    pub fn is_complete(&self) -> bool {
        self.fin_offset == Some(self.next_offset)
    }

    pub fn max_stream_data_local(&self) -> u64 {
        self.max_stream_data_local
    }
}

fn frame_error(code: TransportError, reason: &'static str) -> TransportErrorDetail {
    TransportErrorDetail::new(code, Some(0x08), reason)
}

/// A single stream's send and/or receive halves, present only for the
/// directions this endpoint is allowed to use (spec.md Section 4.6 direction
/// rules).
#[derive(Debug, Default)]
pub struct Stream {
    pub id: u64,
    pub send: Option<SendBuffer>,
    pub recv: Option<RecvBuffer>,
    pub stop_sending_received: bool,
    pub reset_received: bool,
}

impl Stream {
    pub fn new(
        id: u64,
        is_client: bool,
        initial_max_stream_data_local: u64,
        initial_max_stream_data_peer: u64,
    ) -> Self {
        Self {
            id,
            send: can_send(is_client, id).then(|| SendBuffer::new(initial_max_stream_data_peer)),
            recv: can_recv(is_client, id).then(|| RecvBuffer::new(initial_max_stream_data_local)),
            stop_sending_received: false,
            reset_received: false,
        }
    }

    /// Both directions this endpoint owns are finished: no send half, or the
    /// send half has had its FIN sent and acked (approximated here by "FIN
    /// sent"); likewise no recv half, or the recv half is complete.
    pub fn is_finished(&self) -> bool {
        let send_done = self.send.as_ref().map(|s| s.fin_sent_and_drained()).unwrap_or(true);
        let recv_done = self.recv.as_ref().map(|r| r.is_complete()).unwrap_or(true);
        send_done && recv_done
    }
}

impl SendBuffer {
    fn fin_sent_and_drained(&self) -> bool {
        self.fin_sent && !self.has_pending()
    }
}

/// Allocates the next available stream ID for each (directionality) class,
/// per `get_next_available_stream_id` (spec.md Section 4.6). IDs for a given
/// class increase by 4 starting from the class's base value.
#[derive(Debug)]
pub struct StreamIdAllocator {
    is_client: bool,
    next_bidi: u64,
    next_uni: u64,
}

impl StreamIdAllocator {
    pub fn new(is_client: bool) -> Self {
        let base = if is_client { 0 } else { 1 };
        Self {
            is_client,
            next_bidi: base,
            next_uni: base + 2,
        }
    }

    pub fn next(&mut self, is_unidirectional: bool) -> u64 {
        let id = if is_unidirectional {
            self.next_uni
        } else {
            self.next_bidi
        };
        if is_unidirectional {
            self.next_uni += 4;
        } else {
            self.next_bidi += 4;
        }
        id
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_direction_classification() {
        assert_eq!(initiator(0), Initiator::Client);
        assert_eq!(initiator(1), Initiator::Server);
        assert_eq!(directionality(2), Directionality::Uni);
        assert_eq!(directionality(0), Directionality::Bidi);
    }

    #[test]
    fn client_uni_stream_send_recv_rules() {
        // Client-initiated uni (id % 4 == 2): client sends, server receives.
        assert!(can_send(true, 2));
        assert!(!can_recv(true, 2));
        assert!(!can_send(false, 2));
        assert!(can_recv(false, 2));
    }

    #[test]
    fn bidi_stream_both_sides_send_and_recv() {
        assert!(can_send(true, 0));
        assert!(can_recv(true, 0));
        assert!(can_send(false, 0));
        assert!(can_recv(false, 0));
    }

    #[test]
    fn send_buffer_respects_flow_control_then_unblocks() {
        let mut sb = SendBuffer::new(4);
        sb.write(b"hello world", false).unwrap();
        let (offset, data, fin) = sb.poll_transmit(1024).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(data, b"hell");
        assert!(!fin);
        assert!(sb.poll_transmit(1024).is_none());
        sb.set_max_stream_data(11);
        let (offset, data, fin) = sb.poll_transmit(1024).unwrap();
        assert_eq!(offset, 4);
        assert_eq!(data, b"o world");
        assert!(!fin);
    }

    #[test]
    fn send_buffer_fin_flag_set_on_last_chunk() {
        let mut sb = SendBuffer::new(1024);
        sb.write(b"bye", true).unwrap();
        let (_, data, fin) = sb.poll_transmit(1024).unwrap();
        assert_eq!(data, b"bye");
        assert!(fin);
    }

    #[test]
    fn recv_buffer_reorders_and_surfaces_contiguous_prefix() {
        let mut rb = RecvBuffer::new(1024);
        assert_eq!(rb.receive(5, b"world", false).unwrap(), Vec::<u8>::new());
        assert_eq!(rb.receive(0, b"hello", false).unwrap(), b"helloworld");
    }

    #[test]
    fn recv_buffer_duplicate_is_a_noop() {
        let mut rb = RecvBuffer::new(1024);
        assert_eq!(rb.receive(0, b"abc", false).unwrap(), b"abc");
        assert_eq!(rb.receive(0, b"abc", false).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn recv_buffer_over_limit_is_flow_control_error() {
        let mut rb = RecvBuffer::new(4);
        let err = rb.receive(0, b"hello", false).unwrap_err();
        assert_eq!(err.code, TransportError::FlowControlError);
    }

    #[test]
    fn recv_buffer_fin_is_fixed_once_declared() {
        let mut rb = RecvBuffer::new(1024);
        rb.receive(0, b"abc", true).unwrap();
        let err = rb.receive(3, b"more", false).unwrap_err();
        assert_eq!(err.code, TransportError::FinalSizeError);
    }

    #[test]
    fn stream_id_allocator_increments_by_four_per_class() {
        let mut alloc = StreamIdAllocator::new(true);
        assert_eq!(alloc.next(false), 0);
        assert_eq!(alloc.next(false), 4);
        assert_eq!(alloc.next(true), 2);
        assert_eq!(alloc.next(true), 6);
    }
}
