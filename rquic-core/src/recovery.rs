//! ACK management, loss detection, and congestion control (spec.md Section
//! 4.6/8, RFC 9002).
//!
//! Each epoch gets an independent `PnSpace` tracking received packet-number
//! ranges (for building ACK frames) and sent packets (for loss detection).
//! `Recovery` bundles the four spaces with one connection-wide RTT estimator
//! and a single NewReno-like `CongestionController`, since bytes-in-flight
//! and the congestion window are shared across epochs.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::crypto::pair::Epoch;
use crate::frame::AckRange;

/// Reordering threshold in packets before an un-acked packet is declared
/// lost (RFC 9002 Section 6.1.1).
pub const PACKET_THRESHOLD: u64 = 3;
/// Reordering threshold as a multiplier of RTT (RFC 9002 Section 6.1.2).
pub const TIME_THRESHOLD_NUMERATOR: u32 = 9;
pub const TIME_THRESHOLD_DENOMINATOR: u32 = 8;
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
pub const INITIAL_RTT: Duration = Duration::from_millis(333);
/// Default `max_ack_delay` per RFC 9000 Section 18.2 (also the default ACK
/// timer in spec.md Section 4.6).
pub const DEFAULT_ACK_DELAY: Duration = Duration::from_millis(25);

const MAX_DATAGRAM_SIZE: u64 = 1200;
const INITIAL_WINDOW: u64 = 10 * MAX_DATAGRAM_SIZE;
const MINIMUM_WINDOW: u64 = 2 * MAX_DATAGRAM_SIZE;

/// The semantic intent carried by a sent frame, retained so a lost packet's
/// contents can be re-enqueued rather than blindly retransmitted byte-for-byte
/// (spec.md Section 4.6 "Loss recovery").
#[derive(Debug, Clone)]
pub enum SentFrame {
    Crypto { offset: u64, len: usize },
    Stream { stream_id: u64, offset: u64, len: usize },
    ResetStream { stream_id: u64 },
    NewConnectionId { seq: u64 },
    RetireConnectionId { seq: u64 },
    MaxData(u64),
    MaxStreamData { stream_id: u64 },
    MaxStreamsBidi(u64),
    MaxStreamsUni(u64),
    Ping { uid: Option<u64> },
    HandshakeDone,
    /// ACKs, PATH_RESPONSE and other frames that are never retransmitted;
    /// their loss is either harmless or superseded by later state.
    NotRetransmitted,
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: u64,
    pub time_sent: Instant,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub size: usize,
    pub frames: Vec<SentFrame>,
}

/// One contiguous range of packet numbers this endpoint has seen, used to
/// build outgoing ACK frames.
#[derive(Debug, Clone, Copy)]
struct ReceivedRange {
    smallest: u64,
    largest: u64,
}

/// Tracks received and sent packet-number state for one epoch.
#[derive(Debug, Default)]
pub struct PnSpace {
    next_pn: u64,
    sent_packets: BTreeMap<u64, SentPacket>,
    bytes_in_flight_here: u64,

    received: Vec<ReceivedRange>,
    largest_received: Option<u64>,
    largest_received_time: Option<Instant>,
    ack_eliciting_since_last_ack: u32,
    ack_alarm: Option<Instant>,
    largest_acked_by_peer: Option<u64>,
    loss_time: Option<Instant>,
}

impl PnSpace {
    pub fn next_packet_number(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn largest_sent(&self) -> Option<u64> {
        if self.next_pn == 0 {
            None
        } else {
            Some(self.next_pn - 1)
        }
    }

    /// Record an outgoing packet for later loss/ack processing.
    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        self.bytes_in_flight_here += packet.in_flight.then_some(packet.size).unwrap_or(0) as u64;
        self.sent_packets.insert(packet.packet_number, packet);
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight_here
    }

    /// Record an inbound packet number. Returns `false` if this PN is a
    /// duplicate the caller must drop (spec.md Section 3 "Packet number").
    pub fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, now: Instant) -> bool {
        if self.is_duplicate(pn) {
            return false;
        }
        self.insert_received(pn);
        self.largest_received = Some(self.largest_received.map_or(pn, |l| l.max(pn)));
        if self.largest_received == Some(pn) {
            self.largest_received_time = Some(now);
        }
        if ack_eliciting {
            self.ack_eliciting_since_last_ack += 1;
            if self.ack_alarm.is_none() {
                self.ack_alarm = Some(now + DEFAULT_ACK_DELAY);
            }
        }
        true
    }

    fn is_duplicate(&self, pn: u64) -> bool {
        self.received.iter().any(|r| pn >= r.smallest && pn <= r.largest)
    }

    /// Like `is_duplicate`, exposed so the caller can check before deciding
    /// whether to spend the cost of decrypting and dispatching a packet.
    pub fn already_received(&self, pn: u64) -> bool {
        self.is_duplicate(pn)
    }

    fn insert_received(&mut self, pn: u64) {
        self.received.push(ReceivedRange { smallest: pn, largest: pn });
        self.received.sort_by(|a, b| b.largest.cmp(&a.largest));
        let mut merged: Vec<ReceivedRange> = Vec::with_capacity(self.received.len());
        for r in self.received.drain(..) {
            if let Some(last) = merged.last_mut() {
                if r.largest + 1 >= last.smallest {
                    last.smallest = last.smallest.min(r.smallest);
                    continue;
                }
            }
            merged.push(r);
        }
        self.received = merged;
    }

    /// True if an ACK is due right now: either two ack-eliciting packets
    /// have arrived since the last ACK, or the ack timer has fired.
    pub fn ack_due(&self, now: Instant) -> bool {
        self.ack_eliciting_since_last_ack >= 2 || matches!(self.ack_alarm, Some(t) if now >= t)
    }

    pub fn ack_timer(&self) -> Option<Instant> {
        self.ack_alarm
    }

    /// Build the ACK frame ranges and delay, clearing the "ack due" state.
    pub fn take_ack_ranges(&mut self, now: Instant) -> Option<(Vec<AckRange>, Duration)> {
        let largest_time = self.largest_received_time?;
        self.ack_eliciting_since_last_ack = 0;
        self.ack_alarm = None;
        let ranges = self
            .received
            .iter()
            .map(|r| AckRange { smallest: r.smallest, largest: r.largest })
            .collect();
        Some((ranges, now.saturating_duration_since(largest_time)))
    }

    /// Process an incoming ACK frame: mark packets acked, return them
    /// (for congestion-control bookkeeping) along with the largest newly
    /// acked packet's send time (for RTT sampling).
    pub fn on_ack_received(&mut self, ranges: &[AckRange]) -> Vec<SentPacket> {
        let mut acked = Vec::new();
        for range in ranges {
            for pn in range.smallest..=range.largest {
                if let Some(p) = self.sent_packets.remove(&pn) {
                    if p.in_flight {
                        self.bytes_in_flight_here = self.bytes_in_flight_here.saturating_sub(p.size as u64);
                    }
                    acked.push(p);
                }
            }
        }
        if let Some(largest) = ranges.iter().map(|r| r.largest).max() {
            self.largest_acked_by_peer = Some(self.largest_acked_by_peer.map_or(largest, |l| l.max(largest)));
        }
        acked
    }

    /// Detect packets lost by either the packet-reordering or time
    /// threshold (RFC 9002 Section 6.1), removing them from the sent map.
    pub fn detect_lost(&mut self, now: Instant, loss_delay: Duration) -> Vec<SentPacket> {
        let Some(largest_acked) = self.largest_acked_by_peer else {
            return Vec::new();
        };
        let mut lost_pns = Vec::new();
        self.loss_time = None;
        for (&pn, p) in self.sent_packets.iter() {
            if pn > largest_acked {
                continue;
            }
            let by_packets = largest_acked.saturating_sub(pn) >= PACKET_THRESHOLD;
            let by_time = now.saturating_duration_since(p.time_sent) >= loss_delay;
            if by_packets || by_time {
                lost_pns.push(pn);
            } else {
                let lose_at = p.time_sent + loss_delay;
                self.loss_time = Some(self.loss_time.map_or(lose_at, |t| t.min(lose_at)));
            }
        }
        lost_pns
            .into_iter()
            .filter_map(|pn| {
                let p = self.sent_packets.remove(&pn)?;
                if p.in_flight {
                    self.bytes_in_flight_here = self.bytes_in_flight_here.saturating_sub(p.size as u64);
                }
                Some(p)
            })
            .collect()
    }

    pub fn loss_time(&self) -> Option<Instant> {
        self.loss_time
    }

    /// Discard all state for this epoch (RFC 9001 Section 4.9, recovered in
    /// SPEC_FULL.md Section 3 "Elaboration").
    pub fn reset(&mut self) {
        *self = PnSpace::default();
    }

    pub fn has_in_flight(&self) -> bool {
        self.sent_packets.values().any(|p| p.in_flight)
    }

    pub fn oldest_unacked_send_time(&self) -> Option<Instant> {
        self.sent_packets.values().map(|p| p.time_sent).min()
    }

    pub fn largest_acked_by_peer(&self) -> Option<u64> {
        self.largest_acked_by_peer
    }

    /// The largest packet number received so far in this space, used to
    /// decode the next truncated packet number against (RFC 9000 Appendix
    /// A.3).
    pub fn largest_received_pn(&self) -> Option<u64> {
        self.largest_received
    }
}

/// Smoothed RTT / variance estimator (RFC 9002 Section 5).
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    latest_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    min_rtt: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: INITIAL_RTT,
            rttvar: INITIAL_RTT / 2,
            min_rtt: Duration::MAX,
            has_sample: false,
        }
    }
}

impl RttEstimator {
    pub fn update(&mut self, rtt_sample: Duration, ack_delay: Duration) {
        self.latest_rtt = rtt_sample;
        if !self.has_sample {
            self.has_sample = true;
            self.min_rtt = rtt_sample;
            self.smoothed_rtt = rtt_sample;
            self.rttvar = rtt_sample / 2;
            return;
        }
        self.min_rtt = self.min_rtt.min(rtt_sample);
        let adjusted = if rtt_sample >= self.min_rtt + ack_delay {
            rtt_sample - ack_delay
        } else {
            rtt_sample
        };
        let rttvar_sample = self.smoothed_rtt.abs_diff(adjusted);
        self.rttvar = (self.rttvar * 3 + rttvar_sample) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted) / 8;
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn pto_duration(&self, max_ack_delay: Duration) -> Duration {
        self.smoothed_rtt + (self.rttvar * 4).max(TIMER_GRANULARITY) + max_ack_delay
    }

    /// The time-threshold loss delay: `max(9/8 * max(srtt, latest_rtt), granularity)`.
    pub fn loss_delay(&self) -> Duration {
        let base = self.smoothed_rtt.max(self.latest_rtt);
        (base * TIME_THRESHOLD_NUMERATOR / TIME_THRESHOLD_DENOMINATOR).max(TIMER_GRANULARITY)
    }
}

/// NewReno-like congestion controller (spec.md Section 1, "a single NewReno-
/// like controller is assumed"; RFC 9002 Section 7).
#[derive(Debug, Clone, Copy)]
pub struct CongestionController {
    cwnd: u64,
    ssthresh: u64,
    recovery_start_time: Option<Instant>,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            ssthresh: u64::MAX,
            recovery_start_time: None,
        }
    }
}

impl CongestionController {
    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    pub fn can_send(&self, bytes_in_flight: u64, size: u64) -> bool {
        bytes_in_flight + size <= self.cwnd
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        matches!(self.recovery_start_time, Some(t) if sent_time <= t)
    }

    pub fn on_packet_acked(&mut self, sent_time: Instant, size: u64) {
        if self.in_recovery(sent_time) {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd += size;
        } else {
            self.cwnd += MAX_DATAGRAM_SIZE * size / self.cwnd;
        }
    }

    pub fn on_packets_lost(&mut self, now: Instant, largest_lost_sent_time: Instant) {
        if self.in_recovery(largest_lost_sent_time) {
            return;
        }
        self.recovery_start_time = Some(now);
        self.ssthresh = (self.cwnd / 2).max(MINIMUM_WINDOW);
        self.cwnd = self.ssthresh;
    }
}

/// Bundles the four epochs' packet-number spaces with the connection-wide
/// RTT estimator and congestion controller.
#[derive(Default)]
pub struct Recovery {
    pub spaces: [PnSpace; 4],
    pub rtt: RttEstimator,
    pub congestion: CongestionController,
    pub pto_count: u32,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn space(&self, epoch: Epoch) -> &PnSpace {
        &self.spaces[epoch_index(epoch)]
    }

    pub fn space_mut(&mut self, epoch: Epoch) -> &mut PnSpace {
        &mut self.spaces[epoch_index(epoch)]
    }

    pub fn total_bytes_in_flight(&self) -> u64 {
        self.spaces.iter().map(|s| s.bytes_in_flight()).sum()
    }

    /// The next PTO deadline across every space with packets in flight,
    /// scaled by `2^pto_count` for exponential backoff.
    pub fn pto_deadline(&self, max_ack_delay: Duration) -> Option<Instant> {
        let base = self.rtt.pto_duration(max_ack_delay) * (1u32 << self.pto_count.min(20));
        self.spaces
            .iter()
            .filter_map(|s| s.oldest_unacked_send_time())
            .min()
            .map(|t| t + base)
    }

    pub fn earliest_loss_time(&self) -> Option<Instant> {
        self.spaces.iter().filter_map(|s| s.loss_time()).min()
    }
}

pub(crate) fn epoch_index(epoch: Epoch) -> usize {
    match epoch {
        Epoch::Initial => 0,
        Epoch::ZeroRtt => 1,
        Epoch::Handshake => 2,
        Epoch::OneRtt => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(pn: u64, now: Instant, size: usize) -> SentPacket {
        SentPacket {
            packet_number: pn,
            time_sent: now,
            ack_eliciting: true,
            in_flight: true,
            size,
            frames: vec![SentFrame::Ping { uid: None }],
        }
    }

    #[test]
    fn duplicate_packet_numbers_are_rejected() {
        let mut space = PnSpace::default();
        let now = Instant::now();
        assert!(space.on_packet_received(5, true, now));
        assert!(!space.on_packet_received(5, true, now));
    }

    #[test]
    fn ack_ranges_merge_contiguous_and_gapped_packets() {
        let mut space = PnSpace::default();
        let now = Instant::now();
        for pn in [0u64, 1, 2, 5, 6] {
            space.on_packet_received(pn, true, now);
        }
        let (ranges, _) = space.take_ack_ranges(now).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].smallest, 5);
        assert_eq!(ranges[0].largest, 6);
        assert_eq!(ranges[1].smallest, 0);
        assert_eq!(ranges[1].largest, 2);
    }

    #[test]
    fn ack_received_frees_sent_packets_and_tracks_bytes_in_flight() {
        let mut space = PnSpace::default();
        let now = Instant::now();
        space.on_packet_sent(pkt(0, now, 100));
        space.on_packet_sent(pkt(1, now, 100));
        assert_eq!(space.bytes_in_flight(), 200);
        let acked = space.on_ack_received(&[AckRange { smallest: 0, largest: 1 }]);
        assert_eq!(acked.len(), 2);
        assert_eq!(space.bytes_in_flight(), 0);
    }

    #[test]
    fn packet_reorder_threshold_declares_loss() {
        let mut space = PnSpace::default();
        let now = Instant::now();
        for pn in 0..=5 {
            space.on_packet_sent(pkt(pn, now, 100));
        }
        space.on_ack_received(&[AckRange { smallest: 5, largest: 5 }]);
        let lost = space.detect_lost(now, Duration::from_secs(10));
        // pn 0,1,2 are more than PACKET_THRESHOLD=3 behind the largest acked (5).
        assert_eq!(lost.len(), 2);
        assert!(lost.iter().any(|p| p.packet_number == 0));
        assert!(lost.iter().any(|p| p.packet_number == 1));
    }

    #[test]
    fn congestion_window_grows_in_slow_start() {
        let mut cc = CongestionController::default();
        let start = cc.cwnd();
        cc.on_packet_acked(Instant::now(), 1000);
        assert!(cc.cwnd() > start);
    }

    #[test]
    fn loss_halves_congestion_window() {
        let mut cc = CongestionController::default();
        let now = Instant::now();
        let before = cc.cwnd();
        cc.on_packets_lost(now, now);
        assert_eq!(cc.cwnd(), (before / 2).max(MINIMUM_WINDOW));
    }

    #[test]
    fn rtt_estimator_tracks_first_sample_exactly() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::from_millis(5));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(100));
    }
}
