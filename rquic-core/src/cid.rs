//! Connection identifiers
//!
//! An opaque byte string, 8-20 bytes. Each endpoint holds a sequence of
//! `HostCid`s (local, sequence-numbered from 0, each with a stateless-reset
//! token) and `PeerCid`s (issued by the peer, sequence-numbered).

use std::collections::VecDeque;
use std::fmt;

use rand::RngCore;

pub const MAX_CID_LEN: usize = 20;
pub const MIN_CID_LEN: usize = 8;

/// A QUIC connection ID: a fixed backing array plus a length, so it is
/// `Copy` and avoids a heap allocation per CID.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    data: [u8; MAX_CID_LEN],
    len: u8,
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_LEN, "connection id too long");
        let mut data = [0u8; MAX_CID_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            data,
            len: bytes.len() as u8,
        }
    }

    pub fn empty() -> Self {
        Self {
            data: [0u8; MAX_CID_LEN],
            len: 0,
        }
    }

    pub fn random(rng: &mut impl RngCore, len: usize) -> Self {
        assert!((MIN_CID_LEN..=MAX_CID_LEN).contains(&len));
        let mut data = [0u8; MAX_CID_LEN];
        rng.fill_bytes(&mut data[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid(")?;
        for b in self.as_slice() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// A connection ID this endpoint has issued to the peer.
#[derive(Debug, Clone)]
pub struct HostCid {
    pub cid: ConnectionId,
    pub seq: u64,
    pub stateless_reset_token: [u8; 16],
    pub retired: bool,
}

/// A connection ID the peer has issued to this endpoint.
#[derive(Debug, Clone)]
pub struct PeerCid {
    pub cid: ConnectionId,
    pub seq: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub retired: bool,
}

/// Tracks the local (`HostCid`) and peer (`PeerCid`) sequences for a
/// connection, enforcing that the CID used on any outgoing packet is
/// always present and non-retired.
#[derive(Debug, Default)]
pub struct CidManager {
    host_cids: VecDeque<HostCid>,
    peer_cids: VecDeque<PeerCid>,
    next_host_seq: u64,
    active_peer_seq: u64,
    retire_prior_to: u64,
}

impl CidManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue_host_cid(&mut self, rng: &mut impl RngCore, len: usize) -> HostCid {
        let seq = self.next_host_seq;
        self.next_host_seq += 1;
        let mut token = [0u8; 16];
        rng.fill_bytes(&mut token);
        let hc = HostCid {
            cid: ConnectionId::random(rng, len),
            seq,
            stateless_reset_token: token,
            retired: false,
        };
        self.host_cids.push_back(hc.clone());
        hc
    }

    pub fn host_cids(&self) -> impl Iterator<Item = &HostCid> {
        self.host_cids.iter()
    }

    pub fn retire_host_cid(&mut self, seq: u64) {
        if let Some(hc) = self.host_cids.iter_mut().find(|h| h.seq == seq) {
            hc.retired = true;
        }
    }

    pub fn learn_peer_cid(&mut self, cid: ConnectionId, seq: u64, token: Option<[u8; 16]>) {
        if self.peer_cids.iter().any(|p| p.seq == seq) {
            return;
        }
        self.peer_cids.push_back(PeerCid {
            cid,
            seq,
            stateless_reset_token: token,
            retired: false,
        });
    }

    /// The currently active peer CID (the one used on outgoing packets).
    pub fn active_peer_cid(&self) -> Option<&PeerCid> {
        self.peer_cids.iter().find(|p| p.seq == self.active_peer_seq && !p.retired)
    }

    pub fn active_peer_seq(&self) -> u64 {
        self.active_peer_seq
    }

    /// Picks the next available (non-retired, not currently active) peer
    /// CID and retires the old sequence number, returning it for the
    /// caller to emit a RETIRE_CONNECTION_ID frame.
    pub fn rotate_peer_cid(&mut self) -> Option<u64> {
        let old_seq = self.active_peer_seq;
        let next = self
            .peer_cids
            .iter()
            .find(|p| p.seq != old_seq && !p.retired)
            .map(|p| p.seq)?;
        if let Some(old) = self.peer_cids.iter_mut().find(|p| p.seq == old_seq) {
            old.retired = true;
        }
        self.active_peer_seq = next;
        Some(old_seq)
    }

    /// True if `seq` names the peer CID currently in active use.
    pub fn is_active_peer_seq(&self, seq: u64) -> bool {
        seq == self.active_peer_seq
    }

    pub fn retire_peer_cid(&mut self, seq: u64) {
        if let Some(p) = self.peer_cids.iter_mut().find(|p| p.seq == seq) {
            p.retired = true;
        }
        self.peer_cids.retain(|p| p.seq >= self.retire_prior_to);
    }

    pub fn peer_cid_count(&self) -> usize {
        self.peer_cids.iter().filter(|p| !p.retired).count()
    }

    /// The sequence number of the host CID whose bytes match `cid`, if any
    /// is currently tracked. Used to detect a peer retiring the CID it is
    /// using to address this endpoint right now (spec.md Section 4.6).
    pub fn host_cid_seq_for(&self, cid: &ConnectionId) -> Option<u64> {
        self.host_cids.iter().find(|h| &h.cid == cid).map(|h| h.seq)
    }

    pub fn host_cid_count(&self) -> usize {
        self.host_cids.iter().filter(|h| !h.retired).count()
    }

    /// Seed the first (seq 0) peer CID directly from the connection
    /// preferred address bytes observed on the wire, bypassing
    /// `learn_peer_cid`'s append-only growth so the initial handshake path
    /// can be routed before any NEW_CONNECTION_ID frame has arrived.
    pub fn set_initial_peer_cid(&mut self, cid: ConnectionId) {
        if self.peer_cids.is_empty() {
            self.peer_cids.push_back(PeerCid {
                cid,
                seq: 0,
                stateless_reset_token: None,
                retired: false,
            });
        } else if let Some(p) = self.peer_cids.front_mut() {
            if p.seq == 0 {
                p.cid = cid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    #[test]
    fn connection_id_round_trips_bytes() {
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let cid = ConnectionId::new(&bytes);
        assert_eq!(cid.as_slice(), &bytes[..]);
        assert_eq!(cid.len(), 8);
    }

    #[test]
    fn rotate_peer_cid_retires_old_sequence() {
        let mut mgr = CidManager::new();
        let mut r = rng();
        mgr.learn_peer_cid(ConnectionId::random(&mut r, 8), 0, None);
        mgr.learn_peer_cid(ConnectionId::random(&mut r, 8), 1, None);
        assert_eq!(mgr.active_peer_seq(), 0);

        let retired = mgr.rotate_peer_cid().unwrap();
        assert_eq!(retired, 0);
        assert_eq!(mgr.active_peer_seq(), 1);
        assert!(mgr.is_active_peer_seq(1));
    }

    #[test]
    fn cannot_rotate_without_spare_cid() {
        let mut mgr = CidManager::new();
        let mut r = rng();
        mgr.learn_peer_cid(ConnectionId::random(&mut r, 8), 0, None);
        assert!(mgr.rotate_peer_cid().is_none());
    }
}
