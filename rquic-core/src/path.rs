//! Network paths and path validation (spec.md Section 3/4.6)
//!
//! A path tracks bytes sent/received for the anti-amplification limit while
//! unvalidated, plus the outstanding PATH_CHALLENGE data used to validate
//! it. On receipt of a packet from a new address the connection creates an
//! unvalidated path and challenges it; a matching PATH_RESPONSE validates.

use std::net::SocketAddr;

use rand::RngCore;

/// While unvalidated, an endpoint may send at most 3x what it has received
/// on that path (RFC 9000 Section 8.1).
pub const AMPLIFICATION_FACTOR: u64 = 3;

#[derive(Debug, Clone)]
pub struct NetworkPath {
    pub addr: SocketAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub is_validated: bool,
    pub challenge_data: Option<[u8; 8]>,
}

impl NetworkPath {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            bytes_sent: 0,
            bytes_received: 0,
            is_validated: false,
            challenge_data: None,
        }
    }

    /// A path this endpoint originated (e.g. the client's initial path) is
    /// trusted from the start; only paths discovered via an unexpected
    /// source address need challenging.
    pub fn new_validated(addr: SocketAddr) -> Self {
        let mut p = Self::new(addr);
        p.is_validated = true;
        p
    }

    pub fn on_sent(&mut self, len: usize) {
        self.bytes_sent += len as u64;
    }

    pub fn on_received(&mut self, len: usize) {
        self.bytes_received += len as u64;
    }

    /// How many more bytes this endpoint may send on an unvalidated path
    /// before hitting the anti-amplification limit.
    pub fn amplification_budget(&self) -> u64 {
        if self.is_validated {
            u64::MAX
        } else {
            (self.bytes_received * AMPLIFICATION_FACTOR).saturating_sub(self.bytes_sent)
        }
    }

    pub fn is_amplification_limited(&self) -> bool {
        !self.is_validated && self.amplification_budget() == 0
    }

    /// Start (or restart) path validation: generate a PATH_CHALLENGE payload
    /// to emit.
    pub fn start_challenge(&mut self, rng: &mut impl RngCore) -> [u8; 8] {
        let mut data = [0u8; 8];
        rng.fill_bytes(&mut data);
        self.challenge_data = Some(data);
        data
    }

    /// A PATH_RESPONSE arrived; validates the path if the echoed data
    /// matches the outstanding challenge. Returns true if this completed
    /// validation.
    pub fn on_path_response(&mut self, data: &[u8; 8]) -> bool {
        if self.challenge_data == Some(*data) {
            self.is_validated = true;
            self.challenge_data = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn unvalidated_path_enforces_amplification_limit() {
        let mut path = NetworkPath::new(addr());
        path.on_received(100);
        assert_eq!(path.amplification_budget(), 300);
        path.on_sent(300);
        assert!(path.is_amplification_limited());
    }

    #[test]
    fn validated_path_has_no_amplification_limit() {
        let mut path = NetworkPath::new_validated(addr());
        path.on_sent(1_000_000);
        assert!(!path.is_amplification_limited());
    }

    #[test]
    fn matching_path_response_validates() {
        let mut path = NetworkPath::new(addr());
        let mut rng = rand::rngs::mock::StepRng::new(1, 1);
        let challenge = path.start_challenge(&mut rng);
        assert!(!path.is_validated);
        assert!(path.on_path_response(&challenge));
        assert!(path.is_validated);
    }

    #[test]
    fn mismatched_path_response_does_not_validate() {
        let mut path = NetworkPath::new(addr());
        let mut rng = rand::rngs::mock::StepRng::new(1, 1);
        path.start_challenge(&mut rng);
        assert!(!path.on_path_response(&[0xffu8; 8]));
        assert!(!path.is_validated);
    }
}
