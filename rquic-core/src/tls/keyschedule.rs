//! TLS 1.3 key schedule (RFC 8446 Section 7.1)
//!
//! Early -> Handshake -> Master secret, each producing labelled traffic
//! secrets via `derive-secret`. The transcript hash uses a "copy-and-finalize"
//! pattern (spec.md Section 9 design note): `finish_clone` peeks the running
//! hash without consuming the live hasher, since the same transcript state
//! is read at multiple points (ServerHello, server Finished, client Finished).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use crate::crypto::provider::{CipherSuite, CryptoProvider};

enum TranscriptHasher {
    Sha256(Sha256),
    Sha384(Sha384),
}

/// An incremental transcript hash over every handshake message in the order
/// sent/received, with a non-consuming "peek" operation.
pub struct TranscriptHash {
    inner: TranscriptHasher,
}

impl TranscriptHash {
    pub fn new(suite: CipherSuite) -> Self {
        Self {
            inner: if suite.is_sha384() {
                TranscriptHasher::Sha384(Sha384::new())
            } else {
                TranscriptHasher::Sha256(Sha256::new())
            },
        }
    }

    pub fn update(&mut self, msg: &[u8]) {
        match &mut self.inner {
            TranscriptHasher::Sha256(h) => h.update(msg),
            TranscriptHasher::Sha384(h) => h.update(msg),
        }
    }

    /// Clone the live hasher and finalize the clone, leaving the original
    /// hasher free to keep accumulating messages.
    pub fn finish_clone(&self) -> Vec<u8> {
        match &self.inner {
            TranscriptHasher::Sha256(h) => h.clone().finalize().to_vec(),
            TranscriptHasher::Sha384(h) => h.clone().finalize().to_vec(),
        }
    }

    /// `Transcript-Hash("")`, used as the context for the `"derived"` stage
    /// secrets before any handshake message exists.
    pub fn empty_hash(suite: CipherSuite) -> Vec<u8> {
        if suite.is_sha384() {
            Sha384::digest([]).to_vec()
        } else {
            Sha256::digest([]).to_vec()
        }
    }
}

/// `Derive-Secret(Secret, Label, Messages) = HKDF-Expand-Label(Secret, Label,
/// Transcript-Hash(Messages), Hash.length)`.
pub fn derive_secret(
    provider: &dyn CryptoProvider,
    suite: CipherSuite,
    secret: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
) -> Vec<u8> {
    provider.hkdf_expand_label(suite, secret, label, transcript_hash, suite.hash_len())
}

/// `Early Secret = HKDF-Extract(0, PSK)`, with a zero-filled IKM when there
/// is no PSK (the common case for this driver's connections).
pub fn early_secret(provider: &dyn CryptoProvider, suite: CipherSuite, psk: Option<&[u8]>) -> Vec<u8> {
    let zero_salt = vec![0u8; suite.hash_len()];
    let zero_ikm = vec![0u8; suite.hash_len()];
    let ikm = psk.unwrap_or(&zero_ikm);
    provider.hkdf_extract(suite, &zero_salt, ikm)
}

/// `Handshake Secret = HKDF-Extract(Derive-Secret(Early Secret, "derived", ""), (EC)DHE)`.
pub fn handshake_secret(
    provider: &dyn CryptoProvider,
    suite: CipherSuite,
    early_secret: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let empty_hash = TranscriptHash::empty_hash(suite);
    let salt = derive_secret(provider, suite, early_secret, b"derived", &empty_hash);
    provider.hkdf_extract(suite, &salt, shared_secret)
}

/// `Master Secret = HKDF-Extract(Derive-Secret(Handshake Secret, "derived", ""), 0)`.
pub fn master_secret(provider: &dyn CryptoProvider, suite: CipherSuite, handshake_secret: &[u8]) -> Vec<u8> {
    let empty_hash = TranscriptHash::empty_hash(suite);
    let salt = derive_secret(provider, suite, handshake_secret, b"derived", &empty_hash);
    let zero_ikm = vec![0u8; suite.hash_len()];
    provider.hkdf_extract(suite, &salt, &zero_ikm)
}

/// The Finished message's `verify_data = HMAC(finished_key, Transcript-Hash(Messages))`,
/// where `finished_key = HKDF-Expand-Label(BaseKey, "finished", "", Hash.length)`.
pub fn finished_verify_data(
    provider: &dyn CryptoProvider,
    suite: CipherSuite,
    base_secret: &[u8],
    transcript_hash: &[u8],
) -> Vec<u8> {
    let finished_key = provider.hkdf_expand_label(suite, base_secret, b"finished", &[], suite.hash_len());
    if suite.is_sha384() {
        let mut mac = Hmac::<Sha384>::new_from_slice(&finished_key).expect("hmac accepts any key length");
        mac.update(transcript_hash);
        mac.finalize().into_bytes().to_vec()
    } else {
        let mut mac = Hmac::<Sha256>::new_from_slice(&finished_key).expect("hmac accepts any key length");
        mac.update(transcript_hash);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::DefaultCryptoProvider;

    #[test]
    fn full_schedule_produces_distinct_stage_secrets() {
        let provider = DefaultCryptoProvider;
        let suite = CipherSuite::Aes128GcmSha256;

        let mut transcript = TranscriptHash::new(suite);
        transcript.update(b"client hello bytes");
        let hash_after_ch = transcript.finish_clone();
        transcript.update(b"server hello bytes");
        let hash_after_sh = transcript.finish_clone();

        let early = early_secret(&provider, suite, None);
        let shared = [0x42u8; 32];
        let handshake = handshake_secret(&provider, suite, &early, &shared);
        let master = master_secret(&provider, suite, &handshake);

        let c_hs_traffic = derive_secret(&provider, suite, &handshake, b"c hs traffic", &hash_after_sh);
        let s_hs_traffic = derive_secret(&provider, suite, &handshake, b"s hs traffic", &hash_after_sh);
        let c_ap_traffic = derive_secret(&provider, suite, &master, b"c ap traffic", &hash_after_sh);

        assert_ne!(c_hs_traffic, s_hs_traffic);
        assert_ne!(c_hs_traffic, c_ap_traffic);
        assert_ne!(hash_after_ch, hash_after_sh);
    }

    #[test]
    fn finish_clone_does_not_consume_the_hasher() {
        let mut transcript = TranscriptHash::new(CipherSuite::Aes128GcmSha256);
        transcript.update(b"message one");
        let peek_a = transcript.finish_clone();
        let peek_b = transcript.finish_clone();
        assert_eq!(peek_a, peek_b);
        transcript.update(b"message two");
        let peek_c = transcript.finish_clone();
        assert_ne!(peek_b, peek_c);
    }

    #[test]
    fn finished_verify_data_is_hash_length() {
        let provider = DefaultCryptoProvider;
        let suite = CipherSuite::Aes128GcmSha256;
        let secret = [0x11u8; 32];
        let hash = [0x22u8; 32];
        let verify_data = finished_verify_data(&provider, suite, &secret, &hash);
        assert_eq!(verify_data.len(), suite.hash_len());
    }
}
