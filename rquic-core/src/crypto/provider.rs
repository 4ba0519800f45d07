//! Crypto provider
//!
//! For each cipher suite derive `(key, iv, hp)` from a traffic secret via
//! HKDF-Expand-Label with labels `"quic key"`, `"quic iv"`, `"quic hp"`.
//! This module defines the `CryptoProvider` trait (the host-supplied
//! collaborator from the external interfaces section) and ships a default
//! implementation backed by RustCrypto crates.

use aes::cipher::{BlockEncrypt, KeyInit as AesKeyInit};
use aes::{Aes128, Aes256};
use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use hmac::Hmac;
use sha2::{Sha256, Sha384};

use crate::error::{CryptoError, Result};

/// AEAD/cipher suite selection, keyed to the hash algorithm its key
/// schedule uses (RFC 9001 Section 5.3 / RFC 8446 Appendix B.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    Chacha20Poly1305Sha256,
}

impl CipherSuite {
    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 16,
            CipherSuite::Aes256GcmSha384 => 32,
            CipherSuite::Chacha20Poly1305Sha256 => 32,
        }
    }

    pub const IV_LEN: usize = 12;
    pub const TAG_LEN: usize = 16;
    pub const HP_SAMPLE_LEN: usize = 16;

    pub fn hash_len(self) -> usize {
        match self {
            CipherSuite::Aes256GcmSha384 => 48,
            _ => 32,
        }
    }

    pub fn is_sha384(self) -> bool {
        matches!(self, CipherSuite::Aes256GcmSha384)
    }

    pub fn tls_id(self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::Aes256GcmSha384 => 0x1302,
            CipherSuite::Chacha20Poly1305Sha256 => 0x1303,
        }
    }

    pub fn from_tls_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1302 => Some(CipherSuite::Aes256GcmSha384),
            0x1303 => Some(CipherSuite::Chacha20Poly1305Sha256),
            _ => None,
        }
    }
}

/// Derived per-epoch key material: the AEAD key, IV (nonce base), and
/// header-protection key.
#[derive(Clone)]
pub struct CryptoKeys {
    pub key: Vec<u8>,
    pub iv: [u8; CipherSuite::IV_LEN],
    pub hp: Vec<u8>,
    pub suite: CipherSuite,
}

impl CryptoKeys {
    pub fn compute_nonce(&self, packet_number: u64) -> [u8; CipherSuite::IV_LEN] {
        let mut nonce = self.iv;
        let pn = packet_number.to_be_bytes();
        for i in 0..8 {
            nonce[CipherSuite::IV_LEN - 8 + i] ^= pn[i];
        }
        nonce
    }
}

/// The host-supplied cryptographic primitive surface (RFC/spec "Crypto
/// provider API"): HKDF, AEAD, header-protection mask derivation, and
/// ECDH key exchange. Treated as a black box from the QUIC/TLS core's
/// point of view.
pub trait CryptoProvider: Send + Sync {
    fn hkdf_extract(&self, suite: CipherSuite, salt: &[u8], ikm: &[u8]) -> Vec<u8>;

    fn hkdf_expand_label(
        &self,
        suite: CipherSuite,
        secret: &[u8],
        label: &[u8],
        context: &[u8],
        length: usize,
    ) -> Vec<u8>;

    fn aead_seal(
        &self,
        suite: CipherSuite,
        key: &[u8],
        nonce: &[u8; CipherSuite::IV_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    fn aead_open(
        &self,
        suite: CipherSuite,
        key: &[u8],
        nonce: &[u8; CipherSuite::IV_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    fn hp_mask(&self, suite: CipherSuite, hp_key: &[u8], sample: &[u8]) -> Result<[u8; 5]>;

    /// Generate an ephemeral P-256 key pair: `(private, public uncompressed X9.62)`.
    fn ecdh_generate(&self) -> (Vec<u8>, Vec<u8>);

    /// Derive the ECDH shared secret given our private scalar and the peer's
    /// uncompressed public point.
    fn ecdh_derive(&self, private: &[u8], peer_public: &[u8]) -> Result<Vec<u8>>;

    /// Derive the packet-protection keys for a traffic secret.
    fn derive_keys(&self, suite: CipherSuite, secret: &[u8]) -> CryptoKeys {
        let key = self.hkdf_expand_label(suite, secret, b"quic key", &[], suite.key_len());
        let iv_vec = self.hkdf_expand_label(suite, secret, b"quic iv", &[], CipherSuite::IV_LEN);
        let hp = self.hkdf_expand_label(suite, secret, b"quic hp", &[], suite.key_len());
        let mut iv = [0u8; CipherSuite::IV_LEN];
        iv.copy_from_slice(&iv_vec);
        CryptoKeys { key, iv, hp, suite }
    }
}

/// Default `CryptoProvider` backed by RustCrypto crates.
#[derive(Default)]
pub struct DefaultCryptoProvider;

/// HKDF-Expand-Label per RFC 8446 Section 7.1 / RFC 9001: the label is
/// always prefixed with `"tls13 "` before being HKDF-Expanded.
fn hkdf_label(label: &[u8], context: &[u8], length: usize) -> Vec<u8> {
    let mut full_label = Vec::with_capacity(6 + label.len());
    full_label.extend_from_slice(b"tls13 ");
    full_label.extend_from_slice(label);

    let mut out = Vec::with_capacity(2 + 1 + full_label.len() + 1 + context.len());
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.push(full_label.len() as u8);
    out.extend_from_slice(&full_label);
    out.push(context.len() as u8);
    out.extend_from_slice(context);
    out
}

impl CryptoProvider for DefaultCryptoProvider {
    fn hkdf_extract(&self, suite: CipherSuite, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
        if suite.is_sha384() {
            let (prk, _) = Hkdf::<Sha384>::extract(Some(salt), ikm);
            prk.to_vec()
        } else {
            let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
            prk.to_vec()
        }
    }

    fn hkdf_expand_label(
        &self,
        suite: CipherSuite,
        secret: &[u8],
        label: &[u8],
        context: &[u8],
        length: usize,
    ) -> Vec<u8> {
        let info = hkdf_label(label, context, length);
        let mut out = vec![0u8; length];
        if suite.is_sha384() {
            let hk = Hkdf::<Sha384>::from_prk(secret).expect("secret length valid for sha384 hkdf");
            hk.expand(&info, &mut out).expect("expand length in range");
        } else {
            let hk = Hkdf::<Sha256>::from_prk(secret).expect("secret length valid for sha256 hkdf");
            hk.expand(&info, &mut out).expect("expand length in range");
        }
        out
    }

    fn aead_seal(
        &self,
        suite: CipherSuite,
        key: &[u8],
        nonce: &[u8; CipherSuite::IV_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match suite {
            CipherSuite::Aes128GcmSha256 => {
                let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
                cipher.encrypt(nonce, payload).map_err(|_| CryptoError::Encryption.into())
            }
            CipherSuite::Aes256GcmSha384 => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
                cipher.encrypt(nonce, payload).map_err(|_| CryptoError::Encryption.into())
            }
            CipherSuite::Chacha20Poly1305Sha256 => {
                let cipher =
                    ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
                cipher.encrypt(nonce, payload).map_err(|_| CryptoError::Encryption.into())
            }
        }
    }

    fn aead_open(
        &self,
        suite: CipherSuite,
        key: &[u8],
        nonce: &[u8; CipherSuite::IV_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match suite {
            CipherSuite::Aes128GcmSha256 => {
                let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
                cipher.decrypt(nonce, payload).map_err(|_| CryptoError::Decryption.into())
            }
            CipherSuite::Aes256GcmSha384 => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
                cipher.decrypt(nonce, payload).map_err(|_| CryptoError::Decryption.into())
            }
            CipherSuite::Chacha20Poly1305Sha256 => {
                let cipher =
                    ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
                cipher.decrypt(nonce, payload).map_err(|_| CryptoError::Decryption.into())
            }
        }
    }

    fn hp_mask(&self, suite: CipherSuite, hp_key: &[u8], sample: &[u8]) -> Result<[u8; 5]> {
        if sample.len() < CipherSuite::HP_SAMPLE_LEN {
            return Err(CryptoError::HeaderProtection.into());
        }
        let mut mask = [0u8; 5];
        match suite {
            CipherSuite::Aes128GcmSha256 | CipherSuite::Aes256GcmSha384 => {
                // mask = AES-ECB(hp_key, sample). A single-block ECB
                // encryption is a CTR encryption of an all-zero block.
                let block_out = aes_ecb_encrypt_block(suite, hp_key, &sample[..16])?;
                mask.copy_from_slice(&block_out[..5]);
            }
            CipherSuite::Chacha20Poly1305Sha256 => {
                let counter = u32::from_le_bytes(sample[0..4].try_into().unwrap());
                let nonce: [u8; 12] = sample[4..16].try_into().unwrap();
                let key = GenericArray::from_slice(hp_key);
                let mut cipher = chacha20::ChaCha20::new(key, &nonce.into());
                // `counter` is a block counter; chacha20's seek position is
                // in bytes, and each block is 64 bytes.
                cipher.seek(counter as u64 * 64);
                let mut buf = [0u8; 5];
                cipher.apply_keystream(&mut buf);
                mask = buf;
            }
        }
        Ok(mask)
    }

    fn ecdh_generate(&self) -> (Vec<u8>, Vec<u8>) {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let public = secret.public_key().to_encoded_point(false);
        (secret.to_bytes().to_vec(), public.as_bytes().to_vec())
    }

    fn ecdh_derive(&self, private: &[u8], peer_public: &[u8]) -> Result<Vec<u8>> {
        use p256::elliptic_curve::sec1::FromEncodedPoint;
        let secret = p256::SecretKey::from_slice(private).map_err(|_| CryptoError::KeyExchange)?;
        let encoded = p256::EncodedPoint::from_bytes(peer_public).map_err(|_| CryptoError::KeyExchange)?;
        let peer_public_key: Option<p256::PublicKey> =
            p256::PublicKey::from_encoded_point(&encoded).into();
        let peer_public_key = peer_public_key.ok_or(CryptoError::KeyExchange)?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_public_key.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

/// Single AES-block ECB encryption used only to derive the 5-byte header
/// protection mask (never used to encrypt attacker-controlled data).
fn aes_ecb_encrypt_block(suite: CipherSuite, key: &[u8], block: &[u8]) -> Result<[u8; 16]> {
    let mut ga = GenericArray::clone_from_slice(block);
    match suite {
        CipherSuite::Aes128GcmSha256 => {
            let cipher = Aes128::new_from_slice(key).map_err(|_| CryptoError::HeaderProtection)?;
            cipher.encrypt_block(&mut ga);
        }
        CipherSuite::Aes256GcmSha384 => {
            let cipher = Aes256::new_from_slice(key).map_err(|_| CryptoError::HeaderProtection)?;
            cipher.encrypt_block(&mut ga);
        }
        CipherSuite::Chacha20Poly1305Sha256 => unreachable!("chacha handled separately"),
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&ga);
    Ok(out)
}

pub type HmacSha256 = Hmac<Sha256>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes128gcm_round_trips() {
        let provider = DefaultCryptoProvider;
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 12];
        let aad = b"header";
        let plaintext = b"hello quic";
        let ct = provider
            .aead_seal(CipherSuite::Aes128GcmSha256, &key, &nonce, aad, plaintext)
            .unwrap();
        let pt = provider
            .aead_open(CipherSuite::Aes128GcmSha256, &key, &nonce, aad, &ct)
            .unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn chacha20poly1305_round_trips() {
        let provider = DefaultCryptoProvider;
        let key = [0x33u8; 32];
        let nonce = [0x44u8; 12];
        let aad = b"header";
        let plaintext = b"hello quic over chacha";
        let ct = provider
            .aead_seal(CipherSuite::Chacha20Poly1305Sha256, &key, &nonce, aad, plaintext)
            .unwrap();
        let pt = provider
            .aead_open(CipherSuite::Chacha20Poly1305Sha256, &key, &nonce, aad, &ct)
            .unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn tamper_detected() {
        let provider = DefaultCryptoProvider;
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 12];
        let mut ct = provider
            .aead_seal(CipherSuite::Aes128GcmSha256, &key, &nonce, b"aad", b"data")
            .unwrap();
        *ct.last_mut().unwrap() ^= 1;
        assert!(provider
            .aead_open(CipherSuite::Aes128GcmSha256, &key, &nonce, b"aad", &ct)
            .is_err());
    }

    #[test]
    fn ecdh_round_trips() {
        let provider = DefaultCryptoProvider;
        let (priv_a, pub_a) = provider.ecdh_generate();
        let (priv_b, pub_b) = provider.ecdh_generate();
        let shared_a = provider.ecdh_derive(&priv_a, &pub_b).unwrap();
        let shared_b = provider.ecdh_derive(&priv_b, &pub_a).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    /// RFC 9001 Appendix A.1: derive initial secrets / keys from the
    /// well-known initial DCID and verify the client key/IV match exactly.
    #[test]
    fn rfc9001_initial_secrets_test_vector() {
        use hex_literal::hex;
        let provider = DefaultCryptoProvider;
        let initial_salt = hex!("38762cf7f55934b34d179ae6a4c80cadccbb7f0a");
        let dcid = hex!("8394c8f03e515708");

        let initial_secret = provider.hkdf_extract(CipherSuite::Aes128GcmSha256, &initial_salt, &dcid);
        let client_secret = provider.hkdf_expand_label(
            CipherSuite::Aes128GcmSha256,
            &initial_secret,
            b"client in",
            &[],
            32,
        );
        let key = provider.hkdf_expand_label(
            CipherSuite::Aes128GcmSha256,
            &client_secret,
            b"quic key",
            &[],
            16,
        );
        let iv = provider.hkdf_expand_label(
            CipherSuite::Aes128GcmSha256,
            &client_secret,
            b"quic iv",
            &[],
            12,
        );
        assert_eq!(key, hex!("1f369613dd76d5467730efcbe3b1a22"));
        assert_eq!(iv, hex!("fa044b2f42a3fd3b46fb255c"));
    }
}
