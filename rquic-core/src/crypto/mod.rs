//! Packet protection
//!
//! `provider` is the host-pluggable primitive surface (HKDF/AEAD/HP/ECDH).
//! `pair` builds the per-epoch send/receive key pairs on top of it: initial
//! secret derivation, header protection apply/remove, and the full
//! encrypt/decrypt packet pipeline.

pub mod pair;
pub mod provider;

pub use pair::{CryptoContext, CryptoPair, Epoch};
pub use provider::{CipherSuite, CryptoKeys, CryptoProvider, DefaultCryptoProvider};
