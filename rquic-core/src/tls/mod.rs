//! Embedded TLS 1.3 handshake (spec.md Section 4.3)
//!
//! `alert`/`extensions`/`handshake` are wire codecs; `keyschedule` derives
//! secrets from transcript state; `driver` is the sans-I/O state machine that
//! ties them together and emits `TlsEvent`s (chiefly key installs) to the
//! connection layer.

pub mod alert;
pub mod driver;
pub mod extensions;
pub mod handshake;
pub mod keyschedule;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use driver::{
    CertificateVerifier, ClientState, Driver, KeyDirection, ServerState, TlsConfig, TlsEvent,
};
