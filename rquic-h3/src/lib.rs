//! Minimal HTTP/3 framing and QPACK-driven header layer on top of
//! `rquic-core` streams (spec.md Section 4.7).
//!
//! This crate owns no transport state of its own: it drives a
//! `rquic_core::Connection` by reading `StreamDataReceived` events and
//! issuing `send_stream_data` calls back onto it. See `Http3Connection`.

pub mod connection;
pub mod error;
pub mod frame;
pub mod qpack;
pub mod stream;

pub use connection::{Event, Http3Connection};
pub use error::{Error, Http3Error, Result};
