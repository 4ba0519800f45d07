//! Sans-I/O QUIC transport (IETF drafts 19/20) with an embedded TLS 1.3
//! handshake driver.
//!
//! This crate does no I/O itself: callers push received datagrams in and
//! pull datagrams/events out, driving timers externally. See `Connection`
//! in `connection` for the top-level state machine.

pub mod buffer;
pub mod builder;
pub mod cid;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod packet;
pub mod path;
pub mod recovery;
pub mod stream;
pub mod tls;
pub mod tp;

pub use config::{Config, Event};
pub use connection::Connection;
pub use error::{Error, Result};
