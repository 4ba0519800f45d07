//! Error types
//!
//! Mirrors the transport crate's split between wire-visible errors and
//! local misuse: an `Http3Error` here becomes a QUIC application-level
//! CONNECTION_CLOSE or STOP_SENDING code on the stream that triggered it.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// HTTP/3 error codes (RFC 9114 Section 8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http3Error {
    NoError,
    GeneralProtocolError,
    InternalError,
    StreamCreationError,
    ClosedCriticalStream,
    FrameUnexpected,
    FrameError,
    ExcessiveLoad,
    IdError,
    SettingsError,
    MissingSettings,
    RequestRejected,
    RequestCancelled,
    RequestIncomplete,
    MessageError,
    ConnectError,
    VersionFallback,
    /// QPACK decompression failure (RFC 9204 Section 6).
    QpackDecompressionFailed,
    QpackEncoderStreamError,
    QpackDecoderStreamError,
}

impl Http3Error {
    pub fn as_u64(self) -> u64 {
        match self {
            Http3Error::NoError => 0x0100,
            Http3Error::GeneralProtocolError => 0x0101,
            Http3Error::InternalError => 0x0102,
            Http3Error::StreamCreationError => 0x0103,
            Http3Error::ClosedCriticalStream => 0x0104,
            Http3Error::FrameUnexpected => 0x0105,
            Http3Error::FrameError => 0x0106,
            Http3Error::ExcessiveLoad => 0x0107,
            Http3Error::IdError => 0x0108,
            Http3Error::SettingsError => 0x0109,
            Http3Error::MissingSettings => 0x010a,
            Http3Error::RequestRejected => 0x010b,
            Http3Error::RequestCancelled => 0x010c,
            Http3Error::RequestIncomplete => 0x010d,
            Http3Error::MessageError => 0x010e,
            Http3Error::ConnectError => 0x010f,
            Http3Error::VersionFallback => 0x0110,
            Http3Error::QpackDecompressionFailed => 0x0200,
            Http3Error::QpackEncoderStreamError => 0x0201,
            Http3Error::QpackDecoderStreamError => 0x0202,
        }
    }
}

impl fmt::Display for Http3Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} (0x{:04x})", self.as_u64())
    }
}

/// Local programmer misuse: operations that never touch the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    UnknownStream,
    NotAControlStream,
    CriticalStreamAlreadyOpened,
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Misuse::UnknownStream => write!(f, "unknown stream id"),
            Misuse::NotAControlStream => write!(f, "operation requires a control stream"),
            Misuse::CriticalStreamAlreadyOpened => write!(f, "critical stream type already opened"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Protocol(Http3Error, &'static str),
    Misuse(Misuse),
    Transport(rquic_core::error::Error),
}

impl From<Misuse> for Error {
    fn from(e: Misuse) -> Self {
        Error::Misuse(e)
    }
}

impl From<rquic_core::error::Error> for Error {
    fn from(e: rquic_core::error::Error) -> Self {
        Error::Transport(e)
    }
}

impl Error {
    pub fn protocol(code: Http3Error, reason: &'static str) -> Self {
        Error::Protocol(code, reason)
    }

    /// The application error code this failure should be reported with, if
    /// it is one this layer originated (as opposed to a transport error).
    pub fn code(&self) -> Option<u64> {
        match self {
            Error::Protocol(code, _) => Some(code.as_u64()),
            Error::Misuse(_) => None,
            Error::Transport(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(code, reason) => write!(f, "{code}: {reason}"),
            Error::Misuse(e) => write!(f, "{e}"),
            Error::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}
