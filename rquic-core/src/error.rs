//! Error types
//!
//! Two axes, per the transport's error handling design: wire-visible
//! `TransportError`s (surfaced to the peer as CONNECTION_CLOSE) and local
//! programmer `ConnectionError::Misuse` errors that never touch the wire.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// QUIC transport error codes (RFC 9000 Section 20).
///
/// Values 0x00-0x10 are standard QUIC transport errors. `Crypto(alert)`
/// represents the 0x100-0x1ff range, `0x100 | tls_alert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    Crypto(u8),
}

impl TransportError {
    pub fn from_u64(code: u64) -> Self {
        if (0x100..0x200).contains(&code) {
            return TransportError::Crypto((code & 0xff) as u8);
        }
        match code {
            0x00 => TransportError::NoError,
            0x01 => TransportError::InternalError,
            0x02 => TransportError::ConnectionRefused,
            0x03 => TransportError::FlowControlError,
            0x04 => TransportError::StreamLimitError,
            0x05 => TransportError::StreamStateError,
            0x06 => TransportError::FinalSizeError,
            0x07 => TransportError::FrameEncodingError,
            0x08 => TransportError::TransportParameterError,
            0x09 => TransportError::ConnectionIdLimitError,
            0x0a => TransportError::ProtocolViolation,
            0x0b => TransportError::InvalidToken,
            0x0c => TransportError::ApplicationError,
            0x0d => TransportError::CryptoBufferExceeded,
            0x0e => TransportError::KeyUpdateError,
            0x0f => TransportError::AeadLimitReached,
            0x10 => TransportError::NoViablePath,
            _ => TransportError::InternalError,
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            TransportError::NoError => 0x00,
            TransportError::InternalError => 0x01,
            TransportError::ConnectionRefused => 0x02,
            TransportError::FlowControlError => 0x03,
            TransportError::StreamLimitError => 0x04,
            TransportError::StreamStateError => 0x05,
            TransportError::FinalSizeError => 0x06,
            TransportError::FrameEncodingError => 0x07,
            TransportError::TransportParameterError => 0x08,
            TransportError::ConnectionIdLimitError => 0x09,
            TransportError::ProtocolViolation => 0x0a,
            TransportError::InvalidToken => 0x0b,
            TransportError::ApplicationError => 0x0c,
            TransportError::CryptoBufferExceeded => 0x0d,
            TransportError::KeyUpdateError => 0x0e,
            TransportError::AeadLimitReached => 0x0f,
            TransportError::NoViablePath => 0x10,
            TransportError::Crypto(alert) => 0x100 | alert as u64,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoError => write!(f, "no error"),
            TransportError::InternalError => write!(f, "internal error"),
            TransportError::ConnectionRefused => write!(f, "connection refused"),
            TransportError::FlowControlError => write!(f, "flow control error"),
            TransportError::StreamLimitError => write!(f, "stream limit error"),
            TransportError::StreamStateError => write!(f, "stream state error"),
            TransportError::FinalSizeError => write!(f, "final size error"),
            TransportError::FrameEncodingError => write!(f, "frame encoding error"),
            TransportError::TransportParameterError => write!(f, "transport parameter error"),
            TransportError::ConnectionIdLimitError => write!(f, "connection id limit error"),
            TransportError::ProtocolViolation => write!(f, "protocol violation"),
            TransportError::InvalidToken => write!(f, "invalid token"),
            TransportError::ApplicationError => write!(f, "application error"),
            TransportError::CryptoBufferExceeded => write!(f, "crypto buffer exceeded"),
            TransportError::KeyUpdateError => write!(f, "key update error"),
            TransportError::AeadLimitReached => write!(f, "aead limit reached"),
            TransportError::NoViablePath => write!(f, "no viable path"),
            TransportError::Crypto(alert) => write!(f, "crypto error (tls alert {alert})"),
        }
    }
}

/// A QUIC frame type, carried alongside a `TransportError` so CONNECTION_CLOSE
/// can report the frame that triggered it.
pub type FrameType = u64;

/// A transport-level error: the code sent in CONNECTION_CLOSE, the
/// (optional) offending frame type, and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportErrorDetail {
    pub code: TransportError,
    pub frame_type: Option<FrameType>,
    pub reason: String,
}

impl TransportErrorDetail {
    pub fn new(code: TransportError, frame_type: Option<FrameType>, reason: impl Into<String>) -> Self {
        Self {
            code,
            frame_type,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransportErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    Read,
    Write,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Read => write!(f, "buffer read past end"),
            BufferError::Write => write!(f, "buffer write past capacity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    HeaderProtection,
    Encryption,
    Decryption,
    KeyDerivation,
    UnknownCipherSuite,
    KeyExchange,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::HeaderProtection => write!(f, "header protection failed"),
            CryptoError::Encryption => write!(f, "payload encryption failed"),
            CryptoError::Decryption => write!(f, "payload decryption failed"),
            CryptoError::KeyDerivation => write!(f, "key derivation failed"),
            CryptoError::UnknownCipherSuite => write!(f, "unknown cipher suite"),
            CryptoError::KeyExchange => write!(f, "key exchange failed"),
        }
    }
}

/// Local programmer misuse: invalid stream direction/ownership on send,
/// double close, sending on a closed connection. These never affect wire
/// state; they fail synchronously with a descriptive return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Misuse {
    StreamSendOnly,
    StreamReceiveOnly,
    WrongStreamInitiator,
    ConnectionClosed,
    AlreadyClosing,
    UnknownStream,
    NoSpareConnectionId,
    HandshakeNotConfirmed,
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Misuse::StreamSendOnly => write!(f, "Stream is send-only"),
            Misuse::StreamReceiveOnly => write!(f, "Stream is receive-only"),
            Misuse::WrongStreamInitiator => write!(f, "Wrong stream initiator"),
            Misuse::ConnectionClosed => write!(f, "connection is closed"),
            Misuse::AlreadyClosing => write!(f, "connection is already closing"),
            Misuse::UnknownStream => write!(f, "unknown stream id"),
            Misuse::NoSpareConnectionId => write!(f, "no spare connection id issued by peer"),
            Misuse::HandshakeNotConfirmed => write!(f, "handshake not yet confirmed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Buffer(BufferError),
    Crypto(CryptoError),
    Transport(TransportErrorDetail),
    Misuse(Misuse),
    /// A malformed encoding that does not (yet) carry enough context to
    /// name the offending frame type; callers typically upgrade this to
    /// `Transport(FrameEncodingError)` at the frame-dispatch boundary.
    Malformed(&'static str),
}

impl From<BufferError> for Error {
    fn from(e: BufferError) -> Self {
        Error::Buffer(e)
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<TransportErrorDetail> for Error {
    fn from(e: TransportErrorDetail) -> Self {
        Error::Transport(e)
    }
}

impl From<Misuse> for Error {
    fn from(e: Misuse) -> Self {
        Error::Misuse(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Buffer(e) => write!(f, "{e}"),
            Error::Crypto(e) => write!(f, "{e}"),
            Error::Transport(e) => write!(f, "{e}"),
            Error::Misuse(e) => write!(f, "{e}"),
            Error::Malformed(reason) => write!(f, "malformed encoding: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_range_round_trips() {
        for alert in [0u8, 10, 255] {
            let code = TransportError::Crypto(alert);
            let wire = code.as_u64();
            assert_eq!(wire, 0x100 | alert as u64);
            assert_eq!(TransportError::from_u64(wire), code);
        }
    }

    #[test]
    fn standard_codes_round_trip() {
        for code in [
            TransportError::NoError,
            TransportError::FlowControlError,
            TransportError::ProtocolViolation,
            TransportError::NoViablePath,
        ] {
            assert_eq!(TransportError::from_u64(code.as_u64()), code);
        }
    }
}
