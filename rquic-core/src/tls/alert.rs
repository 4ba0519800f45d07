//! TLS 1.3 alerts
//!
//! Alert descriptions map onto the crypto error range of the transport
//! error taxonomy as `0x100 | description` (spec.md Section 7).

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    RecordOverflow = 22,
    HandshakeFailure = 40,
    BadCertificate = 42,
    UnsupportedCertificate = 43,
    CertificateRevoked = 44,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    MissingExtension = 109,
    UnsupportedExtension = 110,
    UnknownPskIdentity = 115,
    CertificateRequired = 116,
    NoApplicationProtocol = 120,
}

impl AlertDescription {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::CloseNotify,
            10 => Self::UnexpectedMessage,
            20 => Self::BadRecordMac,
            22 => Self::RecordOverflow,
            40 => Self::HandshakeFailure,
            42 => Self::BadCertificate,
            43 => Self::UnsupportedCertificate,
            44 => Self::CertificateRevoked,
            45 => Self::CertificateExpired,
            46 => Self::CertificateUnknown,
            47 => Self::IllegalParameter,
            48 => Self::UnknownCa,
            49 => Self::AccessDenied,
            50 => Self::DecodeError,
            51 => Self::DecryptError,
            70 => Self::ProtocolVersion,
            71 => Self::InsufficientSecurity,
            80 => Self::InternalError,
            109 => Self::MissingExtension,
            110 => Self::UnsupportedExtension,
            115 => Self::UnknownPskIdentity,
            116 => Self::CertificateRequired,
            120 => Self::NoApplicationProtocol,
            _ => return None,
        })
    }

    /// The transport CRYPTO_ERROR wire value, `0x100 | description`.
    pub fn crypto_error_code(self) -> u64 {
        0x100 | self as u64
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CloseNotify => "close notify",
            Self::UnexpectedMessage => "unexpected message",
            Self::BadRecordMac => "bad record mac",
            Self::RecordOverflow => "record overflow",
            Self::HandshakeFailure => "handshake failure",
            Self::BadCertificate => "bad certificate",
            Self::UnsupportedCertificate => "unsupported certificate",
            Self::CertificateRevoked => "certificate revoked",
            Self::CertificateExpired => "certificate expired",
            Self::CertificateUnknown => "certificate unknown",
            Self::IllegalParameter => "illegal parameter",
            Self::UnknownCa => "unknown CA",
            Self::AccessDenied => "access denied",
            Self::DecodeError => "decode error",
            Self::DecryptError => "decrypt error",
            Self::ProtocolVersion => "No supported protocol version",
            Self::InsufficientSecurity => "insufficient security",
            Self::InternalError => "internal error",
            Self::MissingExtension => "missing extension",
            Self::UnsupportedExtension => "unsupported extension",
            Self::UnknownPskIdentity => "unknown PSK identity",
            Self::CertificateRequired => "certificate required",
            Self::NoApplicationProtocol => "no application protocol",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn fatal(description: AlertDescription) -> Self {
        Self {
            level: AlertLevel::Fatal,
            description,
        }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.level as u8, self.description as u8]
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let level = match data[0] {
            1 => AlertLevel::Warning,
            2 => AlertLevel::Fatal,
            _ => return None,
        };
        Some(Self {
            level,
            description: AlertDescription::from_u8(data[1])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_maps_to_spec_alert_326() {
        assert_eq!(AlertDescription::ProtocolVersion.crypto_error_code(), 326);
    }

    #[test]
    fn alert_round_trips_bytes() {
        let a = Alert::fatal(AlertDescription::HandshakeFailure);
        let bytes = a.to_bytes();
        let back = Alert::from_bytes(&bytes).unwrap();
        assert_eq!(back.description, AlertDescription::HandshakeFailure);
    }
}
