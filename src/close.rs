//! Close codes for the WebSocket closing handshake ([RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4)).
//!
//! A Close frame payload starts with an optional big-endian `u16` status
//! code followed by a UTF-8 reason. [`CloseCode`] maps the well-known codes
//! to named variants and keeps everything else as its raw value so inbound
//! codes survive a round trip unchanged.

/// Status code carried in a Close frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure, the purpose for which the connection was
    /// established has been fulfilled.
    Normal,
    /// 1001: endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: protocol error.
    Protocol,
    /// 1003: received a data type it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007: payload inconsistent with the message type (e.g. invalid UTF-8).
    Invalid,
    /// 1008: message violates endpoint policy.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: client expected the server to negotiate an extension.
    Extension,
    /// 1011: server encountered an unexpected condition.
    Error,
    /// 1012: server is restarting.
    Restart,
    /// 1013: try again later.
    Again,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// Any other code, including the 3000-3999 registered and 4000-4999
    /// private-use ranges.
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1015 => Self::Tls,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Other(other) => other,
        }
    }
}

impl CloseCode {
    /// Whether this code may be placed in an outbound Close frame.
    ///
    /// Rejected: anything below 1000, the reserved codes 1005/1006/1015,
    /// the unassigned 1016-2999 range, and everything from 5000 up. The
    /// 3000-4999 registered/private ranges are fair game.
    pub fn is_allowed(&self) -> bool {
        let code = u16::from(*self);
        match code {
            0..=999 => false,
            1005 | 1006 | 1015 => false,
            1016..=2999 => false,
            5000.. => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn test_allowed_codes() {
        assert!(CloseCode::Normal.is_allowed());
        assert!(CloseCode::Away.is_allowed());
        assert!(CloseCode::Error.is_allowed());
        assert!(CloseCode::from(3000).is_allowed());
        assert!(CloseCode::from(4999).is_allowed());
    }

    #[test]
    fn test_rejected_codes() {
        assert!(!CloseCode::Status.is_allowed());
        assert!(!CloseCode::Abnormal.is_allowed());
        assert!(!CloseCode::Tls.is_allowed());
        assert!(!CloseCode::from(999).is_allowed());
        assert!(!CloseCode::from(0).is_allowed());
        assert!(!CloseCode::from(1016).is_allowed());
        assert!(!CloseCode::from(2999).is_allowed());
        assert!(!CloseCode::from(5000).is_allowed());
        assert!(!CloseCode::from(u16::MAX).is_allowed());
    }
}
