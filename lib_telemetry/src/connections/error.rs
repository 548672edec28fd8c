use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// A Modbus exception code returned by the device in place of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionCode(pub u8);

impl ExceptionCode {
    /// The standard name of the exception, when it has one.
    pub fn name(self) -> &'static str {
        match self.0 {
            0x01 => "illegal function",
            0x02 => "illegal data address",
            0x03 => "illegal data value",
            0x04 => "server device failure",
            0x05 => "acknowledge",
            0x06 => "server device busy",
            0x08 => "memory parity error",
            0x0A => "gateway path unavailable",
            0x0B => "gateway target device failed to respond",
            _ => "unknown exception",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", self.0, self.name())
    }
}

/// Failures raised by a `DeviceClient`.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("could not connect to device at {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("device did not answer within {0:?}")]
    Timeout(Duration),

    #[error("device returned exception {0}")]
    Exception(ExceptionCode),

    #[error("malformed response from device: {0}")]
    Malformed(String),

    #[error("connection to device lost: {0}")]
    ConnectionLost(#[source] io::Error),

    #[error("device client is not connected")]
    NotConnected,
}

/// Coarse classification of a `DeviceError`, used for log de-duplication
/// and reconnect decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    Connection,
    Timeout,
    Protocol,
    ConnectionLost,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceErrorKind::Connection => "connection",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::Protocol => "protocol",
            DeviceErrorKind::ConnectionLost => "connection_lost",
        };
        f.write_str(s)
    }
}

impl DeviceError {
    pub fn kind(&self) -> DeviceErrorKind {
        match self {
            DeviceError::Connection { .. } => DeviceErrorKind::Connection,
            DeviceError::Timeout(_) => DeviceErrorKind::Timeout,
            DeviceError::Exception(_) | DeviceError::Malformed(_) => DeviceErrorKind::Protocol,
            DeviceError::ConnectionLost(_) | DeviceError::NotConnected => {
                DeviceErrorKind::ConnectionLost
            }
        }
    }

    /// Whether the connection must be re-established before the next read.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            DeviceError::ConnectionLost(_) | DeviceError::NotConnected
        )
    }

    pub(crate) fn lost(kind: io::ErrorKind, msg: impl Into<String>) -> Self {
        DeviceError::ConnectionLost(io::Error::new(kind, msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_display_names_the_code() {
        let err = DeviceError::Exception(ExceptionCode(0x02));
        assert_eq!(
            err.to_string(),
            "device returned exception 0x02 (illegal data address)"
        );
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(DeviceError::Timeout(Duration::from_millis(5)).kind(), DeviceErrorKind::Timeout);
        assert_eq!(DeviceError::Malformed("x".into()).kind(), DeviceErrorKind::Protocol);
        assert_eq!(DeviceError::NotConnected.kind(), DeviceErrorKind::ConnectionLost);
        assert!(DeviceError::lost(io::ErrorKind::BrokenPipe, "gone").requires_reconnect());
        assert!(!DeviceError::Exception(ExceptionCode(4)).requires_reconnect());
    }
}
