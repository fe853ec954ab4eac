//! Protocol errors

use thiserror::Error;

use crate::printer::PrinterMode;

/// Errors that can occur while talking to the printer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The physical link failed; the connection is discarded
    #[error("I/O error on printer link: {0}")]
    Io(String),

    #[error("Timed out waiting for printer response")]
    Timeout,

    /// The firmware explicitly rejected the command (reported verbatim)
    #[error("Printer rejected command: {0}")]
    DeviceError(String),

    #[error("Operation already in progress: {0}")]
    AlreadyInProgress(&'static str),

    #[error("No {0} in progress")]
    NotActive(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not connected to printer")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No matching printer found")]
    DeviceNotFound,

    #[error("Printer is in {actual} mode, operation requires {expected} mode")]
    WrongMode {
        expected: PrinterMode,
        actual: PrinterMode,
    },

    #[error("Not supported by this firmware: {0}")]
    Unsupported(&'static str),

    #[error("Invalid response from printer: {0}")]
    InvalidResponse(String),

    #[error("File error: {0}")]
    File(String),

    /// A caller-supplied value cannot be put on the wire
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl ProtocolError {
    /// Errors after which the connection must not be reused
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }

    /// Errors a caller may reasonably retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::Timeout)
    }
}

/// Errors raised by a [`Transport`](super::Transport) implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read timed out")]
    Timeout,

    #[error("link closed by device")]
    Closed,
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ProtocolError::Timeout,
            other => ProtocolError::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_io_is_fatal() {
        assert!(ProtocolError::Io("unplugged".into()).is_fatal());
        assert!(!ProtocolError::Timeout.is_fatal());
        assert!(!ProtocolError::DeviceError("Bad M-code 24".into()).is_fatal());
    }

    #[test]
    fn test_transport_error_conversion() {
        let timeout: ProtocolError = TransportError::Timeout.into();
        assert_eq!(timeout, ProtocolError::Timeout);
        assert!(timeout.is_retryable());

        let closed: ProtocolError = TransportError::Closed.into();
        assert!(closed.is_fatal());
    }

    #[test]
    fn test_wrong_mode_display() {
        let err = ProtocolError::WrongMode {
            expected: PrinterMode::Firmware,
            actual: PrinterMode::Bootloader,
        };
        assert_eq!(
            err.to_string(),
            "Printer is in Bootloader mode, operation requires Firmware mode"
        );
    }
}
