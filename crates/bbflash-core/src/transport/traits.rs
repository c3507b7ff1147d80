//! Byte-channel abstraction.
//!
//! Defines the `Channel` trait every transport device talks through,
//! allowing different implementations (serial tty, mock, etc.).

use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device hung up")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        }
    }

    pub(crate) fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Abstract byte channel to a modem port.
///
/// Every call carries its own deadline; implementations must never block
/// past it and must never report a timeout before it.
pub trait Channel: Send + Sync {
    /// Write all of `data`, waiting at most `timeout` for the port to drain.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read whatever is available (at most `max_len` bytes), waiting at most
    /// `timeout` for the first byte.
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Human-readable name of the underlying port.
    fn name(&self) -> &str;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).write(data, timeout)
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len, timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
