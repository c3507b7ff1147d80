//! Crate-wide error type.
//!
//! Every failure carries an [`ErrorKind`] so callers can drive retry and
//! fallback policy without matching on message strings: `UnsupportedFeature`
//! triggers protocol fallback, `Cancelled` aborts the whole run, everything
//! else aborts the current step.

use std::fmt;

use thiserror::Error;

use crate::protocol::hdlc::HdlcError;
use crate::transport::TransportError;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Timeout,
    Cancelled,
    ChecksumMismatch,
    ProtocolViolation,
    UnsupportedFeature,
    VersionMismatch,
    DeviceNotFound,
    AmbiguousDevice,
    InvalidImage,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Io => "I/O",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ChecksumMismatch => "checksum mismatch",
            ErrorKind::ProtocolViolation => "protocol violation",
            ErrorKind::UnsupportedFeature => "unsupported feature",
            ErrorKind::VersionMismatch => "version mismatch",
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::AmbiguousDevice => "ambiguous device",
            ErrorKind::InvalidImage => "invalid image",
            ErrorKind::Config => "configuration",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("bad frame: {0}")]
    Framing(HdlcError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    #[error("no device found: {0}")]
    DeviceNotFound(String),

    #[error("ambiguous device selection: {0}")]
    AmbiguousDevice(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<HdlcError> for Error {
    fn from(e: HdlcError) -> Self {
        match e {
            HdlcError::ChecksumMismatch { expected, actual } => {
                Error::ChecksumMismatch { expected, actual }
            }
            other => Error::Framing(other),
        }
    }
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Error::InvalidImage(msg.into())
    }

    /// Wrap with a step/operation prefix, preserving the kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Transport(e) => e.kind(),
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            // Any frame integrity failure is a checksum failure to callers.
            Error::Framing(_) => ErrorKind::ChecksumMismatch,
            Error::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Error::Unsupported(_) => ErrorKind::UnsupportedFeature,
            Error::VersionMismatch(_) => ErrorKind::VersionMismatch,
            Error::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Error::AmbiguousDevice(_) => ErrorKind::AmbiguousDevice,
            Error::InvalidImage(_) => ErrorKind::InvalidImage,
            Error::Config(_) => ErrorKind::Config,
            Error::Context { source, .. } => source.kind(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind() == ErrorKind::UnsupportedFeature
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// `.context()` on results, mirroring the error-prefix convention of the CLI.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}
