//! Error types for the scheduler, ports, and streams.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - A failure in one source never aborts the scheduler loop; only
//!   unrecoverable multiplexing failures propagate out of `run*`
//! - Programming misuse (double invalidate, removing an unregistered
//!   watcher) is a no-op, not an error

use core::fmt;
use std::borrow::Cow;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Ports ===
    /// Operation on a port that has been invalidated.
    InvalidPort,
    /// No port registered under the requested name or address.
    PortLookup,
    /// A port name or address is already registered.
    NameTaken,
    /// Send or reply aimed at a connection handle that no longer exists.
    UnknownHandle,
    /// The peer closed the connection before the operation completed.
    ConnectionClosed,

    // === Framing ===
    /// An incoming or outgoing frame exceeds the configured maximum.
    FrameTooLarge,

    // === Streams ===
    /// Read or write on a stream in a terminal state (closed or errored).
    StreamClosed,
    /// Operation not valid for the stream's current status.
    StreamState,

    // === Scheduler ===
    /// The OS multiplexing primitive failed unrecoverably.
    Multiplex,

    // === I/O ===
    /// Underlying I/O failure not covered by a more specific kind.
    Io,
}

impl ErrorKind {
    /// Returns a static description of this error kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPort => "port has been invalidated",
            Self::PortLookup => "no port registered under that name",
            Self::NameTaken => "port name already registered",
            Self::UnknownHandle => "no such connection handle",
            Self::ConnectionClosed => "connection closed by peer",
            Self::FrameTooLarge => "frame exceeds maximum length",
            Self::StreamClosed => "stream is closed",
            Self::StreamState => "operation invalid for stream status",
            Self::Multiplex => "multiplexed wait failed",
            Self::Io => "I/O error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from the scheduler, a port, or a stream.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<Cow<'static, str>>,
    source: Option<io::Error>,
}

impl Error {
    /// Creates an error of the given kind with no extra context.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            source: None,
        }
    }

    /// Creates an error of the given kind with a human-readable detail.
    #[must_use]
    pub fn with_detail(kind: ErrorKind, detail: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
            source: None,
        }
    }

    /// Wraps an I/O error under the given kind.
    #[must_use]
    pub fn io(kind: ErrorKind, source: io::Error) -> Self {
        Self {
            kind,
            detail: None,
            source: Some(source),
        }
    }

    /// Operation on an invalidated port.
    #[must_use]
    pub const fn invalid_port() -> Self {
        Self::new(ErrorKind::InvalidPort)
    }

    /// A frame was larger than the configured maximum.
    #[must_use]
    pub fn frame_too_large(len: usize, max: usize) -> Self {
        Self::with_detail(
            ErrorKind::FrameTooLarge,
            format!("frame of {len} bytes exceeds maximum of {max}"),
        )
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the wrapped I/O error, if any.
    #[must_use]
    pub fn io_source(&self) -> Option<&io::Error> {
        self.source.as_ref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detail, &self.source) {
            (Some(detail), _) => write!(f, "{}: {detail}", self.kind),
            (None, Some(source)) => write!(f, "{}: {source}", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::io(ErrorKind::Io, err)
    }
}
