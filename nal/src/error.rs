//! Error taxonomy shared by the abstraction layer and its plugins.

use std::fmt;
use std::io;

/// Error kinds surfaced by the abstraction layer.
///
/// Synchronous failures are returned directly; fatal errors of an accepted
/// operation surface through its completion callback.
#[derive(Debug)]
pub enum Error {
    /// Waited the full deadline without progress or an available completion.
    Timeout,
    /// Resource temporarily unavailable (e.g. copy slots exhausted with
    /// retries disabled).
    Again,
    /// Caller-supplied argument is null, empty, or out of range.
    InvalidArg,
    /// Allocation failed.
    NoMem,
    /// Output buffer too small.
    Overflow,
    /// Transferred byte count did not equal the requested length.
    MsgSize,
    /// No plugin matches the requested protocol or class.
    ProtocolNotSupported,
    /// Plugin does not implement the requested entry point.
    OpNotSupported,
    /// Op id or queue is not in a reusable state.
    Busy,
    /// Operation was canceled before completion.
    Canceled,
    /// Attempt violated memory-handle access flags.
    Permission,
    /// Invariant violation detected at the boundary.
    Fault,
    /// OS or transport failure.
    Protocol(io::Error),
}

impl Error {
    /// OS failure with a static description, for syscalls that do not go
    /// through `io::Error`.
    pub fn protocol(msg: &'static str) -> Self {
        Error::Protocol(io::Error::new(io::ErrorKind::Other, msg))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Again => write!(f, "Resource temporarily unavailable"),
            Error::InvalidArg => write!(f, "Invalid argument"),
            Error::NoMem => write!(f, "Out of memory"),
            Error::Overflow => write!(f, "Output buffer too small"),
            Error::MsgSize => write!(f, "Short transfer"),
            Error::ProtocolNotSupported => write!(f, "Protocol not supported"),
            Error::OpNotSupported => write!(f, "Operation not supported"),
            Error::Busy => write!(f, "Resource busy"),
            Error::Canceled => write!(f, "Operation canceled"),
            Error::Permission => write!(f, "Permission denied by access flags"),
            Error::Fault => write!(f, "Invariant violation"),
            Error::Protocol(e) => write!(f, "Transport failure: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Protocol(e)
    }
}

/// Result type used throughout the abstraction layer.
pub type Result<T> = std::result::Result<T, Error>;
