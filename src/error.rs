/*
 * Copyright 2020 Joyent, Inc.
 */

use std::error::Error as StdError;
use std::fmt;

/// The error taxonomy for the connection core.
///
/// `CapacityExceeded` is the one retryable variant: it means the endpoint's
/// admission limit was reached and no connection was released within the
/// configured wait. Everything network-shaped (`ServerLost`, `NetworkError`,
/// `MalformedProtocol`) marks the connection it was observed on as unusable
/// so the registry never pools it again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    OutOfMemory,
    CapacityExceeded {
        endpoint: String,
        waited_ms: u64,
    },
    ServerLost(String),
    NetworkError(String),
    MalformedProtocol(String),
    CycleDetected(String),
    MonitoringFailure(String),
    Shutdown,
    Internal(String),
}

impl Error {
    /// True for errors a caller may reasonably retry after backing off.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::CapacityExceeded { .. } => true,
            _ => false,
        }
    }

    /// True for errors that poison the connection they were observed on.
    pub fn marks_unusable(&self) -> bool {
        match self {
            Error::ServerLost(_)
            | Error::NetworkError(_)
            | Error::MalformedProtocol(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(fmt, "out of memory"),
            Error::CapacityExceeded {
                endpoint,
                waited_ms,
            } => write!(
                fmt,
                "too many connections to endpoint {} (waited {} ms)",
                endpoint, waited_ms
            ),
            Error::ServerLost(msg) => {
                write!(fmt, "remote server lost: {}", msg)
            }
            Error::NetworkError(msg) => write!(fmt, "network error: {}", msg),
            Error::MalformedProtocol(msg) => {
                write!(fmt, "malformed protocol response: {}", msg)
            }
            Error::CycleDetected(dest) => {
                write!(fmt, "forwarding loop detected routing to {}", dest)
            }
            Error::MonitoringFailure(msg) => {
                write!(fmt, "monitoring failure: {}", msg)
            }
            Error::Shutdown => write!(fmt, "registry is shutting down"),
            Error::Internal(msg) => msg.fmt(fmt),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        None
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::NetworkError(error.to_string())
    }
}
