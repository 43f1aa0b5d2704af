//! Error types for rdmavan.

use std::io;

/// Transport errors.
#[derive(Debug)]
pub enum Error {
    /// IO error from the verbs or rdma_cm layer.
    Io(io::Error),
    /// No endpoint exists for the given node id.
    EndpointNotFound(i32),
    /// The endpoint exists but is not connected.
    NotConnected(i32),
    /// The peer hostname could not be resolved to an address.
    AddrResolve(String),
    /// A packed metadata record could not be decoded.
    InvalidMeta(&'static str),
    /// The receive queue was closed during shutdown.
    Stopped,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::EndpointNotFound(id) => write!(f, "no endpoint for node {}", id),
            Error::NotConnected(id) => write!(f, "endpoint for node {} is not connected", id),
            Error::AddrResolve(host) => write!(f, "cannot resolve address of {}", host),
            Error::InvalidMeta(what) => write!(f, "invalid packed meta: {}", what),
            Error::Stopped => write!(f, "transport is stopped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for rdmavan operations.
pub type Result<T> = std::result::Result<T, Error>;
