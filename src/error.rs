//! Error types for the tunnel relay

use thiserror::Error;

/// Main error type for the tunnel relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DNS resolution failed: {0}")]
    Resolve(String),

    /// The next-hop peer answered the CONNECT with a non-2xx status
    #[error("Peer refused CONNECT: {status} {reason}")]
    PeerRefused { status: u16, reason: String },

    /// Destination selection finished without producing a single candidate
    #[error("No forwarding paths available")]
    NoPaths,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Shutting down")]
    Shutdown,
}

impl Error {
    /// Status code of the error reply sent to a client that still expects one.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Timeout => 504,
            Error::PeerRefused { .. } | Error::Protocol(_) | Error::Tls(_) => 502,
            _ => 503,
        }
    }

    /// Upstream status code carried by this error, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Error::PeerRefused { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Result type alias for the tunnel relay
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::NoPaths.http_status(), 503);
        assert_eq!(Error::Timeout.http_status(), 504);
        let refused = Error::PeerRefused {
            status: 403,
            reason: "Forbidden".into(),
        };
        assert_eq!(refused.http_status(), 502);
        assert_eq!(refused.upstream_status(), Some(403));
        assert_eq!(Error::ConnectionClosed.upstream_status(), None);
    }
}
