//! Proxy Protocol Layer
//!
//! Responsibilities:
//! - Upstream CONNECT handshake with relaying peers
//! - Reading the client's CONNECT head (runtime only)
//! - The fixed reply lines the relay owes a CONNECT client
//!
//! The relay itself moves opaque bytes; this is the only place HTTP text
//! is produced or parsed.

mod http;

pub use http::{
    bad_request, connection_established, error_response, method_not_allowed,
    read_connect_request, ConnectRequest, HttpConnectHandshake, MAX_HEAD_SIZE,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::{Address, Destination, Result, Stream};

/// A peer connection after a successful upstream CONNECT
pub struct Handshaken {
    pub stream: Stream,
    /// Bytes the peer sent past the end of its response head
    pub leftover: Bytes,
    /// Status code of the peer's response
    pub status: u16,
}

/// Peer-handshake negotiator
///
/// Asks the relaying peer at `destination` to open a tunnel to `target`.
/// A refusal comes back as `Error::PeerRefused` carrying the status code.
#[async_trait]
pub trait PeerHandshake: Send + Sync {
    async fn handshake(
        &self,
        stream: Stream,
        destination: &Destination,
        target: &Address,
    ) -> Result<Handshaken>;
}
