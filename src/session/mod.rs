//! Session Layer
//!
//! Responsibilities:
//! - TLS negotiation on an already opened transport
//!
//! This layer transforms raw transport streams into secure streams.
//! It does NOT parse proxy protocols or make routing decisions.

mod tls;

pub use tls::TlsEncryptor;

use async_trait::async_trait;

use crate::common::{Destination, Result, Stream};

/// Encryption negotiator
///
/// Wraps an opened connection toward `destination` and returns the secured
/// stream. Dropping the returned future abandons the handshake.
#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn secure(&self, stream: Stream, destination: &Destination) -> Result<Stream>;
}
