//! TCP transport opener

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use crate::common::{Address, Destination, IntoStream, Result, Stream};
use crate::error::Error;

use super::{OpenOutcome, Opened, TransportOpener};

/// TCP opener - raw TCP connections, one candidate per call
///
/// Only the head candidate is dialed; failover across candidates is left
/// to the caller's retry policy.
pub struct TcpOpener;

impl TcpOpener {
    pub fn new() -> Self {
        Self
    }

    async fn connect(addr: &Address) -> Result<Stream> {
        let stream = match addr {
            Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await?,
            Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await?,
        };

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        Ok(stream.into_stream())
    }
}

impl Default for TcpOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportOpener for TcpOpener {
    async fn open(&self, candidates: &[Destination], timeout: Duration) -> OpenOutcome {
        let Some(destination) = candidates.first() else {
            return OpenOutcome::failed(0, Error::Transport("No candidate to open".into()));
        };

        trace!("Opening TCP connection to {}", destination);
        let result = match tokio::time::timeout(timeout, Self::connect(&destination.address)).await {
            Ok(Ok(stream)) => Ok(Opened {
                stream,
                destination: destination.clone(),
                reused: false,
            }),
            Ok(Err(Error::Io(e))) => Err(Error::Transport(format!(
                "connect to {} failed: {}",
                destination.address, e
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        };

        OpenOutcome {
            attempts_used: 1,
            result,
        }
    }
}
