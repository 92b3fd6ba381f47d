//! Transport Layer
//!
//! Responsibilities:
//! - Open raw connections toward candidate destinations
//! - Hand out connections already pinned to a client
//! - NO encryption, NO protocol parsing, NO content inspection
//!
//! This layer ONLY deals with raw byte transport.

mod pinned;
mod tcp;

pub use pinned::{PinnedConnection, PinnedPool, PinnedProvider};
pub use tcp::TcpOpener;

use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Destination, Result, Stream};

/// A transport connection that is open and ready for the next setup stage
pub struct Opened {
    pub stream: Stream,
    /// The candidate that answered
    pub destination: Destination,
    /// Whether an idle persistent connection was reused
    pub reused: bool,
}

/// Result of one `open` call
pub struct OpenOutcome {
    /// How many candidates were tried, successful or not
    pub attempts_used: usize,
    pub result: Result<Opened>,
}

impl OpenOutcome {
    pub fn failed(attempts_used: usize, error: crate::error::Error) -> Self {
        Self {
            attempts_used,
            result: Err(error),
        }
    }
}

/// Opener for raw transport connections
///
/// Implementations try the given candidates in order and report how many
/// they used. Dropping the returned future cancels the attempt.
#[async_trait]
pub trait TransportOpener: Send + Sync {
    async fn open(&self, candidates: &[Destination], timeout: Duration) -> OpenOutcome;
}
