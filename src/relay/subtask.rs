//! The single setup stage a relay may have in flight

use futures_util::future::BoxFuture;
use tracing::trace;

use crate::common::{Destination, Result, Stream};
use crate::protocol::Handshaken;
use crate::transport::OpenOutcome;

/// At most one of transport open, encryption or peer handshake.
///
/// Starting a stage replaces `Idle`; dropping the future cancels it.
pub(crate) enum PendingSubtask {
    Idle,
    Opening(BoxFuture<'static, OpenOutcome>),
    Encrypting {
        destination: Destination,
        reused: bool,
        future: BoxFuture<'static, Result<Stream>>,
    },
    Handshaking {
        destination: Destination,
        reused: bool,
        future: BoxFuture<'static, Result<Handshaken>>,
    },
}

/// A finished setup stage
pub(crate) enum SubtaskOutcome {
    Opened(OpenOutcome),
    Secured {
        destination: Destination,
        reused: bool,
        result: Result<Stream>,
    },
    Handshaken {
        destination: Destination,
        reused: bool,
        result: Result<Handshaken>,
    },
}

impl PendingSubtask {
    pub fn is_idle(&self) -> bool {
        matches!(self, PendingSubtask::Idle)
    }

    pub fn stage(&self) -> &'static str {
        match self {
            PendingSubtask::Idle => "idle",
            PendingSubtask::Opening(_) => "opening",
            PendingSubtask::Encrypting { .. } => "encrypting",
            PendingSubtask::Handshaking { .. } => "handshaking",
        }
    }

    /// Drop whatever is in flight
    pub fn cancel(&mut self) {
        if !self.is_idle() {
            trace!("Cancelling subtask while {}", self.stage());
        }
        *self = PendingSubtask::Idle;
    }

    /// Wait for the stage in flight; never resolves while idle.
    ///
    /// Cancel safe: the stage stays in place if this future is dropped.
    pub async fn wait(&mut self) -> SubtaskOutcome {
        let outcome = match self {
            PendingSubtask::Idle => return std::future::pending().await,
            PendingSubtask::Opening(future) => SubtaskOutcome::Opened(future.await),
            PendingSubtask::Encrypting {
                destination,
                reused,
                future,
            } => {
                let result = future.await;
                SubtaskOutcome::Secured {
                    destination: destination.clone(),
                    reused: *reused,
                    result,
                }
            }
            PendingSubtask::Handshaking {
                destination,
                reused,
                future,
            } => {
                let result = future.await;
                SubtaskOutcome::Handshaken {
                    destination: destination.clone(),
                    reused: *reused,
                    result,
                }
            }
        };
        *self = PendingSubtask::Idle;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::error::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_never_resolves() {
        let mut subtask = PendingSubtask::Idle;
        let waited = tokio::time::timeout(Duration::from_millis(20), subtask.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_to_idle() {
        let mut subtask = PendingSubtask::Opening(Box::pin(async {
            OpenOutcome::failed(1, Error::Timeout)
        }));
        assert_eq!(subtask.stage(), "opening");

        match subtask.wait().await {
            SubtaskOutcome::Opened(outcome) => assert_eq!(outcome.attempts_used, 1),
            _ => panic!("unexpected outcome"),
        }
        assert!(subtask.is_idle());
    }

    #[tokio::test]
    async fn test_dropped_wait_keeps_stage() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut subtask = PendingSubtask::Encrypting {
            destination: Destination::origin(Address::domain("example.com", 443)),
            reused: false,
            future: Box::pin(async move {
                let _ = rx.await;
                Err::<Stream, _>(Error::Tls("late".into()))
            }),
        };

        let first = tokio::time::timeout(Duration::from_millis(10), subtask.wait()).await;
        assert!(first.is_err());
        assert_eq!(subtask.stage(), "encrypting");

        tx.send(()).unwrap();
        assert!(matches!(
            subtask.wait().await,
            SubtaskOutcome::Secured { result: Err(Error::Tls(_)), .. }
        ));
    }
}
