//! Destination Selection
//!
//! Responsibilities:
//! - Produce the ordered candidate list for one transaction
//! - Deliver candidates as they become known (the list may keep growing
//!   while the relay is already connecting)
//! - Signal exactly once that selection is finished
//!
//! Selectors never open connections; they only say where to go.

mod configured;
mod fixed;

pub use configured::ConfiguredSelector;
pub use fixed::StaticSelector;

use tokio::sync::mpsc;
use tracing::trace;

use crate::common::{Candidate, Destination, Transaction};
use crate::error::Error;

/// Event delivered from a selector to the relay
#[derive(Debug)]
pub enum SelectorEvent {
    /// One more candidate is available
    Candidate(Candidate),
    /// No more candidates will follow
    End(Option<Error>),
}

/// Destination selector trait
///
/// `begin` must return promptly; slow work (DNS) belongs in a spawned task
/// that keeps the sink.
pub trait DestinationSelector: Send + Sync {
    fn begin(&self, transaction: &Transaction, sink: DestinationSink);
}

/// Channel through which a selector reports candidates
///
/// Dropping the sink without calling `note_destinations_end` ends selection
/// without an error. Sends after the relay stopped listening are ignored.
pub struct DestinationSink {
    tx: mpsc::UnboundedSender<SelectorEvent>,
    ended: bool,
}

impl DestinationSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SelectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, ended: false }, rx)
    }

    pub fn note_destination(&self, destination: Destination) {
        self.send(SelectorEvent::Candidate(Candidate::Path(destination)));
    }

    /// Tell the relay to use the connection pinned to this client
    pub fn note_pinned(&self) {
        self.send(SelectorEvent::Candidate(Candidate::Pinned));
    }

    pub fn note_destinations_end(mut self, error: Option<Error>) {
        self.ended = true;
        self.send(SelectorEvent::End(error));
    }

    /// Whether the relay still listens
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: SelectorEvent) {
        if self.tx.send(event).is_err() {
            trace!("Selector event dropped, relay no longer listening");
        }
    }
}

impl Drop for DestinationSink {
    fn drop(&mut self) {
        if !self.ended {
            self.send(SelectorEvent::End(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    #[test]
    fn test_drop_sends_end() {
        let (sink, mut rx) = DestinationSink::channel();
        sink.note_destination(Destination::origin(Address::domain("a", 1)));
        drop(sink);

        assert!(matches!(rx.try_recv(), Ok(SelectorEvent::Candidate(Candidate::Path(_)))));
        assert!(matches!(rx.try_recv(), Ok(SelectorEvent::End(None))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_explicit_end_sent_once() {
        let (sink, mut rx) = DestinationSink::channel();
        sink.note_destinations_end(Some(Error::Resolve("nxdomain".into())));

        assert!(matches!(rx.try_recv(), Ok(SelectorEvent::End(Some(Error::Resolve(_))))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_gone_is_ignored() {
        let (sink, rx) = DestinationSink::channel();
        drop(rx);
        assert!(sink.is_closed());
        sink.note_pinned();
    }
}
