//! Destination cursor - the relay's view of the selector's output

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::common::{Candidate, Transaction};
use crate::error::Error;
use crate::selector::{DestinationSelector, DestinationSink, SelectorEvent};

/// Candidates noted so far plus whether more may follow
pub(crate) struct DestinationCursor {
    events: Option<mpsc::UnboundedReceiver<SelectorEvent>>,
    queue: VecDeque<Candidate>,
    finished: bool,
    selection_error: Option<Error>,
    /// Candidates ever noted, including those already tried
    noted: usize,
}

impl DestinationCursor {
    /// Start selection for `transaction`
    pub fn subscribe(selector: &dyn DestinationSelector, transaction: &Transaction) -> Self {
        let (sink, events) = DestinationSink::channel();
        selector.begin(transaction, sink);
        Self {
            events: Some(events),
            queue: VecDeque::new(),
            finished: false,
            selection_error: None,
            noted: 0,
        }
    }

    /// A cursor with nothing to offer, for relays that already have a server
    pub fn detached() -> Self {
        Self {
            events: None,
            queue: VecDeque::new(),
            finished: true,
            selection_error: None,
            noted: 0,
        }
    }

    /// Next selector event; never resolves once unsubscribed or finished.
    ///
    /// Cancel safe.
    pub async fn next_event(&mut self) -> SelectorEvent {
        match self.events.as_mut() {
            Some(events) => events.recv().await.unwrap_or(SelectorEvent::End(None)),
            None => std::future::pending().await,
        }
    }

    pub fn note(&mut self, event: SelectorEvent) {
        match event {
            SelectorEvent::Candidate(candidate) => {
                self.noted += 1;
                self.queue.push_back(candidate);
            }
            SelectorEvent::End(error) => {
                self.finished = true;
                self.selection_error = error;
                self.events = None;
            }
        }
    }

    pub fn pop(&mut self) -> Option<Candidate> {
        self.queue.pop_front()
    }

    /// Selection ended; nothing beyond the queue will arrive
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn noted(&self) -> usize {
        self.noted
    }

    pub fn take_selection_error(&mut self) -> Option<Error> {
        self.selection_error.take()
    }

    /// Stop listening; later notifications are dropped by the sink
    pub fn unsubscribe(&mut self) {
        self.events = None;
        self.finished = true;
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Destination};
    use crate::selector::StaticSelector;

    fn tx() -> Transaction {
        Transaction::connect(
            Address::Socket("127.0.0.1:40000".parse().unwrap()),
            Address::domain("example.com", 443),
        )
    }

    #[tokio::test]
    async fn test_collects_until_end() {
        let d1 = Destination::origin(Address::domain("a.example", 443));
        let selector = StaticSelector::new(vec![Candidate::Path(d1.clone()), Candidate::Pinned]);
        let mut cursor = DestinationCursor::subscribe(&selector, &tx());

        while !cursor.is_finished() {
            let event = cursor.next_event().await;
            cursor.note(event);
        }

        assert_eq!(cursor.noted(), 2);
        assert_eq!(cursor.pop(), Some(Candidate::Path(d1)));
        assert_eq!(cursor.pop(), Some(Candidate::Pinned));
        assert_eq!(cursor.pop(), None);
        assert!(cursor.take_selection_error().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_queue() {
        let selector = StaticSelector::new(vec![Candidate::Pinned]);
        let mut cursor = DestinationCursor::subscribe(&selector, &tx());
        let event = cursor.next_event().await;
        cursor.note(event);

        cursor.unsubscribe();
        assert!(cursor.is_finished());
        assert_eq!(cursor.pop(), None);

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(10), cursor.next_event()).await;
        assert!(waited.is_err());
    }
}
