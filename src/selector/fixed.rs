//! Static selector - always yields the same candidates

use crate::common::{Candidate, Transaction};

use super::{DestinationSelector, DestinationSink};

/// Selector that yields a fixed candidate list, then ends
pub struct StaticSelector {
    candidates: Vec<Candidate>,
}

impl StaticSelector {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }
}

impl DestinationSelector for StaticSelector {
    fn begin(&self, _transaction: &Transaction, sink: DestinationSink) {
        for candidate in &self.candidates {
            match candidate {
                Candidate::Path(destination) => sink.note_destination(destination.clone()),
                Candidate::Pinned => sink.note_pinned(),
            }
        }
        sink.note_destinations_end(None);
    }
}
