//! Bandwidth quota
//!
//! The byte shovel asks a delegate how many bytes it may read from a side
//! before each read and reports what it actually moved afterwards. A
//! delegate answering `1` is treated as starved; the shovel backs off
//! instead of spinning.

mod bucket;

pub use bucket::TokenBucketPolicy;

use std::sync::Arc;

use crate::common::{Side, Transaction};

/// Per-client flow-control delegate
pub trait QuotaDelegate: Send + Sync {
    /// Bytes that may be read from `side` right now (at least 1)
    fn quota(&self, side: Side) -> usize;

    /// Bytes just read from `side`
    fn consumed(&self, side: Side, bytes: usize);
}

/// Hands out the delegate for one transaction
pub trait QuotaPolicy: Send + Sync {
    fn delegate(&self, transaction: &Transaction) -> Arc<dyn QuotaDelegate>;
}

/// No bandwidth limits
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl QuotaDelegate for Unlimited {
    fn quota(&self, _side: Side) -> usize {
        usize::MAX
    }

    fn consumed(&self, _side: Side, _bytes: usize) {}
}

impl QuotaPolicy for Unlimited {
    fn delegate(&self, _transaction: &Transaction) -> Arc<dyn QuotaDelegate> {
        Arc::new(Unlimited)
    }
}
