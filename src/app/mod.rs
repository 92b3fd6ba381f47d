//! Application Layer
//!
//! This module contains:
//! - Runtime: configuration-driven listener feeding the relay
//! - Metrics: Prometheus counters for relays, attempts and traffic

pub mod metrics;
mod runtime;

pub use runtime::Runtime;
