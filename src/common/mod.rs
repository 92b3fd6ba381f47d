//! Common types and abstractions
//!
//! This module defines the core types used throughout the relay:
//! - Stream: unified async I/O abstraction
//! - Address: network address representation
//! - Transaction: the client request a relay serves
//! - Destination: one candidate path toward the origin
//! - Error: unified error types

mod address;
mod destination;
mod stream;
mod transaction;

pub use address::Address;
pub use destination::{Candidate, Destination, Hop, PeerLogin};
pub use stream::{AsyncReadWrite, IntoStream, Stream};
pub use transaction::{ReplyMode, Side, Transaction};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
