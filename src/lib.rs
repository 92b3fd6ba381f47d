//! Tunnel Relay - the byte-tunnel engine of a forwarding proxy
//!
//! # Architecture (Layered)
//!
//! ```text
//! Selector (candidate paths)
//! → Transport (TCP open)
//! → Session (TLS toward encrypted peers)
//! → Protocol (CONNECT through relaying peers)
//! → Relay (commit, acknowledge, shovel bytes)
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - All layers abstracted via traits, so the relay can be driven by mocks
//! - Nothing is retried once the relay committed to a server
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, Destination, Transaction
//! ├── transport/       # Transport openers, pinned connections
//! ├── session/         # TLS negotiation
//! ├── protocol/        # Peer CONNECT handshake, client reply lines
//! ├── selector/        # Destination selection
//! ├── quota/           # Per-client bandwidth delegates
//! ├── relay/           # Relay, endpoints, byte shovel
//! └── app/             # Runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod session;
pub mod protocol;
pub mod selector;
pub mod quota;
pub mod relay;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, Candidate, Destination, ReplyMode, Side, Stream, Transaction};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use app::Runtime;
pub use protocol::PeerHandshake;
pub use quota::{QuotaDelegate, QuotaPolicy};
pub use relay::{Accepted, Relay, RelayReport, ServerConnection};
pub use selector::{DestinationSelector, DestinationSink};
pub use session::Encryptor;
pub use transport::{PinnedProvider, TransportOpener};
