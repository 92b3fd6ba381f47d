//! Pinned connections with idle expiry
//!
//! A pinned connection is dedicated to one client (connection-oriented
//! authentication, bumped flows). The selector may tell the relay to use
//! it instead of opening a new path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{Address, Destination, Result, Stream, Transaction};
use crate::error::Error;

/// Default idle timeout for pinned connections (90 seconds)
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// A connection borrowed from the pinned store
pub struct PinnedConnection {
    pub stream: Stream,
    /// The path this connection was opened to
    pub destination: Destination,
    /// TLS was already negotiated on this connection
    pub secured: bool,
}

/// Provider of connections pinned to a client
pub trait PinnedProvider: Send + Sync {
    fn borrow_pinned(&self, transaction: &Transaction) -> Result<PinnedConnection>;
}

/// A pinned connection with metadata
struct PinnedEntry {
    connection: PinnedConnection,
    pinned_at: Instant,
}

impl PinnedEntry {
    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.pinned_at.elapsed() > idle_timeout
    }
}

/// Pinned connections keyed by client address
pub struct PinnedPool {
    idle_timeout: Duration,
    entries: Mutex<HashMap<Address, PinnedEntry>>,
}

impl PinnedPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a connection to a client, replacing any previous one
    pub fn pin(&self, client: Address, connection: PinnedConnection) {
        debug!("Pinned: {} -> {}", client, connection.destination);
        self.entries.lock().insert(
            client,
            PinnedEntry {
                connection,
                pinned_at: Instant::now(),
            },
        );
    }

    /// Whether a live connection is pinned to `client`
    pub fn is_pinned(&self, client: &Address) -> bool {
        self.entries
            .lock()
            .get(client)
            .map(|e| !e.is_expired(self.idle_timeout))
            .unwrap_or(false)
    }

    /// Drop expired entries
    pub fn cleanup(&self) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(self.idle_timeout));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Pinned: cleaned up {} expired connections", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PinnedPool {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl PinnedProvider for PinnedPool {
    fn borrow_pinned(&self, transaction: &Transaction) -> Result<PinnedConnection> {
        let entry = self
            .entries
            .lock()
            .remove(&transaction.client)
            .ok_or_else(|| Error::Transport(format!("No pinned connection for {}", transaction.client)))?;

        if entry.is_expired(self.idle_timeout) {
            trace!("Pinned: connection for {} expired", transaction.client);
            return Err(Error::Transport(format!(
                "Pinned connection for {} expired",
                transaction.client
            )));
        }

        Ok(entry.connection)
    }
}
