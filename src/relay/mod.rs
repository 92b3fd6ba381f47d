//! Relay - the tunnel engine
//!
//! Flow of one relay:
//! ```text
//! selector ──candidates──> cursor
//!                            ↓
//!   open ──> encrypt? ──> peer CONNECT? ──> commit
//!     ↑          │              │             ↓
//!     └─ retry ──┴──────────────┘      ack (CONNECT) ──> shovel
//! ```
//!
//! Each relay runs as one task. At most one setup stage is in flight, the
//! client is watched for closure while a path is being found, and nothing
//! is retried once the relay committed to a server.

mod cursor;
mod endpoint;
mod shovel;
mod subtask;
mod tunnel;


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::info;

use crate::common::{Destination, IntoStream, Result, Stream, Transaction};
use crate::config::{RelayConfig, TlsSettings};
use crate::protocol::{HttpConnectHandshake, PeerHandshake};
use crate::quota::{QuotaPolicy, Unlimited};
use crate::selector::DestinationSelector;
use crate::session::{Encryptor, TlsEncryptor};
use crate::transport::{PinnedPool, PinnedProvider, TcpOpener, TransportOpener};

use tunnel::Tunnel;

/// An accepted client connection handed to the relay
pub struct Accepted {
    pub stream: Stream,
    /// Bytes already read from the client (past its request head)
    pub pre_read: Bytes,
}

impl Accepted {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            pre_read: Bytes::new(),
        }
    }

    /// Builder: bytes to forward before anything read later
    pub fn with_pre_read(mut self, pre_read: Bytes) -> Self {
        self.pre_read = pre_read;
        self
    }
}

impl From<Stream> for Accepted {
    fn from(stream: Stream) -> Self {
        Self::new(stream)
    }
}

impl From<TcpStream> for Accepted {
    fn from(stream: TcpStream) -> Self {
        Self::new(stream.into_stream())
    }
}

/// A server connection opened before the relay took over
pub struct ServerConnection {
    pub stream: Stream,
    pub destination: Destination,
    /// Bytes already read from the server
    pub leftover: Bytes,
}

/// Outcome of a relay that committed to a path
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub id: u64,
    pub destination: Destination,
    /// Transport attempts made, pinned borrows included
    pub attempts: usize,
    /// The server connection was not freshly opened
    pub reused: bool,
    pub client_to_server: u64,
    pub server_to_client: u64,
    pub duration: Duration,
}

/// Tunnel relay service, shared by all connections of a proxy
pub struct Relay {
    selector: Arc<dyn DestinationSelector>,
    opener: Arc<dyn TransportOpener>,
    encryptor: Arc<dyn Encryptor>,
    handshake: Arc<dyn PeerHandshake>,
    quota: Arc<dyn QuotaPolicy>,
    pinned: Arc<dyn PinnedProvider>,
    config: RelayConfig,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    next_id: AtomicU64,
}

impl Relay {
    pub fn builder(config: RelayConfig, selector: Arc<dyn DestinationSelector>) -> RelayBuilder {
        RelayBuilder {
            config,
            selector,
            opener: None,
            encryptor: None,
            handshake: None,
            quota: None,
            pinned: None,
        }
    }

    /// Find a path for `transaction` and relay bytes until both sides close.
    ///
    /// Returns the terminal error when no path could be committed to; the
    /// client has already been answered or closed by then.
    pub async fn start_relay(
        &self,
        transaction: Transaction,
        client: impl Into<Accepted>,
    ) -> Result<RelayReport> {
        Tunnel::new(self, self.next_id(), transaction, client.into())
            .run()
            .await
    }

    /// Relay between `client` and a server connection opened elsewhere.
    ///
    /// Commits immediately; no acknowledgement is written to the client.
    pub async fn switch_to_relay(
        &self,
        transaction: Transaction,
        client: impl Into<Accepted>,
        server: ServerConnection,
    ) -> Result<RelayReport> {
        Tunnel::new(self, self.next_id(), transaction, client.into())
            .run_switched(server)
            .await
    }

    /// Stop retrying and close running relays
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Relay shutting down");
            let _ = self.shutdown_tx.send(());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

/// Builder for [`Relay`]; unset collaborators get the stock implementations
pub struct RelayBuilder {
    config: RelayConfig,
    selector: Arc<dyn DestinationSelector>,
    opener: Option<Arc<dyn TransportOpener>>,
    encryptor: Option<Arc<dyn Encryptor>>,
    handshake: Option<Arc<dyn PeerHandshake>>,
    quota: Option<Arc<dyn QuotaPolicy>>,
    pinned: Option<Arc<dyn PinnedProvider>>,
}

impl RelayBuilder {
    pub fn opener(mut self, opener: Arc<dyn TransportOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn handshake(mut self, handshake: Arc<dyn PeerHandshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaPolicy>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn pinned(mut self, pinned: Arc<dyn PinnedProvider>) -> Self {
        self.pinned = Some(pinned);
        self
    }

    pub fn build(self) -> Result<Relay> {
        let encryptor: Arc<dyn Encryptor> = match self.encryptor {
            Some(encryptor) => encryptor,
            None => Arc::new(TlsEncryptor::new(&TlsSettings::default())?),
        };
        let pinned: Arc<dyn PinnedProvider> = match self.pinned {
            Some(pinned) => pinned,
            None => Arc::new(PinnedPool::new(self.config.pinned_idle())),
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Relay {
            selector: self.selector,
            opener: self.opener.unwrap_or_else(|| Arc::new(TcpOpener::new())),
            encryptor,
            handshake: self
                .handshake
                .unwrap_or_else(|| Arc::new(HttpConnectHandshake::new())),
            quota: self.quota.unwrap_or_else(|| Arc::new(Unlimited)),
            pinned,
            config: self.config,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        })
    }
}
