//! Transaction - the client request a relay serves
//!
//! Built by the surrounding proxy once it has decided to tunnel.
//! The relay reads it, never mutates it.

use std::time::Instant;

use super::Address;

/// How the client expects to learn the tunnel outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// User-visible CONNECT: send "connection established" or an error reply
    Acknowledge,
    /// Silently bumped connection: the client gets bytes or a closed socket
    Silent,
}

impl ReplyMode {
    pub fn expects_reply(self) -> bool {
        matches!(self, ReplyMode::Acknowledge)
    }
}

/// Which side of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// Context of one tunneled request
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Address of the client that asked for the tunnel
    pub client: Address,
    /// Authority the client wants to reach
    pub target: Address,
    /// Whether the client expects an explicit reply
    pub reply: ReplyMode,
    /// When the proxy started working on this request; bounds forwarding time
    pub started: Instant,
}

impl Transaction {
    /// New CONNECT-style transaction that owes the client a reply
    pub fn connect(client: Address, target: Address) -> Self {
        Self {
            client,
            target,
            reply: ReplyMode::Acknowledge,
            started: Instant::now(),
        }
    }

    /// Builder: set reply mode
    pub fn with_reply(mut self, reply: ReplyMode) -> Self {
        self.reply = reply;
        self
    }

    /// Builder: set start time
    pub fn with_started(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }
}
