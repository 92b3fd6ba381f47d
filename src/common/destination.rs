//! Destination - one candidate path toward the origin
//!
//! Destinations are produced by the selector and consumed by the relay.
//! A destination is either the origin itself or a relaying peer that
//! needs an upstream CONNECT before bytes can flow.

use super::Address;

/// Credentials sent to a relaying peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLogin {
    pub username: String,
    pub password: String,
}

/// What sits at the other end of a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    /// The true origin server
    Origin,
    /// An intermediate proxy that must be asked to CONNECT onward
    Peer {
        name: String,
        login: Option<PeerLogin>,
    },
}

/// One network path the relay may try
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Where the transport connection goes
    pub address: Address,
    /// Origin or relaying peer
    pub hop: Hop,
    /// Whether TLS must be negotiated on top of the transport
    pub encrypted: bool,
    /// SNI / verification name; falls back to the address host
    pub server_name: Option<String>,
}

impl Destination {
    /// Plain connection straight to the origin
    pub fn origin(address: Address) -> Self {
        Self {
            address,
            hop: Hop::Origin,
            encrypted: false,
            server_name: None,
        }
    }

    /// Plain connection to a relaying peer
    pub fn peer(name: impl Into<String>, address: Address) -> Self {
        Self {
            address,
            hop: Hop::Peer {
                name: name.into(),
                login: None,
            },
            encrypted: false,
            server_name: None,
        }
    }

    /// Builder: require TLS on this path
    pub fn with_tls(mut self, server_name: Option<String>) -> Self {
        self.encrypted = true;
        self.server_name = server_name;
        self
    }

    /// Builder: attach peer credentials (ignored for origins)
    pub fn with_login(mut self, login: PeerLogin) -> Self {
        if let Hop::Peer { login: slot, .. } = &mut self.hop {
            *slot = Some(login);
        }
        self
    }

    pub fn is_peer(&self) -> bool {
        matches!(self.hop, Hop::Peer { .. })
    }

    /// Name used for TLS SNI and certificate checks
    pub fn tls_name(&self) -> String {
        self.server_name
            .clone()
            .unwrap_or_else(|| self.address.host())
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.encrypted { "tls" } else { "tcp" };
        match &self.hop {
            Hop::Origin => write!(f, "origin {}://{}", scheme, self.address),
            Hop::Peer { name, .. } => write!(f, "peer {} {}://{}", name, scheme, self.address),
        }
    }
}

/// An entry of the selector's candidate stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// An ordinary path to open
    Path(Destination),
    /// Use the connection already pinned to this client instead
    Pinned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_only_applies_to_peers() {
        let login = PeerLogin {
            username: "u".into(),
            password: "p".into(),
        };
        let origin = Destination::origin(Address::domain("example.com", 443)).with_login(login.clone());
        assert_eq!(origin.hop, Hop::Origin);

        let peer = Destination::peer("parent", Address::domain("proxy.local", 3128)).with_login(login.clone());
        assert_eq!(
            peer.hop,
            Hop::Peer {
                name: "parent".into(),
                login: Some(login)
            }
        );
    }

    #[test]
    fn test_tls_name_fallback() {
        let dest = Destination::peer("p", Address::domain("proxy.local", 443)).with_tls(None);
        assert_eq!(dest.tls_name(), "proxy.local");
        let dest = dest.with_tls(Some("sni.example".into()));
        assert_eq!(dest.tls_name(), "sni.example");
        assert_eq!(dest.to_string(), "peer p tls://proxy.local:443");
    }
}
