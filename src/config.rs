//! Configuration for the tunnel relay
//!
//! JSON file with one section per concern. Every field has a default, so
//! `{}` is a valid configuration: listen on 127.0.0.1:3128, go direct.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::{Address, Destination, PeerLogin};
use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Address the CONNECT listener binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Retry, timeout and buffer settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Relaying peers, tried in order before origin addresses
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Allow connecting straight to the origin
    #[serde(default = "default_true")]
    pub direct: bool,

    /// Try origin addresses before peers
    #[serde(default)]
    pub prefer_direct: bool,

    /// Client TLS toward encrypted peers
    #[serde(default)]
    pub tls: TlsSettings,

    /// Per-client bandwidth shaping (absent: unlimited)
    #[serde(default)]
    pub quota: Option<QuotaConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            listen: default_listen(),
            relay: RelayConfig::default(),
            peers: Vec::new(),
            direct: true,
            prefer_direct: false,
            tls: TlsSettings::default(),
            quota: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.max_attempts == 0 {
            return Err(Error::Config("relay.max_attempts must be at least 1".into()));
        }
        if self.relay.buffer_size == 0 {
            return Err(Error::Config("relay.buffer_size must be positive".into()));
        }
        if self.peers.is_empty() && !self.direct {
            return Err(Error::Config(
                "No forwarding paths: add a peer or enable direct".into(),
            ));
        }
        for peer in &self.peers {
            if peer.name.is_empty() {
                return Err(Error::Config("Peer name must not be empty".into()));
            }
            if peer.username.is_some() != peer.password.is_some() {
                return Err(Error::Config(format!(
                    "Peer {}: username and password go together",
                    peer.name
                )));
            }
        }
        Ok(())
    }

    /// Sample configuration printed by `--gen-config`
    pub fn sample() -> Self {
        Config {
            peers: vec![PeerConfig {
                name: "parent".to_string(),
                address: "proxy.example.com".to_string(),
                port: 3128,
                tls: false,
                server_name: None,
                username: None,
                password: None,
            }],
            quota: Some(QuotaConfig::default()),
            ..Default::default()
        }
    }

    /// Candidate destinations for the configured peers
    pub fn peer_destinations(&self) -> Vec<Destination> {
        self.peers.iter().map(PeerConfig::to_destination).collect()
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3128))
}

fn default_true() -> bool {
    true
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Relay behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on transport attempts per relay
    pub max_attempts: usize,

    /// Timeout of one transport open (and of each setup stage), in seconds
    pub connect_timeout_secs: u64,

    /// Budget for finding a working path, counted from transaction start
    pub forward_timeout_secs: u64,

    /// Idle-read timeout once bytes flow, in seconds
    pub read_timeout_secs: u64,

    /// Largest single read
    pub buffer_size: usize,

    /// Back-off when the quota grants a single byte, in milliseconds
    pub quota_delay_ms: u64,

    /// Consecutive back-offs before reading anyway
    pub quota_delay_loops: u32,

    /// Peer statuses that end the relay instead of trying the next path
    pub non_retriable_statuses: Vec<u16>,

    /// Idle expiry of pinned connections, in seconds
    pub pinned_idle_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            connect_timeout_secs: 60,
            forward_timeout_secs: 240,
            read_timeout_secs: 900,
            buffer_size: 32 * 1024,
            quota_delay_ms: 300,
            quota_delay_loops: 10,
            non_retriable_statuses: vec![401, 403, 407],
            pinned_idle_secs: 90,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn quota_delay(&self) -> Duration {
        Duration::from_millis(self.quota_delay_ms)
    }

    pub fn pinned_idle(&self) -> Duration {
        Duration::from_secs(self.pinned_idle_secs)
    }

    pub fn is_non_retriable(&self, status: u16) -> bool {
        self.non_retriable_statuses.contains(&status)
    }
}

/// A relaying peer (next-hop proxy)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Name used in logs
    pub name: String,

    /// Host name or IP of the peer
    pub address: String,

    pub port: u16,

    /// Negotiate TLS with the peer
    #[serde(default)]
    pub tls: bool,

    /// SNI override (defaults to `address`)
    #[serde(default)]
    pub server_name: Option<String>,

    /// Basic credentials for the upstream CONNECT
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl PeerConfig {
    pub fn to_destination(&self) -> Destination {
        let address = match self.address.parse() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, self.port)),
            Err(_) => Address::domain(self.address.clone(), self.port),
        };

        let mut destination = Destination::peer(self.name.clone(), address);
        if self.tls {
            destination = destination.with_tls(self.server_name.clone());
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            destination = destination.with_login(PeerLogin {
                username: username.clone(),
                password: password.clone(),
            });
        }
        destination
    }
}

/// Client TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Skip certificate verification (self-signed peers)
    #[serde(default)]
    pub allow_insecure: bool,

    /// ALPN protocols to offer
    #[serde(default)]
    pub alpn: Vec<String>,

    /// Extra PEM file with trusted CA certificates
    #[serde(default)]
    pub ca_file: Option<String>,
}

/// Per-client bandwidth shaping, in bytes per second
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Rate of reads from the client (0: unlimited)
    pub client_rate: u64,

    /// Rate of reads from the server (0: unlimited)
    pub server_rate: u64,

    /// Bucket size
    pub burst: u64,

    /// Client IPs tracked at once; least recently seen are forgotten
    pub max_tracked_clients: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            client_rate: 0,
            server_rate: 1024 * 1024,
            burst: 256 * 1024,
            max_tracked_clients: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Hop;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.relay.max_attempts, 25);
        assert_eq!(config.relay.forward_timeout(), Duration::from_secs(240));
        assert!(config.relay.is_non_retriable(407));
        assert!(!config.relay.is_non_retriable(502));
        assert!(config.direct);
        assert!(config.quota.is_none());
    }

    #[test]
    fn test_sample_round_trips() {
        let json = serde_json::to_string_pretty(&Config::sample()).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.peers.len(), 1);
        assert!(parsed.quota.is_some());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let result = Config::from_json(r#"{"relay": {"max_attempts": 0}}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_requires_a_path() {
        let result = Config::from_json(r#"{"direct": false}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_peer_destination() {
        let config = Config::from_json(
            r#"{
                "peers": [{
                    "name": "parent",
                    "address": "10.1.1.1",
                    "port": 8443,
                    "tls": true,
                    "server_name": "parent.example",
                    "username": "u",
                    "password": "p"
                }]
            }"#,
        )
        .unwrap();

        let dest = &config.peer_destinations()[0];
        assert_eq!(dest.address, Address::Socket("10.1.1.1:8443".parse().unwrap()));
        assert!(dest.encrypted);
        assert_eq!(dest.tls_name(), "parent.example");
        assert!(matches!(&dest.hop, Hop::Peer { login: Some(_), .. }));
    }
}
